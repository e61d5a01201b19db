use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use crate::protocol::FramingError;

use super::lock;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is disposed")]
    Disposed,
    #[error("no destination address for datagram")]
    NoDestination,
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised on background threads, waiting for the owner to drain them
/// on its own thread.
#[derive(Debug, Clone, Default)]
pub struct ErrorQueue {
    inner: Arc<Mutex<VecDeque<String>>>,
}

impl ErrorQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, error: impl Into<String>) {
        lock(&self.inner).push_back(error.into());
    }

    pub fn drain(&self) -> Vec<String> {
        lock(&self.inner).drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_empties_queue_in_order() {
        let queue = ErrorQueue::new();
        let producer = queue.clone();

        std::thread::spawn(move || {
            producer.push("connection reset");
            producer.push("not connected");
        })
        .join()
        .unwrap();

        assert!(!queue.is_empty());
        assert_eq!(queue.drain(), vec!["connection reset", "not connected"]);
        assert!(queue.is_empty());
    }
}

//! Socket transports. Each transport owns one OS socket and two background
//! threads; the owning thread only ever touches queues.

mod datagram;
mod error;
mod router;
mod stats;
mod stream;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::protocol::Message;

pub use datagram::DatagramTransport;
pub use error::{ErrorQueue, TransportError};
pub use router::DatagramRouter;
pub use stats::{NetworkStats, PacketLossSimulation};
pub use stream::StreamTransport;

/// Upper bound on how long a background thread goes without checking
/// whether its transport was disposed.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Called on a background thread for every decoded message.
pub type ReceiveHandler = Arc<dyn Fn(Message, SocketAddr) + Send + Sync>;

pub trait SocketTransport: Send + Sync {
    /// Queues `message` until the next [SocketTransport::flush]. Datagram
    /// transports without a default peer need an explicit `destination`.
    fn send(&self, message: &Message, destination: Option<SocketAddr>)
    -> Result<(), TransportError>;

    /// Hands everything queued so far to the send thread as one batch.
    fn flush(&self);

    /// Stops the transport. Idempotent; no receive callback runs once this
    /// returns.
    fn dispose(&self);

    fn is_disposed(&self) -> bool;

    fn errors(&self) -> &ErrorQueue;

    fn stats(&self) -> NetworkStats;

    fn local_addr(&self) -> SocketAddr;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::protocol::Message;

use super::{ReceiveHandler, lock};

/// Fans datagrams arriving on one shared socket out to per-connection
/// queues, keyed by source address. Datagrams from unknown sources go to
/// the unrouted queue, where handshakes are picked up.
#[derive(Clone)]
pub struct DatagramRouter {
    routes: Arc<RwLock<HashMap<SocketAddr, Sender<Message>>>>,
    unrouted: Arc<Mutex<Sender<(Message, SocketAddr)>>>,
}

impl DatagramRouter {
    pub fn new() -> (Self, Receiver<(Message, SocketAddr)>) {
        let (unrouted_tx, unrouted_rx) = mpsc::channel();
        let router = Self {
            routes: Arc::new(RwLock::new(HashMap::new())),
            unrouted: Arc::new(Mutex::new(unrouted_tx)),
        };
        (router, unrouted_rx)
    }

    pub fn route(&self, addr: SocketAddr, queue: Sender<Message>) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, queue);
    }

    pub fn unroute(&self, addr: &SocketAddr) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(addr);
    }

    pub fn dispatch(&self, message: Message, from: SocketAddr) {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        match routes.get(&from) {
            Some(queue) => {
                if queue.send(message).is_err() {
                    log::debug!("Dropping datagram for closed connection at {}", from);
                }
            }
            None => {
                let _ = lock(&self.unrouted).send((message, from));
            }
        }
    }

    pub fn handler(&self) -> ReceiveHandler {
        let router = self.clone();
        Arc::new(move |message, from| router.dispatch(message, from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Ping;

    #[test]
    fn routes_known_sources_and_queues_the_rest() {
        let (router, unrouted) = DatagramRouter::new();
        let known: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let stranger: SocketAddr = "10.0.0.2:5000".parse().unwrap();

        let (tx, rx) = mpsc::channel();
        router.route(known, tx);

        let ping = Message::Ping(Ping { sent_at_micros: 3 });
        router.dispatch(ping.clone(), known);
        router.dispatch(ping.clone(), stranger);

        assert_eq!(rx.try_recv().unwrap(), ping);
        assert_eq!(unrouted.try_recv().unwrap(), (ping.clone(), stranger));

        router.unroute(&known);
        router.dispatch(ping, known);
        assert!(rx.try_recv().is_err());
        assert_eq!(unrouted.try_recv().unwrap().1, known);
    }
}

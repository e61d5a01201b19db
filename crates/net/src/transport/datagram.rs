use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::protocol::{MAX_MESSAGE_SIZE, Message, decode_datagram};

use super::stats::StatsCounters;
use super::stream::join_unless_current;
use super::{
    ErrorQueue, NetworkStats, PacketLossSimulation, POLL_INTERVAL, ReceiveHandler,
    SocketTransport, TransportError, lock,
};

/// Largest datagram a UDP socket can carry.
const MAX_DATAGRAM_SIZE: usize = 65_507;

#[derive(Default)]
struct Outbound {
    /// Frames packed into datagrams, per destination.
    pending: HashMap<SocketAddr, Vec<PendingDatagram>>,
    flush_requested: bool,
}

#[derive(Default)]
struct PendingDatagram {
    bytes: Vec<u8>,
    messages: u64,
}

impl Outbound {
    fn queue(&mut self, destination: SocketAddr, message: &Message) -> Result<(), TransportError> {
        let mut frame = Vec::new();
        message.encode_into(&mut frame)?;

        let datagrams = self.pending.entry(destination).or_default();
        let fits = datagrams
            .last()
            .is_some_and(|last| last.bytes.len() + frame.len() <= MAX_MESSAGE_SIZE);
        if !fits {
            datagrams.push(PendingDatagram::default());
        }
        if let Some(last) = datagrams.last_mut() {
            last.bytes.extend_from_slice(&frame);
            last.messages += 1;
        }
        Ok(())
    }
}

struct Shared {
    disposed: AtomicBool,
    outbound: Mutex<Outbound>,
    wake: Condvar,
    errors: ErrorQueue,
    stats: StatsCounters,
    loss_simulation: Mutex<PacketLossSimulation>,
}

/// Unreliable transport over one UDP socket. Several frames bound for the
/// same destination are packed into one datagram.
pub struct DatagramTransport {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    default_destination: Mutex<Option<SocketAddr>>,
    send_thread: Mutex<Option<JoinHandle<()>>>,
    receive_thread: Mutex<Option<JoinHandle<()>>>,
}

impl DatagramTransport {
    pub fn bind<A: ToSocketAddrs>(addr: A, handler: ReceiveHandler) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let local_addr = socket.local_addr()?;
        let receiver = socket.try_clone()?;

        let shared = Arc::new(Shared {
            disposed: AtomicBool::new(false),
            outbound: Mutex::new(Outbound::default()),
            wake: Condvar::new(),
            errors: ErrorQueue::new(),
            stats: StatsCounters::default(),
            loss_simulation: Mutex::new(PacketLossSimulation::default()),
        });

        let send_shared = Arc::clone(&shared);
        let send_thread = thread::Builder::new()
            .name(format!("datagram-send {local_addr}"))
            .spawn(move || send_loop(send_shared, socket))?;

        let receive_shared = Arc::clone(&shared);
        let receive_thread = thread::Builder::new()
            .name(format!("datagram-recv {local_addr}"))
            .spawn(move || receive_loop(receive_shared, receiver, handler))?;

        log::debug!("Datagram transport bound to {}", local_addr);

        Ok(Self {
            shared,
            local_addr,
            default_destination: Mutex::new(None),
            send_thread: Mutex::new(Some(send_thread)),
            receive_thread: Mutex::new(Some(receive_thread)),
        })
    }

    /// Destination used by sends that don't name one.
    pub fn set_default_destination(&self, addr: SocketAddr) {
        *lock(&self.default_destination) = Some(addr);
    }

    pub fn set_packet_loss_simulation(&self, simulation: PacketLossSimulation) {
        *lock(&self.shared.loss_simulation) = simulation;
    }
}

impl SocketTransport for DatagramTransport {
    fn send(&self, message: &Message, destination: Option<SocketAddr>) -> Result<(), TransportError> {
        let destination = destination
            .or(*lock(&self.default_destination))
            .ok_or(TransportError::NoDestination)?;

        let mut outbound = lock(&self.shared.outbound);
        if self.shared.disposed.load(Ordering::Acquire) {
            return Err(TransportError::Disposed);
        }
        outbound.queue(destination, message)
    }

    fn flush(&self) {
        let mut outbound = lock(&self.shared.outbound);
        if outbound.pending.is_empty() {
            return;
        }
        outbound.flush_requested = true;
        self.shared.wake.notify_one();
    }

    fn dispose(&self) {
        {
            let mut outbound = lock(&self.shared.outbound);
            if self.shared.disposed.swap(true, Ordering::AcqRel) {
                return;
            }
            outbound.flush_requested = true;
        }
        self.shared.wake.notify_all();

        join_unless_current(&self.send_thread);
        join_unless_current(&self.receive_thread);

        log::debug!("Datagram transport on {} disposed", self.local_addr);
    }

    fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    fn errors(&self) -> &ErrorQueue {
        &self.shared.errors
    }

    fn stats(&self) -> NetworkStats {
        self.shared.stats.snapshot()
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for DatagramTransport {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn send_loop(shared: Arc<Shared>, socket: UdpSocket) {
    loop {
        let (pending, disposed) = {
            let mut outbound = lock(&shared.outbound);
            while !outbound.flush_requested && !shared.disposed.load(Ordering::Acquire) {
                outbound = match shared.wake.wait_timeout(outbound, POLL_INTERVAL) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            }
            outbound.flush_requested = false;
            (
                std::mem::take(&mut outbound.pending),
                shared.disposed.load(Ordering::Acquire),
            )
        };

        let simulation = lock(&shared.loss_simulation).clone();
        for (destination, datagrams) in pending {
            for datagram in datagrams {
                if simulation.should_drop() {
                    shared.stats.record_dropped();
                    continue;
                }
                match socket.send_to(&datagram.bytes, destination) {
                    Ok(bytes) => shared.stats.record_sent(datagram.messages, bytes),
                    Err(e) => {
                        if !disposed {
                            shared
                                .errors
                                .push(format!("datagram to {} failed: {}", destination, e));
                        }
                    }
                }
            }
        }

        if disposed {
            return;
        }
    }
}

fn receive_loop(shared: Arc<Shared>, socket: UdpSocket, handler: ReceiveHandler) {
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

    while !shared.disposed.load(Ordering::Acquire) {
        match socket.recv_from(&mut buffer) {
            Ok((size, from)) => match decode_datagram(&buffer[..size]) {
                Ok(messages) => {
                    shared.stats.record_received(messages.len() as u64, size);
                    for message in messages {
                        if shared.disposed.load(Ordering::Acquire) {
                            return;
                        }
                        handler(message, from);
                    }
                }
                Err(e) => {
                    shared.stats.record_discarded();
                    log::warn!("Discarding corrupt datagram from {}: {}", from, e);
                }
            },
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                if !shared.disposed.load(Ordering::Acquire) {
                    shared.errors.push(format!("datagram receive failed: {}", e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Ping, Pong};
    use std::sync::mpsc;
    use std::time::Duration;

    fn collecting() -> (ReceiveHandler, mpsc::Receiver<(Message, SocketAddr)>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handler: ReceiveHandler = Arc::new(move |message, from| {
            let _ = lock(&tx).send((message, from));
        });
        (handler, rx)
    }

    #[test]
    fn batched_frames_share_a_datagram() {
        let (handler, rx) = collecting();
        let receiver = DatagramTransport::bind("127.0.0.1:0", handler).unwrap();
        let sender = DatagramTransport::bind("127.0.0.1:0", Arc::new(|_, _| {})).unwrap();

        let destination = receiver.local_addr();
        sender
            .send(&Message::Ping(Ping { sent_at_micros: 1 }), Some(destination))
            .unwrap();
        sender
            .send(
                &Message::Pong(Pong {
                    ping_sent_at_micros: 1,
                    game_time_micros: 2,
                    frame_number: 3,
                }),
                Some(destination),
            )
            .unwrap();
        sender.flush();

        let (first, from) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let (second, _) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(from, sender.local_addr());
        assert!(matches!(first, Message::Ping(_)));
        assert!(matches!(second, Message::Pong(_)));

        let stats = sender.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.datagrams_dropped, 0);
    }

    #[test]
    fn corrupt_datagram_is_discarded_not_fatal() {
        let (handler, rx) = collecting();
        let receiver = DatagramTransport::bind("127.0.0.1:0", handler).unwrap();

        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.send_to(&[1, 2, 3, 4, 5, 6, 7, 8, 9], receiver.local_addr())
            .unwrap();

        let mut good = Vec::new();
        Message::Ping(Ping { sent_at_micros: 9 })
            .encode_into(&mut good)
            .unwrap();
        raw.send_to(&good, receiver.local_addr()).unwrap();

        let (message, _) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(message, Message::Ping(Ping { sent_at_micros: 9 }));
        assert_eq!(receiver.stats().datagrams_discarded, 1);
        assert!(receiver.errors().is_empty());
    }

    #[test]
    fn send_without_destination_fails() {
        let transport = DatagramTransport::bind("127.0.0.1:0", Arc::new(|_, _| {})).unwrap();
        assert!(matches!(
            transport.send(&Message::Ping(Ping { sent_at_micros: 0 }), None),
            Err(TransportError::NoDestination)
        ));
    }

    #[test]
    fn simulated_loss_drops_everything() {
        let (handler, rx) = collecting();
        let receiver = DatagramTransport::bind("127.0.0.1:0", handler).unwrap();
        let sender = DatagramTransport::bind("127.0.0.1:0", Arc::new(|_, _| {})).unwrap();
        sender.set_packet_loss_simulation(PacketLossSimulation::dropping(100.0));
        sender.set_default_destination(receiver.local_addr());

        sender
            .send(&Message::Ping(Ping { sent_at_micros: 1 }), None)
            .unwrap();
        sender.flush();

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        sender.dispose();
        assert_eq!(sender.stats().datagrams_dropped, 1);
    }
}

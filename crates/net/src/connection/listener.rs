use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::protocol::{HandshakeDatagram, HandshakeReply, Message, PROTOCOL_VERSION};
use crate::transport::{
    DatagramRouter, DatagramTransport, PacketLossSimulation, SocketTransport, StreamTransport,
    lock,
};

use super::peer::DatagramPath;
use super::{Connection, ConnectionId, HandshakeError};

const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Result of one listener poll.
pub enum ListenerEvent {
    Established(Connection),
    Failed {
        peer: SocketAddr,
        error: HandshakeError,
    },
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    pub packet_loss: PacketLossSimulation,
}

enum Stage {
    AwaitingDatagram,
    AwaitingAck {
        id: ConnectionId,
        datagram_addr: SocketAddr,
    },
}

struct PendingAttempt {
    peer: SocketAddr,
    stream: Arc<StreamTransport>,
    inbound_tx: Sender<Message>,
    inbound: Receiver<Message>,
    backlog: Vec<Message>,
    started: Instant,
    stage: Stage,
}

/// Accepts stream connections on a port and walks each through the
/// handshake. The datagram socket bound to the same port number is shared
/// by every connection it produces.
pub struct ConnectionAttemptListener {
    local_addr: SocketAddr,
    config: ListenerConfig,
    disposed: Arc<AtomicBool>,
    accepted: Receiver<TcpStream>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    datagram: Arc<DatagramTransport>,
    router: DatagramRouter,
    unrouted: Receiver<(Message, SocketAddr)>,
    pending: Vec<PendingAttempt>,
}

impl ConnectionAttemptListener {
    pub fn bind<A: ToSocketAddrs>(addr: A, config: ListenerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let (router, unrouted) = DatagramRouter::new();
        let datagram = DatagramTransport::bind(local_addr, router.handler())?;
        datagram.set_packet_loss_simulation(config.packet_loss.clone());

        let disposed = Arc::new(AtomicBool::new(false));
        let (accepted_tx, accepted) = mpsc::channel();
        let accept_disposed = Arc::clone(&disposed);
        let accept_thread = thread::Builder::new()
            .name(format!("accept {local_addr}"))
            .spawn(move || accept_loop(listener, accepted_tx, accept_disposed))?;

        log::info!("Listening for connections on {}", local_addr);

        Ok(Self {
            local_addr,
            config,
            disposed,
            accepted,
            accept_thread: Mutex::new(Some(accept_thread)),
            datagram: Arc::new(datagram),
            router,
            unrouted,
            pending: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The shared datagram socket, for flushing and statistics.
    pub fn datagram(&self) -> &Arc<DatagramTransport> {
        &self.datagram
    }

    /// Advances every pending attempt. Call once per frame.
    pub fn poll(&mut self, now: Instant) -> Vec<ListenerEvent> {
        let mut events = Vec::new();
        if self.disposed.load(Ordering::Acquire) {
            return events;
        }

        self.take_accepted(now, &mut events);
        self.take_datagrams(&mut events);
        self.take_acks(&mut events);
        self.expire(now, &mut events);

        self.datagram.flush();
        events
    }

    fn take_accepted(&mut self, now: Instant, events: &mut Vec<ListenerEvent>) {
        while let Ok(stream) = self.accepted.try_recv() {
            let peer = match stream.peer_addr() {
                Ok(peer) => peer,
                Err(e) => {
                    log::warn!("Dropping accepted stream without peer address: {}", e);
                    continue;
                }
            };

            let (inbound_tx, inbound) = mpsc::channel();
            let handler_tx = inbound_tx.clone();
            let stream = match StreamTransport::new(
                stream,
                Arc::new(move |message, _| {
                    let _ = handler_tx.send(message);
                }),
            ) {
                Ok(stream) => stream,
                Err(e) => {
                    events.push(ListenerEvent::Failed {
                        peer,
                        error: e.into(),
                    });
                    continue;
                }
            };

            log::debug!("Accepted stream from {}", peer);
            self.pending.push(PendingAttempt {
                peer,
                stream: Arc::new(stream),
                inbound_tx,
                inbound,
                backlog: Vec::new(),
                started: now,
                stage: Stage::AwaitingDatagram,
            });
        }
    }

    fn take_datagrams(&mut self, events: &mut Vec<ListenerEvent>) {
        while let Ok((message, from)) = self.unrouted.try_recv() {
            let Message::HandshakeDatagram(handshake) = message else {
                log::debug!(
                    "Ignoring {:?} from unknown source {}",
                    message.message_type(),
                    from
                );
                continue;
            };

            let Some(index) = self.pending.iter().position(|attempt| {
                attempt.peer.ip() == from.ip() && attempt.peer.port() == handshake.stream_port
            }) else {
                log::debug!("Handshake datagram from {} matches no pending stream", from);
                continue;
            };

            if let Some(error) = self.answer_handshake(index, &handshake, from) {
                let attempt = self.pending.swap_remove(index);
                events.push(self.fail(attempt, error));
            }
        }
    }

    fn answer_handshake(
        &mut self,
        index: usize,
        handshake: &HandshakeDatagram,
        from: SocketAddr,
    ) -> Option<HandshakeError> {
        if handshake.protocol_version != PROTOCOL_VERSION {
            return Some(HandshakeError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: handshake.protocol_version,
            });
        }

        let attempt = &mut self.pending[index];
        if !matches!(attempt.stage, Stage::AwaitingDatagram) {
            return None;
        }

        // Later datagrams from this source land in the attempt's own queue.
        let id = ConnectionId::next();
        self.router.route(from, attempt.inbound_tx.clone());
        attempt.stage = Stage::AwaitingAck {
            id,
            datagram_addr: from,
        };

        let reply = Message::HandshakeReply(HandshakeReply { connection_id: id.0 });
        self.datagram.send(&reply, Some(from)).err().map(HandshakeError::from)
    }

    fn take_acks(&mut self, events: &mut Vec<ListenerEvent>) {
        let mut index = 0;
        while index < self.pending.len() {
            match self.check_ack(index) {
                AckProgress::Waiting => index += 1,
                AckProgress::Acknowledged { id, datagram_addr } => {
                    let attempt = self.pending.swap_remove(index);
                    let connection = self.establish(attempt, id, datagram_addr);
                    events.push(ListenerEvent::Established(connection));
                }
                AckProgress::Failed(error) => {
                    let attempt = self.pending.swap_remove(index);
                    events.push(self.fail(attempt, error));
                }
            }
        }
    }

    fn check_ack(&mut self, index: usize) -> AckProgress {
        let attempt = &mut self.pending[index];

        if let Some(error) = attempt.stream.errors().drain().into_iter().next() {
            return AckProgress::Failed(HandshakeError::Transport(error));
        }

        while let Ok(message) = attempt.inbound.try_recv() {
            match (&attempt.stage, message) {
                (&Stage::AwaitingAck { id, datagram_addr }, Message::HandshakeAck(ack)) => {
                    if ack.connection_id != id.0 {
                        return AckProgress::Failed(HandshakeError::UnexpectedConnectionId(
                            ack.connection_id,
                        ));
                    }
                    return AckProgress::Acknowledged { id, datagram_addr };
                }
                (&Stage::AwaitingAck { id, datagram_addr }, Message::HandshakeDatagram(_)) => {
                    // Our reply was lost; the client is still resending.
                    let reply = Message::HandshakeReply(HandshakeReply { connection_id: id.0 });
                    if let Err(e) = self.datagram.send(&reply, Some(datagram_addr)) {
                        return AckProgress::Failed(e.into());
                    }
                }
                (Stage::AwaitingAck { .. }, message) => attempt.backlog.push(message),
                (Stage::AwaitingDatagram, message) => {
                    log::debug!(
                        "Ignoring {:?} from {} before handshake",
                        message.message_type(),
                        attempt.peer
                    );
                }
            }
        }
        AckProgress::Waiting
    }

    fn establish(
        &self,
        attempt: PendingAttempt,
        id: ConnectionId,
        datagram_addr: SocketAddr,
    ) -> Connection {
        let PendingAttempt {
            peer,
            stream,
            inbound,
            backlog,
            ..
        } = attempt;

        log::info!(
            "Connection {} established with {} (datagrams from {})",
            id,
            peer,
            datagram_addr
        );

        Connection::new(
            id,
            stream,
            peer,
            DatagramPath::Shared {
                transport: self.datagram.clone(),
                router: self.router.clone(),
            },
            datagram_addr,
            inbound,
            self.config.ping_interval,
        )
        .with_backlog(backlog)
    }

    fn expire(&mut self, now: Instant, events: &mut Vec<ListenerEvent>) {
        let timeout = self.config.handshake_timeout;
        let mut index = 0;
        while index < self.pending.len() {
            if now.saturating_duration_since(self.pending[index].started) > timeout {
                let attempt = self.pending.swap_remove(index);
                events.push(self.fail(attempt, HandshakeError::TimedOut(timeout)));
            } else {
                index += 1;
            }
        }
    }

    fn fail(&self, attempt: PendingAttempt, error: HandshakeError) -> ListenerEvent {
        log::info!("Connection attempt from {} failed: {}", attempt.peer, error);
        attempt.stream.dispose();
        if let Stage::AwaitingAck { datagram_addr, .. } = attempt.stage {
            self.router.unroute(&datagram_addr);
        }
        ListenerEvent::Failed {
            peer: attempt.peer,
            error,
        }
    }

    /// Stops accepting, abandons every pending attempt and closes the shared
    /// datagram socket. Established connections routed through that socket
    /// lose their datagram path, so dispose them first.
    pub fn dispose(&mut self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(handle) = lock(&self.accept_thread).take() {
            if handle.join().is_err() {
                log::error!("Accept thread panicked");
            }
        }

        for attempt in self.pending.drain(..) {
            attempt.stream.dispose();
        }
        self.datagram.dispose();
        log::info!("Stopped listening on {}", self.local_addr);
    }
}

impl Drop for ConnectionAttemptListener {
    fn drop(&mut self) {
        self.dispose();
    }
}

enum AckProgress {
    Waiting,
    Acknowledged {
        id: ConnectionId,
        datagram_addr: SocketAddr,
    },
    Failed(HandshakeError),
}

fn accept_loop(listener: TcpListener, accepted: Sender<TcpStream>, disposed: Arc<AtomicBool>) {
    while !disposed.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    log::warn!("Failed to configure accepted stream: {}", e);
                    continue;
                }
                if accepted.send(stream).is_err() {
                    return;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                log::warn!("Accept failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

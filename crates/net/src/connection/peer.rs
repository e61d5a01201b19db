use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use crate::ping::PingInfo;
use crate::protocol::{Channel, Message};
use crate::transport::{DatagramRouter, NetworkStats, SocketTransport, TransportError};

use super::{ConnectionId, ConnectionState, ConnectionStatus};

/// How a connection reaches its peer over the unreliable channel.
pub(crate) enum DatagramPath {
    /// Server side: the listen socket is shared and inbound datagrams are
    /// routed here by source address.
    Shared {
        transport: Arc<dyn SocketTransport>,
        router: DatagramRouter,
    },
    /// Client side: the socket belongs to this connection.
    Owned(Arc<dyn SocketTransport>),
}

impl DatagramPath {
    fn transport(&self) -> &Arc<dyn SocketTransport> {
        match self {
            Self::Shared { transport, .. } | Self::Owned(transport) => transport,
        }
    }
}

/// An established link to one peer: a reliable stream plus a datagram path,
/// with every inbound message funnelled into one queue.
pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    datagram_addr: SocketAddr,
    stream: Arc<dyn SocketTransport>,
    datagram: DatagramPath,
    inbound: Receiver<Message>,
    backlog: VecDeque<Message>,
    ping: PingInfo,
    status: ConnectionStatus,
    state: ConnectionState,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        stream: Arc<dyn SocketTransport>,
        remote_addr: SocketAddr,
        datagram: DatagramPath,
        datagram_addr: SocketAddr,
        inbound: Receiver<Message>,
        ping_interval: Duration,
    ) -> Self {
        Self {
            id,
            remote_addr,
            datagram_addr,
            stream,
            datagram,
            inbound,
            backlog: VecDeque::new(),
            ping: PingInfo::new(ping_interval),
            status: ConnectionStatus::default(),
            state: ConnectionState::Established,
        }
    }

    /// Messages that arrived during the handshake, delivered ahead of the
    /// queue.
    pub(crate) fn with_backlog(mut self, backlog: Vec<Message>) -> Self {
        self.backlog.extend(backlog);
        self
    }

    #[cfg(test)]
    pub(crate) fn set_datagram_addr(&mut self, addr: SocketAddr) {
        self.datagram_addr = addr;
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn datagram_addr(&self) -> SocketAddr {
        self.datagram_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    /// Queues `message` on the channel its type is bound to.
    pub fn send(&self, message: &Message) -> Result<(), TransportError> {
        if self.state != ConnectionState::Established {
            return Err(TransportError::Disposed);
        }
        match message.channel() {
            Channel::Reliable => self.stream.send(message, None),
            Channel::Unreliable => self
                .datagram
                .transport()
                .send(message, Some(self.datagram_addr)),
        }
    }

    pub fn flush(&self) {
        self.stream.flush();
        self.datagram.transport().flush();
    }

    /// Everything received since the last call, in arrival order.
    pub fn drain_messages(&mut self) -> Vec<Message> {
        let mut messages: Vec<Message> = self.backlog.drain(..).collect();
        messages.extend(self.inbound.try_iter());
        messages
    }

    /// Errors raised by this connection's transports. Errors of a shared
    /// datagram socket are not attributed to any single connection.
    pub fn take_errors(&self) -> Vec<String> {
        let mut errors = self.stream.errors().drain();
        if let DatagramPath::Owned(transport) = &self.datagram {
            errors.extend(transport.errors().drain());
        }
        errors
    }

    /// Disposes both transports. Idempotent.
    pub fn dispose(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closing;

        self.stream.dispose();
        match &self.datagram {
            DatagramPath::Shared { router, .. } => router.unroute(&self.datagram_addr),
            DatagramPath::Owned(transport) => transport.dispose(),
        }

        self.state = ConnectionState::Closed;
        log::debug!("Connection {} to {} closed", self.id, self.remote_addr);
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut ConnectionStatus {
        &mut self.status
    }

    pub fn ping(&self) -> &PingInfo {
        &self.ping
    }

    pub fn ping_mut(&mut self) -> &mut PingInfo {
        &mut self.ping
    }

    /// Stream statistics plus, for an owned socket, datagram statistics.
    pub fn stats(&self) -> NetworkStats {
        let mut stats = self.stream.stats();
        if let DatagramPath::Owned(transport) = &self.datagram {
            stats.merge(&transport.stats());
        }
        stats
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.dispose();
    }
}

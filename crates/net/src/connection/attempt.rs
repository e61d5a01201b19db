use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use crate::protocol::{HandshakeAck, HandshakeDatagram, Message, PROTOCOL_VERSION};
use crate::transport::{DatagramTransport, PacketLossSimulation, SocketTransport, StreamTransport};

use super::peer::DatagramPath;
use super::{Connection, ConnectionId, HandshakeError};

#[derive(Debug, Clone)]
pub struct AttemptConfig {
    pub handshake_timeout: Duration,
    pub resend_interval: Duration,
    pub ping_interval: Duration,
    pub packet_loss: PacketLossSimulation,
}

pub enum AttemptStatus {
    Pending,
    Established(Connection),
    Failed(HandshakeError),
}

enum Stage {
    Connecting(Receiver<io::Result<TcpStream>>),
    Handshaking {
        stream: Arc<StreamTransport>,
        datagram: Arc<DatagramTransport>,
        inbound: Receiver<Message>,
        stream_port: u16,
        last_sent: Option<Instant>,
    },
    Finished,
}

/// Client side of the handshake. The stream connect runs on a background
/// thread; everything after that is driven by [ConnectionAttempt::poll].
/// A failed attempt is final.
pub struct ConnectionAttempt {
    server_addr: SocketAddr,
    config: AttemptConfig,
    started: Instant,
    stage: Stage,
}

impl ConnectionAttempt {
    pub fn start(server_addr: SocketAddr, config: AttemptConfig) -> Result<Self, HandshakeError> {
        let (tx, rx) = mpsc::channel();
        let timeout = config.handshake_timeout;
        thread::Builder::new()
            .name(format!("connect {server_addr}"))
            .spawn(move || {
                let _ = tx.send(TcpStream::connect_timeout(&server_addr, timeout));
            })?;

        log::info!("Connecting to {}", server_addr);

        Ok(Self {
            server_addr,
            config,
            started: Instant::now(),
            stage: Stage::Connecting(rx),
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn poll(&mut self, now: Instant) -> AttemptStatus {
        let status = match self.advance(now) {
            Ok(status) => status,
            Err(error) => AttemptStatus::Failed(error),
        };

        let status = match status {
            AttemptStatus::Pending
                if now.saturating_duration_since(self.started) > self.config.handshake_timeout =>
            {
                AttemptStatus::Failed(HandshakeError::TimedOut(self.config.handshake_timeout))
            }
            other => other,
        };

        if let AttemptStatus::Failed(ref error) = status {
            log::info!("Connection attempt to {} failed: {}", self.server_addr, error);
            self.abandon();
        }
        status
    }

    /// Abandons the attempt. The connect thread, if still running, exits on
    /// its own once its connect times out.
    pub fn cancel(&mut self) {
        self.abandon();
    }

    fn abandon(&mut self) {
        if let Stage::Handshaking {
            stream, datagram, ..
        } = std::mem::replace(&mut self.stage, Stage::Finished)
        {
            stream.dispose();
            datagram.dispose();
        }
    }

    fn advance(&mut self, now: Instant) -> Result<AttemptStatus, HandshakeError> {
        if let Stage::Connecting(connected) = &self.stage {
            match connected.try_recv() {
                Ok(Ok(stream)) => self.stage = self.begin_handshake(stream)?,
                Ok(Err(e)) => return Err(e.into()),
                Err(TryRecvError::Empty) => return Ok(AttemptStatus::Pending),
                Err(TryRecvError::Disconnected) => return Err(HandshakeError::Cancelled),
            }
        }

        let Stage::Handshaking {
            stream,
            datagram,
            inbound,
            stream_port,
            last_sent,
        } = &mut self.stage
        else {
            return Err(HandshakeError::Cancelled);
        };

        if let Some(error) = stream.errors().drain().into_iter().next() {
            return Err(HandshakeError::Transport(error));
        }

        let mut backlog = Vec::new();
        let mut assigned = None;
        while let Ok(message) = inbound.try_recv() {
            match message {
                Message::HandshakeReply(reply) => {
                    assigned = Some(ConnectionId(reply.connection_id));
                    break;
                }
                Message::Disconnect(disconnect) => {
                    return Err(HandshakeError::Refused(disconnect.reason));
                }
                other => backlog.push(other),
            }
        }

        let Some(id) = assigned else {
            let resend_due = last_sent.is_none_or(|sent| {
                now.saturating_duration_since(sent) >= self.config.resend_interval
            });
            if resend_due {
                let handshake = Message::HandshakeDatagram(HandshakeDatagram {
                    protocol_version: PROTOCOL_VERSION,
                    stream_port: *stream_port,
                });
                datagram.send(&handshake, None)?;
                datagram.flush();
                *last_sent = Some(now);
            }
            return Ok(AttemptStatus::Pending);
        };

        stream.send(
            &Message::HandshakeAck(HandshakeAck {
                connection_id: id.0,
            }),
            None,
        )?;
        stream.flush();

        let Stage::Handshaking {
            stream,
            datagram,
            inbound,
            ..
        } = std::mem::replace(&mut self.stage, Stage::Finished)
        else {
            return Err(HandshakeError::Cancelled);
        };

        log::info!("Connection {} established with {}", id, self.server_addr);

        let connection = Connection::new(
            id,
            stream,
            self.server_addr,
            DatagramPath::Owned(datagram),
            self.server_addr,
            inbound,
            self.config.ping_interval,
        )
        .with_backlog(backlog);
        Ok(AttemptStatus::Established(connection))
    }

    fn begin_handshake(&self, stream: TcpStream) -> Result<Stage, HandshakeError> {
        let local = stream.local_addr()?;
        let (tx, inbound) = mpsc::channel();

        let stream_tx = tx.clone();
        let stream = StreamTransport::new(
            stream,
            Arc::new(move |message, _| {
                let _ = stream_tx.send(message);
            }),
        )?;

        let server_addr = self.server_addr;
        let datagram = DatagramTransport::bind(
            SocketAddr::new(local.ip(), 0),
            Arc::new(move |message, from| {
                if from == server_addr {
                    let _ = tx.send(message);
                } else {
                    log::debug!("Ignoring datagram from stranger {}", from);
                }
            }),
        )?;
        datagram.set_default_destination(server_addr);
        datagram.set_packet_loss_simulation(self.config.packet_loss.clone());

        log::debug!(
            "Stream to {} open from {}, handshaking over {}",
            server_addr,
            local,
            datagram.local_addr()
        );

        Ok(Stage::Handshaking {
            stream: Arc::new(stream),
            datagram: Arc::new(datagram),
            inbound,
            stream_port: local.port(),
            last_sent: None,
        })
    }
}

impl Drop for ConnectionAttempt {
    fn drop(&mut self) {
        self.abandon();
    }
}

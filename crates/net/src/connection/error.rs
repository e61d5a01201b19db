use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

/// Why a connection attempt never reached `Established`.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake timed out after {0:?}")]
    TimedOut(Duration),

    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("handshake acknowledged unknown connection id {0}")]
    UnexpectedConnectionId(u32),

    #[error("transport failed during handshake: {0}")]
    Transport(String),

    #[error("refused by server: {0}")]
    Refused(String),

    #[error("connection attempt cancelled")]
    Cancelled,

    #[error(transparent)]
    Send(#[from] TransportError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

use std::fmt;
use std::net::SocketAddr;

use crate::connection::ConnectionId;
use crate::protocol::{CollisionEvent, PlayerSettings};
use crate::replication::GobId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer said goodbye.
    Remote(String),
    /// We closed the connection.
    Local(String),
    Transport(String),
    ServerFull,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Remote(reason) => write!(f, "peer disconnected: {reason}"),
            DisconnectReason::Local(reason) => write!(f, "closed: {reason}"),
            DisconnectReason::Transport(error) => write!(f, "transport error: {error}"),
            DisconnectReason::ServerFull => f.write_str("server full"),
        }
    }
}

/// What happened on the network since the last drain, for the simulation
/// layer to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    ConnectionEstablished {
        connection: ConnectionId,
        addr: SocketAddr,
    },
    ConnectionLost {
        connection: ConnectionId,
        reason: DisconnectReason,
    },
    ConnectionAttemptFailed {
        addr: SocketAddr,
        reason: String,
    },
    GobsCreated {
        from: ConnectionId,
        gobs: Vec<GobId>,
    },
    GobsUpdated {
        from: ConnectionId,
        gobs: Vec<GobId>,
    },
    GobsDeleted {
        from: ConnectionId,
        gobs: Vec<GobId>,
    },
    CollisionsReceived {
        from: ConnectionId,
        collisions: Vec<CollisionEvent>,
    },
    PlayerSettingsReceived {
        connection: ConnectionId,
        settings: PlayerSettings,
    },
    /// A client finished loading the arena and now receives replication.
    ClientReady {
        connection: ConnectionId,
        arena_id: u32,
    },
    ArenaStarted {
        arena_id: u32,
        frame_number: i64,
    },
    ArenaFinished {
        arena_id: u32,
    },
    FrameNumberCorrected {
        delta: i64,
        frame_number: i64,
    },
}

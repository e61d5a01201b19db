pub mod connection;
pub mod engine;
pub mod ping;
pub mod protocol;
pub mod replication;
pub mod simulation;
pub mod transport;

pub use connection::{
    Connection, ConnectionAttempt, ConnectionAttemptListener, ConnectionId, ConnectionManager,
    ConnectionState, ConnectionStatus, HandshakeError,
};
pub use engine::{
    ClientNetwork, ConnectionInfo, DisconnectReason, NetworkConfig, NetworkEvent, ServerNetwork,
};
pub use ping::{FrameSynchronizer, PingInfo};
pub use protocol::{
    CollisionEvent, DEFAULT_PORT, FramingError, MAX_MESSAGE_SIZE, Message, MessageType,
    PlayerSettings, PROTOCOL_VERSION,
};
pub use replication::{
    Gob, GobCollection, GobError, GobHeader, GobId, GobRegistry, ReplicationEngine,
    ReplicationRole, SerializationModeFlags,
};
pub use simulation::{FixedTimestep, FrameClock};
pub use transport::{NetworkStats, PacketLossSimulation, TransportError};

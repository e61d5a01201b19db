//! Wire format: a fixed header followed by an rkyv-archived body.

mod decoder;
mod error;
mod header;
mod message;

pub use decoder::{DecodeOutcome, FrameDecoder};
pub use error::FramingError;
pub use header::{
    Channel, DEFAULT_PORT, HEADER_SIZE, MAX_MESSAGE_SIZE, MessageHeader, MessageType,
    PROTOCOL_MAGIC, PROTOCOL_VERSION,
};
pub use message::{
    ArenaFinished, ArenaLoaded, ArenaStart, CollisionEvent, Disconnect, GobCreation,
    GobCreationEntry, GobDeletion, GobUpdate, GobUpdateEntry, HandshakeAck, HandshakeDatagram,
    HandshakeReply, Message, Ping, PlayerSettings, Pong, decode_datagram,
};

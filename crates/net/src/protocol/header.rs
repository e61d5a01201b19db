use super::error::FramingError;

pub const HEADER_SIZE: usize = 8;
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024;
pub const PROTOCOL_MAGIC: u16 = 0x4157;
pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 27015;

/// Which socket a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Stream transport: ordered, reliable.
    Reliable,
    /// Datagram transport: may be dropped or reordered.
    Unreliable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    HandshakeDatagram = 1,
    HandshakeReply = 2,
    HandshakeAck = 3,
    Ping = 4,
    Pong = 5,
    GobCreation = 6,
    GobUpdate = 7,
    GobDeletion = 8,
    PlayerSettings = 9,
    ArenaStart = 10,
    ArenaLoaded = 11,
    ArenaFinished = 12,
    Disconnect = 13,
}

impl MessageType {
    pub const ALL: [MessageType; 13] = [
        Self::HandshakeDatagram,
        Self::HandshakeReply,
        Self::HandshakeAck,
        Self::Ping,
        Self::Pong,
        Self::GobCreation,
        Self::GobUpdate,
        Self::GobDeletion,
        Self::PlayerSettings,
        Self::ArenaStart,
        Self::ArenaLoaded,
        Self::ArenaFinished,
        Self::Disconnect,
    ];

    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| *t as u16 == value)
    }

    pub fn channel(self) -> Channel {
        match self {
            Self::HandshakeDatagram
            | Self::HandshakeReply
            | Self::Ping
            | Self::Pong
            | Self::GobUpdate => Channel::Unreliable,
            Self::HandshakeAck
            | Self::GobCreation
            | Self::GobDeletion
            | Self::PlayerSettings
            | Self::ArenaStart
            | Self::ArenaLoaded
            | Self::ArenaFinished
            | Self::Disconnect => Channel::Reliable,
        }
    }
}

/// Fixed-size frame header.
///
/// On the wire (little endian): protocol magic `u16`, message type `u16`,
/// body length `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub body_len: u32,
}

impl MessageHeader {
    pub fn new(message_type: MessageType, body_len: usize) -> Result<Self, FramingError> {
        let frame_len = HEADER_SIZE.saturating_add(body_len);
        if frame_len > MAX_MESSAGE_SIZE {
            return Err(FramingError::Oversized(frame_len));
        }
        Ok(Self {
            message_type,
            body_len: body_len as u32,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&PROTOCOL_MAGIC.to_le_bytes());
        out[2..4].copy_from_slice(&(self.message_type as u16).to_le_bytes());
        out[4..8].copy_from_slice(&self.body_len.to_le_bytes());
        out
    }

    /// Validates the first `HEADER_SIZE` bytes of `bytes`. Never looks past
    /// the header, so an oversized length is rejected before any body byte
    /// has been read.
    pub fn decode(bytes: &[u8]) -> Result<Self, FramingError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FramingError::Truncated {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }

        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        if magic != PROTOCOL_MAGIC {
            return Err(FramingError::BadMagic(magic));
        }

        let raw_type = u16::from_le_bytes([bytes[2], bytes[3]]);
        let message_type =
            MessageType::from_u16(raw_type).ok_or(FramingError::UnknownMessageType(raw_type))?;

        let body_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Self::new(message_type, body_len as usize)
    }

    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.body_len as usize
    }
}

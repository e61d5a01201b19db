use rkyv::rancor;

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("bad protocol magic {0:#06x}")]
    BadMagic(u16),
    #[error("unknown message type {0}")]
    UnknownMessageType(u16),
    #[error("frame of {0} bytes exceeds the maximum message size")]
    Oversized(usize),
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
}

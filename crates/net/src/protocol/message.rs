use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use super::error::FramingError;
use super::header::{Channel, HEADER_SIZE, MessageHeader, MessageType};

/// First datagram a client sends after its stream connection is accepted.
/// The server pairs it with the accepted stream whose peer address has the
/// datagram's source IP and `stream_port`.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct HandshakeDatagram {
    pub protocol_version: u32,
    pub stream_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct HandshakeReply {
    pub connection_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct HandshakeAck {
    pub connection_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Ping {
    /// Sender's real time, in microseconds since its ping epoch.
    pub sent_at_micros: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Pong {
    pub ping_sent_at_micros: u64,
    pub game_time_micros: i64,
    pub frame_number: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct GobCreationEntry {
    pub gob_id: u32,
    pub type_name: String,
    pub layer_index: u8,
    pub owner: Option<u32>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct GobCreation {
    pub frame_number: i64,
    pub gobs: Vec<GobCreationEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct GobUpdateEntry {
    pub gob_id: u32,
    pub data: Vec<u8>,
}

/// One-shot collision between two gobs, carried by the next update message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct CollisionEvent {
    pub gob1_id: u32,
    pub gob2_id: u32,
    pub area1_id: u8,
    pub area2_id: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct GobUpdate {
    pub frame_number: i64,
    pub gobs: Vec<GobUpdateEntry>,
    pub collisions: Vec<CollisionEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct GobDeletion {
    pub frame_number: i64,
    pub gob_ids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct PlayerSettings {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ArenaStart {
    pub arena_id: u32,
    pub frame_number: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ArenaLoaded {
    pub arena_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ArenaFinished {
    pub arena_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Disconnect {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    HandshakeDatagram(HandshakeDatagram),
    HandshakeReply(HandshakeReply),
    HandshakeAck(HandshakeAck),
    Ping(Ping),
    Pong(Pong),
    GobCreation(GobCreation),
    GobUpdate(GobUpdate),
    GobDeletion(GobDeletion),
    PlayerSettings(PlayerSettings),
    ArenaStart(ArenaStart),
    ArenaLoaded(ArenaLoaded),
    ArenaFinished(ArenaFinished),
    Disconnect(Disconnect),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::HandshakeDatagram(_) => MessageType::HandshakeDatagram,
            Self::HandshakeReply(_) => MessageType::HandshakeReply,
            Self::HandshakeAck(_) => MessageType::HandshakeAck,
            Self::Ping(_) => MessageType::Ping,
            Self::Pong(_) => MessageType::Pong,
            Self::GobCreation(_) => MessageType::GobCreation,
            Self::GobUpdate(_) => MessageType::GobUpdate,
            Self::GobDeletion(_) => MessageType::GobDeletion,
            Self::PlayerSettings(_) => MessageType::PlayerSettings,
            Self::ArenaStart(_) => MessageType::ArenaStart,
            Self::ArenaLoaded(_) => MessageType::ArenaLoaded,
            Self::ArenaFinished(_) => MessageType::ArenaFinished,
            Self::Disconnect(_) => MessageType::Disconnect,
        }
    }

    pub fn channel(&self) -> Channel {
        self.message_type().channel()
    }

    pub fn encode(&self) -> Result<Vec<u8>, FramingError> {
        let mut out = Vec::new();
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Appends one complete frame to `out` and returns its length. Nothing is
    /// appended on error.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<usize, FramingError> {
        let body = self.encode_body()?;
        let header = MessageHeader::new(self.message_type(), body.len())?;

        out.reserve(header.frame_len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&body);
        Ok(header.frame_len())
    }

    /// Decodes exactly one frame.
    pub fn decode(frame: &[u8]) -> Result<Self, FramingError> {
        let header = MessageHeader::decode(frame)?;
        let frame_len = header.frame_len();

        if frame.len() < frame_len {
            return Err(FramingError::Truncated {
                needed: frame_len,
                available: frame.len(),
            });
        }
        if frame.len() > frame_len {
            return Err(FramingError::TrailingBytes(frame.len() - frame_len));
        }

        Self::decode_body(header.message_type, &frame[HEADER_SIZE..])
    }

    fn encode_body(&self) -> Result<AlignedVec, FramingError> {
        match self {
            Self::HandshakeDatagram(body) => rkyv::to_bytes::<rancor::Error>(body),
            Self::HandshakeReply(body) => rkyv::to_bytes::<rancor::Error>(body),
            Self::HandshakeAck(body) => rkyv::to_bytes::<rancor::Error>(body),
            Self::Ping(body) => rkyv::to_bytes::<rancor::Error>(body),
            Self::Pong(body) => rkyv::to_bytes::<rancor::Error>(body),
            Self::GobCreation(body) => rkyv::to_bytes::<rancor::Error>(body),
            Self::GobUpdate(body) => rkyv::to_bytes::<rancor::Error>(body),
            Self::GobDeletion(body) => rkyv::to_bytes::<rancor::Error>(body),
            Self::PlayerSettings(body) => rkyv::to_bytes::<rancor::Error>(body),
            Self::ArenaStart(body) => rkyv::to_bytes::<rancor::Error>(body),
            Self::ArenaLoaded(body) => rkyv::to_bytes::<rancor::Error>(body),
            Self::ArenaFinished(body) => rkyv::to_bytes::<rancor::Error>(body),
            Self::Disconnect(body) => rkyv::to_bytes::<rancor::Error>(body),
        }
        .map_err(FramingError::Serialize)
    }

    pub(crate) fn decode_body(
        message_type: MessageType,
        body: &[u8],
    ) -> Result<Self, FramingError> {
        // Archived data must be aligned before validation.
        let mut aligned: AlignedVec = AlignedVec::with_capacity(body.len());
        aligned.extend_from_slice(body);
        let bytes = aligned.as_slice();

        match message_type {
            MessageType::HandshakeDatagram => {
                rkyv::from_bytes::<HandshakeDatagram, rancor::Error>(bytes)
                    .map(Self::HandshakeDatagram)
            }
            MessageType::HandshakeReply => {
                rkyv::from_bytes::<HandshakeReply, rancor::Error>(bytes).map(Self::HandshakeReply)
            }
            MessageType::HandshakeAck => {
                rkyv::from_bytes::<HandshakeAck, rancor::Error>(bytes).map(Self::HandshakeAck)
            }
            MessageType::Ping => rkyv::from_bytes::<Ping, rancor::Error>(bytes).map(Self::Ping),
            MessageType::Pong => rkyv::from_bytes::<Pong, rancor::Error>(bytes).map(Self::Pong),
            MessageType::GobCreation => {
                rkyv::from_bytes::<GobCreation, rancor::Error>(bytes).map(Self::GobCreation)
            }
            MessageType::GobUpdate => {
                rkyv::from_bytes::<GobUpdate, rancor::Error>(bytes).map(Self::GobUpdate)
            }
            MessageType::GobDeletion => {
                rkyv::from_bytes::<GobDeletion, rancor::Error>(bytes).map(Self::GobDeletion)
            }
            MessageType::PlayerSettings => {
                rkyv::from_bytes::<PlayerSettings, rancor::Error>(bytes).map(Self::PlayerSettings)
            }
            MessageType::ArenaStart => {
                rkyv::from_bytes::<ArenaStart, rancor::Error>(bytes).map(Self::ArenaStart)
            }
            MessageType::ArenaLoaded => {
                rkyv::from_bytes::<ArenaLoaded, rancor::Error>(bytes).map(Self::ArenaLoaded)
            }
            MessageType::ArenaFinished => {
                rkyv::from_bytes::<ArenaFinished, rancor::Error>(bytes).map(Self::ArenaFinished)
            }
            MessageType::Disconnect => {
                rkyv::from_bytes::<Disconnect, rancor::Error>(bytes).map(Self::Disconnect)
            }
        }
        .map_err(FramingError::Deserialize)
    }
}

/// Decodes every frame packed into one datagram. Any invalid frame makes the
/// whole datagram invalid.
pub fn decode_datagram(datagram: &[u8]) -> Result<Vec<Message>, FramingError> {
    let mut messages = Vec::new();
    let mut rest = datagram;

    while !rest.is_empty() {
        let header = MessageHeader::decode(rest)?;
        let frame_len = header.frame_len();
        if rest.len() < frame_len {
            return Err(FramingError::Truncated {
                needed: frame_len,
                available: rest.len(),
            });
        }

        messages.push(Message::decode_body(
            header.message_type,
            &rest[HEADER_SIZE..frame_len],
        )?);
        rest = &rest[frame_len..];
    }

    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_MESSAGE_SIZE;

    fn sample_update() -> Message {
        Message::GobUpdate(GobUpdate {
            frame_number: 1200,
            gobs: vec![
                GobUpdateEntry {
                    gob_id: 7,
                    data: vec![1, 2, 3, 4],
                },
                GobUpdateEntry {
                    gob_id: 9,
                    data: vec![],
                },
            ],
            collisions: vec![CollisionEvent {
                gob1_id: 7,
                gob2_id: 9,
                area1_id: 0,
                area2_id: 2,
            }],
        })
    }

    #[test]
    fn decode_inverts_encode() {
        let messages = [
            sample_update(),
            Message::GobCreation(GobCreation {
                frame_number: -3,
                gobs: vec![GobCreationEntry {
                    gob_id: 1,
                    type_name: "ship".to_string(),
                    layer_index: 2,
                    owner: Some(4),
                    data: vec![9; 40],
                }],
            }),
            Message::Pong(Pong {
                ping_sent_at_micros: 99,
                game_time_micros: -5,
                frame_number: 77,
            }),
            Message::Disconnect(Disconnect {
                reason: "bye".to_string(),
            }),
        ];

        for message in messages {
            let frame = message.encode().unwrap();
            assert_eq!(Message::decode(&frame).unwrap(), message);
        }
    }

    #[test]
    fn decode_rejects_truncated_and_trailing() {
        let frame = sample_update().encode().unwrap();

        assert!(matches!(
            Message::decode(&frame[..frame.len() - 1]),
            Err(FramingError::Truncated { .. })
        ));

        let mut longer = frame.clone();
        longer.push(0);
        assert!(matches!(
            Message::decode(&longer),
            Err(FramingError::TrailingBytes(1))
        ));
    }

    #[test]
    fn encode_refuses_oversized_bodies() {
        let message = Message::PlayerSettings(PlayerSettings {
            name: "big".to_string(),
            data: vec![0; MAX_MESSAGE_SIZE],
        });

        let mut out = vec![0xAA];
        assert!(matches!(
            message.encode_into(&mut out),
            Err(FramingError::Oversized(_))
        ));
        assert_eq!(out, vec![0xAA]);
    }

    #[test]
    fn datagram_with_several_frames() {
        let mut datagram = Vec::new();
        Message::Ping(Ping { sent_at_micros: 5 })
            .encode_into(&mut datagram)
            .unwrap();
        sample_update().encode_into(&mut datagram).unwrap();

        let messages = decode_datagram(&datagram).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], Message::Ping(Ping { sent_at_micros: 5 }));
        assert_eq!(messages[1], sample_update());
    }

    #[test]
    fn corrupt_tail_discards_whole_datagram() {
        let mut datagram = Vec::new();
        Message::Ping(Ping { sent_at_micros: 5 })
            .encode_into(&mut datagram)
            .unwrap();
        datagram.extend_from_slice(&[0xFF, 0xFF, 0, 0]);

        assert!(decode_datagram(&datagram).is_err());
    }
}

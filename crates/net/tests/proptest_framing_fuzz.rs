//! Property tests for the message framer: hostile input never panics and
//! well-formed frames survive any split of the byte stream.

use arena_net::protocol::{
    DecodeOutcome, FrameDecoder, GobUpdate, GobUpdateEntry, HEADER_SIZE, MAX_MESSAGE_SIZE,
    PROTOCOL_MAGIC, Ping, decode_datagram,
};
use arena_net::{CollisionEvent, Message, PlayerSettings};
use proptest::prelude::*;

fn drain(decoder: &mut FrameDecoder) -> Result<Vec<Message>, arena_net::FramingError> {
    let mut messages = Vec::new();
    while let DecodeOutcome::Message(message) = decoder.next_message()? {
        messages.push(message);
    }
    Ok(messages)
}

fn arb_message() -> impl Strategy<Value = Message> {
    prop_oneof![
        any::<u64>().prop_map(|sent_at_micros| Message::Ping(Ping { sent_at_micros })),
        ("[a-z]{0,16}", prop::collection::vec(any::<u8>(), 0..64))
            .prop_map(|(name, data)| Message::PlayerSettings(PlayerSettings { name, data })),
        (
            any::<i64>(),
            prop::collection::vec((any::<u32>(), prop::collection::vec(any::<u8>(), 0..32)), 0..8),
            prop::collection::vec((any::<u32>(), any::<u32>()), 0..4),
        )
            .prop_map(|(frame_number, gobs, collisions)| {
                Message::GobUpdate(GobUpdate {
                    frame_number,
                    gobs: gobs
                        .into_iter()
                        .map(|(gob_id, data)| GobUpdateEntry { gob_id, data })
                        .collect(),
                    collisions: collisions
                        .into_iter()
                        .map(|(gob1_id, gob2_id)| CollisionEvent {
                            gob1_id,
                            gob2_id,
                            area1_id: 0,
                            area2_id: 0,
                        })
                        .collect(),
                })
            }),
    ]
}

proptest! {
    /// Arbitrary bytes never panic the frame decoder.
    #[test]
    fn arbitrary_bytes_dont_crash_decoder(
        bytes in prop::collection::vec(any::<u8>(), 0..2000),
    ) {
        let mut decoder = FrameDecoder::default();
        if decoder.feed(&bytes).is_ok() {
            let _ = drain(&mut decoder);
        }
    }

    /// Arbitrary datagram payloads never panic.
    #[test]
    fn arbitrary_datagrams_dont_crash(
        bytes in prop::collection::vec(any::<u8>(), 0..2000),
    ) {
        let _ = decode_datagram(&bytes);
        let _ = Message::decode(&bytes);
    }

    /// A valid header followed by garbage is rejected, never panics.
    #[test]
    fn valid_header_with_garbage_body(
        message_type in 0u16..20,
        body in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
        frame.extend_from_slice(&PROTOCOL_MAGIC.to_le_bytes());
        frame.extend_from_slice(&message_type.to_le_bytes());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);

        let _ = Message::decode(&frame);
    }

    /// Oversized length fields fail on the header alone.
    #[test]
    fn oversized_length_rejected_before_body(
        body_len in (MAX_MESSAGE_SIZE as u32 + 1)..u32::MAX,
    ) {
        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.extend_from_slice(&PROTOCOL_MAGIC.to_le_bytes());
        header.extend_from_slice(&4u16.to_le_bytes());
        header.extend_from_slice(&body_len.to_le_bytes());

        let mut decoder = FrameDecoder::default();
        prop_assert!(decoder.feed(&header).is_err());
    }

    /// Messages round trip through encode and decode.
    #[test]
    fn messages_roundtrip(message in arb_message()) {
        let encoded = message.encode().unwrap();
        prop_assert_eq!(Message::decode(&encoded).unwrap(), message);
    }

    /// Any split of a stream of frames yields the same messages in order.
    #[test]
    fn split_stream_decodes_in_order(
        messages in prop::collection::vec(arb_message(), 1..6),
        chunk in 1usize..64,
    ) {
        let mut stream = Vec::new();
        for message in &messages {
            message.encode_into(&mut stream).unwrap();
        }

        let mut decoder = FrameDecoder::default();
        let mut decoded = Vec::new();
        for piece in stream.chunks(chunk) {
            decoder.feed(piece).unwrap();
            decoded.extend(drain(&mut decoder).unwrap());
        }

        prop_assert_eq!(decoded, messages);
        prop_assert_eq!(decoder.buffered_len(), 0);
    }
}

use super::error::FramingError;
use super::header::{HEADER_SIZE, MessageHeader};
use super::message::Message;

pub enum DecodeOutcome {
    Message(Message),
    /// More data is required. Holds the exact number of bytes still missing
    /// from the current frame.
    NeedMore(usize),
}

/// Accumulates a byte stream and cuts it into frames.
///
/// Feed it with whatever the socket returned, then call
/// [FrameDecoder::next_message] until it asks for more data. Buffered bytes
/// are only consumed once a whole frame is present, so a short read never
/// loses data. An error means the stream can no longer be trusted.
pub struct FrameDecoder {
    cap_limit: usize,
    buffer: Vec<u8>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(HEADER_SIZE * 64)
    }
}

impl FrameDecoder {
    /// `cap_limit` bounds the capacity kept by the internal buffer between
    /// frames; single frames may still be larger.
    pub fn new(cap_limit: usize) -> Self {
        Self {
            cap_limit,
            buffer: Vec::with_capacity(cap_limit),
        }
    }

    /// Appends `bytes`. Fails as soon as a complete header is buffered and
    /// turns out invalid, before any of its body is needed.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), FramingError> {
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() >= HEADER_SIZE {
            MessageHeader::decode(&self.buffer)?;
        }
        Ok(())
    }

    /// Number of bytes that must still arrive before the next frame can be
    /// decoded: the rest of the header first, then the rest of the body.
    /// Zero when a whole frame is buffered.
    pub fn bytes_needed(&self) -> Result<usize, FramingError> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(HEADER_SIZE - self.buffer.len());
        }
        let header = MessageHeader::decode(&self.buffer)?;
        Ok(header.frame_len().saturating_sub(self.buffer.len()))
    }

    pub fn next_message(&mut self) -> Result<DecodeOutcome, FramingError> {
        let needed = self.bytes_needed()?;
        if needed > 0 {
            return Ok(DecodeOutcome::NeedMore(needed));
        }

        let header = MessageHeader::decode(&self.buffer)?;
        let frame_len = header.frame_len();
        let body = &self.buffer[HEADER_SIZE..frame_len];
        let message = Message::decode_body(header.message_type, body)?;

        self.buffer.drain(..frame_len);
        self.buffer.shrink_to(self.cap_limit);
        Ok(DecodeOutcome::Message(message))
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

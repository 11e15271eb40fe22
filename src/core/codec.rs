//! Tokio codec for the reliable channel.
//!
//! Socket reads do not respect frame boundaries, so the decoder keeps every
//! byte that is not yet part of a complete frame and prepends it to the next
//! read. One call to `decode` yields every complete frame currently buffered
//! as a single batch, which is the unit of first-occurrence deduplication.

use crate::config::MAX_FRAME_SIZE;
use crate::core::frame::{self, Frames, END_SEQ, START_SEQ};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::Message;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
    consumed: usize,
    /// Length of the buffered partial frame already known to hold no end sentinel
    scanned: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            consumed: 0,
            scanned: 0,
        }
    }

    /// Bytes consumed from the stream since the last call.
    pub fn take_consumed(&mut self) -> usize {
        std::mem::take(&mut self.consumed)
    }

    fn check_size(&self, src: &BytesMut) -> Result<()> {
        if src.len() > self.max_frame_size {
            return Err(ProtocolError::OversizedFrame(src.len()));
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Vec<Message>;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        // A pending frame only completes once an end sentinel arrives, so
        // search just the new bytes, backing off for a split sentinel.
        if self.scanned > 0 && src.starts_with(START_SEQ) {
            let from = self.scanned.saturating_sub(END_SEQ.len() - 1);
            if !frame::contains_end(&src[from..]) {
                self.scanned = src.len();
                return self.check_size(src).map(|()| None);
            }
        }

        let mut batch = Vec::new();
        let keep_from = {
            let mut frames = Frames::new(&src[..]);
            for body in frames.by_ref() {
                batch.push(frame::parse_body(body)?);
            }
            frames.remainder_start()
        };

        src.advance(keep_from);
        self.consumed += keep_from;
        self.scanned = if src.starts_with(START_SEQ) { src.len() } else { 0 };
        self.check_size(src)?;

        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(batch) = self.decode(src)? {
            return Ok(Some(batch));
        }
        if !src.is_empty() {
            debug!(bytes = src.len(), "Discarding incomplete frame at end of stream");
            src.clear();
            self.scanned = 0;
        }
        Ok(None)
    }
}

/// Already-framed bytes (see [`frame::encode`]) pass through untouched.
impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

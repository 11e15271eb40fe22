//! Sentinel-delimited framing.
//!
//! ```text
//! START_SEQ || json({"action": .., "data": .., "_id": ..}) || END_SEQ
//! ```
//!
//! There is no length prefix. JSON text produced by `serde_json` escapes
//! every control character, so the NUL bytes in the sentinels never occur
//! inside an encoded body.
//!
//! Decoding works on a borrowed slice and never mutates it, so the same raw
//! bytes can be scanned more than once.

use crate::error::{ProtocolError, Result};
use crate::protocol::message::{Message, WireMessage};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

/// Marks the start of a frame
pub const START_SEQ: &[u8] = b"\0+++\0";

/// Marks the end of a frame
pub const END_SEQ: &[u8] = b"\0---\0";

/// Encode one message into a complete frame.
pub fn encode<T>(action: &str, payload: &T, id: Option<&str>) -> Result<Bytes>
where
    T: Serialize + ?Sized,
{
    let mut buf = BytesMut::with_capacity(START_SEQ.len() + END_SEQ.len() + 64);
    encode_into(action, payload, id, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode one message, appending the frame to `dst`.
pub fn encode_into<T>(action: &str, payload: &T, id: Option<&str>, dst: &mut BytesMut) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let wire = WireMessage {
        action,
        data: payload,
        id,
    };
    dst.extend_from_slice(START_SEQ);
    serde_json::to_writer((&mut *dst).writer(), &wire)?;
    dst.extend_from_slice(END_SEQ);
    Ok(())
}

/// Lazy iterator over the frame bodies in a byte slice.
///
/// Bytes before a start sentinel are skipped. If another start sentinel
/// appears before the end sentinel, the earlier frame was truncated and the
/// scan resumes at the later one.
#[derive(Debug, Clone)]
pub struct Frames<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Frames<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Offset of the first byte that belongs to no complete frame.
    ///
    /// Once the iterator is exhausted, everything before this offset is
    /// either decoded or noise; everything from it on must be kept and
    /// prepended to the next read.
    pub fn remainder_start(&self) -> usize {
        let rest = &self.buf[self.pos..];
        match find(rest, START_SEQ) {
            Some(start) => self.pos + start,
            None => self.buf.len() - partial_start_suffix(rest),
        }
    }
}

impl<'a> Iterator for Frames<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let rest = &self.buf[self.pos..];
            let start = find(rest, START_SEQ)?;
            let body_from = start + START_SEQ.len();

            let Some(end) = find(&rest[body_from..], END_SEQ) else {
                self.pos += start;
                return None;
            };

            let body = &rest[body_from..body_from + end];
            if let Some(nested) = rfind(body, START_SEQ) {
                self.pos += body_from + nested;
                continue;
            }

            self.pos += body_from + end + END_SEQ.len();
            return Some(body);
        }
    }
}

/// Decode every complete frame in `bytes`, lazily.
///
/// The returned iterator is finite and can be cloned to restart a scan.
pub fn decode_stream(bytes: &[u8]) -> impl Iterator<Item = Result<Message>> + Clone + '_ {
    Frames::new(bytes).map(parse_body)
}

/// Decode every complete frame in `bytes`, failing on the first malformed one.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Message>> {
    decode_stream(bytes).collect()
}

/// Whether `bytes` holds an end sentinel.
pub fn contains_end(bytes: &[u8]) -> bool {
    find(bytes, END_SEQ).is_some()
}

/// Parse the JSON between two sentinels.
pub fn parse_body(body: &[u8]) -> Result<Message> {
    serde_json::from_slice(body).map_err(|e| ProtocolError::malformed(e.to_string(), body))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}

/// Length of the longest suffix of `rest` that is a proper prefix of `START_SEQ`.
fn partial_start_suffix(rest: &[u8]) -> usize {
    (1..START_SEQ.len())
        .rev()
        .find(|&k| rest.ends_with(&START_SEQ[..k]))
        .unwrap_or(0)
}

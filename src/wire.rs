//! Wire encoding for messages and multiplexed batches.
//!
//! The cluster is homogeneous, so all integers are native-endian. Two
//! frame shapes travel on the transport:
//!
//! - a single message: `[tag | source | destination | length | payload]`
//!   with four little 4-byte fields up front;
//! - a batch envelope: `[MULTIPLEX_MESSAGE | frame_count]` followed by
//!   `frame_count` single-message frames back to back.
//!
//! Also provides the packed integer-vector format used for actor name
//! lists (`[count | items...]`).

use crate::message::Message;

/// Bytes of the fixed per-message header.
pub const MESSAGE_HEADER_SIZE: usize = 16;

/// Bytes of the batch envelope header.
pub const ENVELOPE_HEADER_SIZE: usize = 8;

/// Decoded per-message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub tag: u32,
    pub source: u32,
    pub destination: u32,
    pub payload_length: u32,
}

impl MessageHeader {
    /// Header describing `message` and its payload.
    #[must_use]
    pub fn of(message: &Message) -> Self {
        Self {
            tag: message.tag(),
            source: message.source(),
            destination: message.destination(),
            payload_length: u32::try_from(message.data().len()).unwrap_or(u32::MAX),
        }
    }

    /// Total frame size for this header: header plus payload.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        MESSAGE_HEADER_SIZE + self.payload_length as usize
    }
}

/// Writes a message header into `buf`, which must hold at least
/// [`MESSAGE_HEADER_SIZE`] bytes.
pub fn write_header(buf: &mut [u8], header: &MessageHeader) {
    buf[0..4].copy_from_slice(&header.tag.to_ne_bytes());
    buf[4..8].copy_from_slice(&header.source.to_ne_bytes());
    buf[8..12].copy_from_slice(&header.destination.to_ne_bytes());
    buf[12..16].copy_from_slice(&header.payload_length.to_ne_bytes());
}

/// Reads a message header from the front of `buf`.
///
/// Returns `None` when `buf` is shorter than a header or shorter than
/// the frame the header announces.
#[must_use]
pub fn read_header(buf: &[u8]) -> Option<MessageHeader> {
    if buf.len() < MESSAGE_HEADER_SIZE {
        return None;
    }
    let header = MessageHeader {
        tag: u32::from_ne_bytes(buf[0..4].try_into().ok()?),
        source: u32::from_ne_bytes(buf[4..8].try_into().ok()?),
        destination: u32::from_ne_bytes(buf[8..12].try_into().ok()?),
        payload_length: u32::from_ne_bytes(buf[12..16].try_into().ok()?),
    };
    if buf.len() < header.frame_size() {
        return None;
    }
    Some(header)
}

/// Encodes one complete message frame into a fresh buffer.
#[must_use]
pub fn encode_frame(header: &MessageHeader, payload: &[u8]) -> Vec<u8> {
    debug_assert_eq!(header.payload_length as usize, payload.len());
    let mut frame = vec![0u8; header.frame_size()];
    write_header(&mut frame, header);
    frame[MESSAGE_HEADER_SIZE..].copy_from_slice(payload);
    frame
}

/// Writes a batch envelope header: the envelope tag and frame count.
pub fn write_envelope(buf: &mut [u8], envelope_tag: u32, frame_count: u32) {
    buf[0..4].copy_from_slice(&envelope_tag.to_ne_bytes());
    buf[4..8].copy_from_slice(&frame_count.to_ne_bytes());
}

/// Reads a batch envelope header, returning `(tag, frame_count)`.
#[must_use]
pub fn read_envelope(buf: &[u8]) -> Option<(u32, u32)> {
    if buf.len() < ENVELOPE_HEADER_SIZE {
        return None;
    }
    let tag = u32::from_ne_bytes(buf[0..4].try_into().ok()?);
    let count = u32::from_ne_bytes(buf[4..8].try_into().ok()?);
    Some((tag, count))
}

/// Iterates the message frames inside a batch body (the bytes after the
/// envelope header), yielding `(header, payload)` pairs.
pub fn frames(body: &[u8]) -> FrameIter<'_> {
    FrameIter { body, offset: 0 }
}

/// Iterator over the frames of a batch body.
#[derive(Debug)]
pub struct FrameIter<'a> {
    body: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = (MessageHeader, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let body = self.body;
        let rest = &body[self.offset.min(body.len())..];
        let header = read_header(rest)?;
        let payload = &rest[MESSAGE_HEADER_SIZE..header.frame_size()];
        self.offset += header.frame_size();
        Some((header, payload))
    }
}

// ── Packed integer vectors ──────────────────────────────────────────────

/// Packs a slice of actor names as `[count | names...]`.
#[must_use]
pub fn pack_u32_vector(items: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + items.len() * 4);
    out.extend_from_slice(&u32::try_from(items.len()).unwrap_or(u32::MAX).to_ne_bytes());
    for item in items {
        out.extend_from_slice(&item.to_ne_bytes());
    }
    out
}

/// Unpacks a `[count | names...]` buffer. Returns `None` on truncation.
#[must_use]
pub fn unpack_u32_vector(buf: &[u8]) -> Option<Vec<u32>> {
    if buf.len() < 4 {
        return None;
    }
    let count = u32::from_ne_bytes(buf[0..4].try_into().ok()?) as usize;
    let body = &buf[4..];
    if body.len() < count * 4 {
        return None;
    }
    let mut out = Vec::with_capacity(count);
    for chunk in body[..count * 4].chunks_exact(4) {
        out.push(u32::from_ne_bytes(chunk.try_into().ok()?));
    }
    Some(out)
}

/// Packs a slice of 64-bit entries as `[count(u32) | items...]`.
#[must_use]
pub fn pack_u64_vector(items: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + items.len() * 8);
    out.extend_from_slice(&u32::try_from(items.len()).unwrap_or(u32::MAX).to_ne_bytes());
    for item in items {
        out.extend_from_slice(&item.to_ne_bytes());
    }
    out
}

/// Unpacks a `[count(u32) | u64 items...]` buffer.
#[must_use]
pub fn unpack_u64_vector(buf: &[u8]) -> Option<Vec<u64>> {
    if buf.len() < 4 {
        return None;
    }
    let count = u32::from_ne_bytes(buf[0..4].try_into().ok()?) as usize;
    let body = &buf[4..];
    if body.len() < count * 8 {
        return None;
    }
    let mut out = Vec::with_capacity(count);
    for chunk in body[..count * 8].chunks_exact(8) {
        out.push(u64::from_ne_bytes(chunk.try_into().ok()?));
    }
    Some(out)
}

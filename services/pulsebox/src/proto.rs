//! Multipart message framing for the request socket.
//!
//! A message is `u8` part count followed by each part as `u32`
//! little-endian length plus payload. Requests carry the verb in part 0
//! and the (possibly empty) payload in part 1; replies are raw parts.
//! Router semantics come from TCP itself: every connection is an address,
//! and replies can be sent to it at any later point.

use byteorder::{ByteOrder, LittleEndian};

pub const MAX_PARTS: usize = 16;
pub const MAX_PART_LEN: usize = 1 << 20;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtoError {
    #[error("message with {0} parts")]
    TooManyParts(u8),
    #[error("message part of {0} bytes")]
    PartTooLong(u32),
}

/// Encode a multipart message.
pub fn encode(parts: &[&[u8]]) -> Vec<u8> {
    debug_assert!(parts.len() <= MAX_PARTS);
    let total = 1 + parts.iter().map(|part| 4 + part.len()).sum::<usize>();
    let mut out = Vec::with_capacity(total);
    out.push(parts.len() as u8);
    for part in parts {
        debug_assert!(part.len() <= MAX_PART_LEN);
        out.extend_from_slice(&(part.len() as u32).to_le_bytes());
        out.extend_from_slice(part);
    }
    out
}

/// Incremental decoder over a per-connection byte stream.
#[derive(Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> FrameReader {
        FrameReader::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Take the next complete message off the stream, if one is buffered.
    pub fn next(&mut self) -> Result<Option<Vec<Vec<u8>>>, ProtoError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let nparts = self.buf[0];
        if nparts as usize > MAX_PARTS {
            return Err(ProtoError::TooManyParts(nparts));
        }
        let mut pos = 1usize;
        let mut spans = Vec::with_capacity(nparts as usize);
        for _ in 0..nparts {
            if pos + 4 > self.buf.len() {
                return Ok(None);
            }
            let len = LittleEndian::read_u32(&self.buf[pos..pos + 4]);
            if len as usize > MAX_PART_LEN {
                return Err(ProtoError::PartTooLong(len));
            }
            pos += 4;
            if pos + len as usize > self.buf.len() {
                return Ok(None);
            }
            spans.push((pos, pos + len as usize));
            pos += len as usize;
        }
        let parts = spans
            .iter()
            .map(|&(start, end)| self.buf[start..end].to_vec())
            .collect();
        self.buf.drain(..pos);
        Ok(Some(parts))
    }
}

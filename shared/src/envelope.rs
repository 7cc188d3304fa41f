//! Generic wire envelope and the fixed-layout byte codec it shares with
//! the control message payloads.

use thiserror::Error;

/// Lowest envelope id reserved for session control messages.
pub const RESERVED_ID_MIN: u8 = 1;
/// Highest envelope id reserved for session control messages.
pub const RESERVED_ID_MAX: u8 = 5;

/// Failure to decode a received buffer. Receivers drop the datagram and
/// keep serving; a decode failure is never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer truncated: {needed} more byte(s) required")]
    Truncated { needed: usize },
    #[error("declared length {declared} exceeds remaining {remaining} byte(s)")]
    LengthOverrun { declared: usize, remaining: usize },
    #[error("invalid value {value} for {field}")]
    InvalidValue { field: &'static str, value: u8 },
}

/// Wrapper for every message on the wire.
///
/// Ids within the reserved range are handled by the session layer itself;
/// everything else is opaque application traffic. The `peer` field is
/// overloaded: receive paths overwrite it with the sender's transport id,
/// send paths may use it to address a specific peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: u8,
    pub frame: i32,
    pub peer: u64,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(id: u8, frame: i32, payload: Vec<u8>) -> Self {
        Self {
            id,
            frame,
            peer: 0,
            payload,
        }
    }

    /// Whether `id` belongs to the session layer rather than the application.
    pub fn is_reserved_id(id: u8) -> bool {
        (RESERVED_ID_MIN..=RESERVED_ID_MAX).contains(&id)
    }

    /// Wire layout: id (1), frame (4), peer (8), payload length (4) and the
    /// payload bytes. All integers little-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(17 + self.payload.len());
        put_u8(&mut out, self.id);
        put_i32(&mut out, self.frame);
        put_u64(&mut out, self.peer);
        put_bytes_with_len(&mut out, &self.payload);
        out
    }

    /// Bytes after the declared payload are ignored; transport frames are
    /// exact, so trailing data only shows up in hand-built buffers.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = ByteReader::new(bytes);
        Ok(Self {
            id: reader.read_u8()?,
            frame: reader.read_i32()?,
            peer: reader.read_u64()?,
            payload: reader.read_bytes_with_len()?,
        })
    }
}

/// Bounds-checked cursor over a received buffer. Never reads past the end.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                needed: n - self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        let bytes = self.take(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        Ok(i32::from_le_bytes(raw))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(raw))
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    /// Length-prefixed byte sequence: 4-byte unsigned length then raw bytes.
    /// The declared length is validated against the remaining buffer before
    /// any allocation happens.
    pub fn read_bytes_with_len(&mut self) -> Result<Vec<u8>, DecodeError> {
        let declared = self.read_u32()? as usize;
        if declared > self.remaining() {
            return Err(DecodeError::LengthOverrun {
                declared,
                remaining: self.remaining(),
            });
        }
        Ok(self.take(declared)?.to_vec())
    }
}

pub fn put_u8(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

pub fn put_bool(out: &mut Vec<u8>, value: bool) {
    out.push(value as u8);
}

pub fn put_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn put_bytes_with_len(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

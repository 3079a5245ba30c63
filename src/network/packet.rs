//! Decoded packets and a bounds-checked payload reader.

use bytes::{BufMut, Bytes, BytesMut};

use super::error::ProtocolViolation;
use super::opcode::Opcode;

/// One decoded (or to-be-encoded) application packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    pub fn empty(opcode: Opcode) -> Self {
        Self {
            opcode,
            payload: Bytes::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Reader over the payload.
    pub fn reader(&self) -> PacketReader<'_> {
        PacketReader::new(&self.payload)
    }
}

/// Little-endian payload reader. Every read is bounds-checked and a short
/// payload is a protocol violation, never a panic.
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, what: &'static str, n: usize) -> Result<&'a [u8], ProtocolViolation> {
        if self.remaining() < n {
            return Err(ProtocolViolation::Truncated {
                what,
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self, what: &'static str) -> Result<u8, ProtocolViolation> {
        Ok(self.take(what, 1)?[0])
    }

    pub fn read_u32(&mut self, what: &'static str) -> Result<u32, ProtocolViolation> {
        let b = self.take(what, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self, what: &'static str) -> Result<u64, ProtocolViolation> {
        let b = self.take(what, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn read_array<const N: usize>(
        &mut self,
        what: &'static str,
    ) -> Result<[u8; N], ProtocolViolation> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(what, N)?);
        Ok(out)
    }

    /// NUL-terminated string. Invalid UTF-8 is replaced, not rejected.
    pub fn read_cstring(&mut self, what: &'static str) -> Result<String, ProtocolViolation> {
        let rest = &self.data[self.pos..];
        let Some(nul) = rest.iter().position(|&b| b == 0) else {
            return Err(ProtocolViolation::Truncated {
                what,
                needed: rest.len() + 1,
                available: rest.len(),
            });
        };
        let s = String::from_utf8_lossy(&rest[..nul]).into_owned();
        self.pos += nul + 1;
        Ok(s)
    }

    /// Everything left in the payload.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}

/// Builds a payload for an outbound packet.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(cap),
        }
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.buf.put_u8(v);
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn bytes(mut self, v: &[u8]) -> Self {
        self.buf.put_slice(v);
        self
    }

    pub fn finish(self, opcode: Opcode) -> Packet {
        Packet::new(opcode, self.buf.freeze())
    }
}

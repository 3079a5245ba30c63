//! Frame codec
//!
//! Decodes the inbound byte stream into packets and encodes outbound packets.
//! Only the header is encrypted; payload bytes travel as-is.
//!
//! Client → server header (6 bytes): `size: u16 BE`, `opcode: u32 LE`.
//! Server → client header (4 bytes): `size: u16 BE`, `opcode: u16 LE`.
//! In both, `size` counts the opcode bytes plus the payload.

use std::marker::PhantomData;

use bytes::{BufMut, BytesMut};

use super::crypt::EncryptionContext;
use super::error::{ConnectionError, ProtocolViolation};
use super::opcode::{Opcode, MAX_CLIENT_OPCODE};
use super::packet::Packet;

/// Largest `size` field a client header may declare.
pub const MAX_INBOUND_SIZE: usize = 10240;

/// Room for the widest header format.
const MAX_HEADER_SIZE: usize = 6;

/// Layout of one direction's header.
pub trait HeaderFormat {
    /// Bytes on the wire, encrypted as a unit.
    const SIZE: usize;
    /// Largest payload this direction can carry.
    const MAX_PAYLOAD: usize;

    /// Parse a decrypted header into `(payload_len, opcode)`.
    fn parse(raw: &[u8]) -> Result<(usize, Opcode), ProtocolViolation>;

    /// Write a clear-text header for `payload_len` bytes of payload.
    fn write(payload_len: usize, opcode: Opcode, out: &mut [u8]);
}

/// Header the client sends.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientHeader;

/// Header the server sends.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerHeader;

impl HeaderFormat for ClientHeader {
    const SIZE: usize = 6;
    const MAX_PAYLOAD: usize = MAX_INBOUND_SIZE - 4;

    fn parse(raw: &[u8]) -> Result<(usize, Opcode), ProtocolViolation> {
        let size = u16::from_be_bytes([raw[0], raw[1]]);
        let opcode = u32::from_le_bytes([raw[2], raw[3], raw[4], raw[5]]);

        if size < 4 {
            return Err(ProtocolViolation::Undersized { size });
        }
        if size as usize > MAX_INBOUND_SIZE {
            return Err(ProtocolViolation::Oversized {
                size: size as usize,
                max: MAX_INBOUND_SIZE,
            });
        }
        if opcode > MAX_CLIENT_OPCODE {
            return Err(ProtocolViolation::OpcodeOutOfRange { opcode });
        }

        Ok((size as usize - 4, opcode as Opcode))
    }

    fn write(payload_len: usize, opcode: Opcode, out: &mut [u8]) {
        let size = (payload_len + 4) as u16;
        out[..2].copy_from_slice(&size.to_be_bytes());
        out[2..6].copy_from_slice(&(opcode as u32).to_le_bytes());
    }
}

impl HeaderFormat for ServerHeader {
    const SIZE: usize = 4;
    const MAX_PAYLOAD: usize = u16::MAX as usize - 2;

    fn parse(raw: &[u8]) -> Result<(usize, Opcode), ProtocolViolation> {
        let size = u16::from_be_bytes([raw[0], raw[1]]);
        let opcode = u16::from_le_bytes([raw[2], raw[3]]);

        if size < 2 {
            return Err(ProtocolViolation::Undersized { size });
        }

        Ok((size as usize - 2, opcode))
    }

    fn write(payload_len: usize, opcode: Opcode, out: &mut [u8]) {
        let size = (payload_len + 2) as u16;
        out[..2].copy_from_slice(&size.to_be_bytes());
        out[2..4].copy_from_slice(&opcode.to_le_bytes());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    AwaitingHeader { filled: usize },
    AwaitingPayload { opcode: Opcode, declared: usize },
}

/// Incremental decoder. Input may be split at any byte boundary; partial
/// header and payload bytes are carried over to the next call.
pub struct FrameDecoder<H: HeaderFormat> {
    state: DecodeState,
    header: [u8; MAX_HEADER_SIZE],
    payload: BytesMut,
    _format: PhantomData<H>,
}

impl<H: HeaderFormat> FrameDecoder<H> {
    pub fn new() -> Self {
        Self {
            state: DecodeState::AwaitingHeader { filled: 0 },
            header: [0; MAX_HEADER_SIZE],
            payload: BytesMut::new(),
            _format: PhantomData,
        }
    }

    /// True when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::AwaitingHeader { filled: 0 }
    }

    /// Consume bytes from the front of `input` until one frame is complete
    /// or `input` runs dry.
    ///
    /// The header is decrypted with `crypt` the moment its last byte arrives,
    /// so activating the context between two calls affects exactly the frames
    /// whose headers complete afterwards.
    pub fn decode(
        &mut self,
        input: &mut &[u8],
        crypt: &mut EncryptionContext,
    ) -> Result<Option<Packet>, ProtocolViolation> {
        loop {
            match self.state {
                DecodeState::AwaitingHeader { filled } => {
                    let n = (H::SIZE - filled).min(input.len());
                    self.header[filled..filled + n].copy_from_slice(&input[..n]);
                    *input = &input[n..];

                    let filled = filled + n;
                    if filled < H::SIZE {
                        self.state = DecodeState::AwaitingHeader { filled };
                        return Ok(None);
                    }

                    let raw = &mut self.header[..H::SIZE];
                    crypt.decrypt_header(raw);
                    let (declared, opcode) = H::parse(raw)?;

                    if declared == 0 {
                        self.state = DecodeState::AwaitingHeader { filled: 0 };
                        return Ok(Some(Packet::empty(opcode)));
                    }

                    self.payload.reserve(declared);
                    self.state = DecodeState::AwaitingPayload { opcode, declared };
                }
                DecodeState::AwaitingPayload { opcode, declared } => {
                    let n = (declared - self.payload.len()).min(input.len());
                    self.payload.extend_from_slice(&input[..n]);
                    *input = &input[n..];

                    if self.payload.len() < declared {
                        return Ok(None);
                    }

                    self.state = DecodeState::AwaitingHeader { filled: 0 };
                    let payload = self.payload.split().freeze();
                    return Ok(Some(Packet { opcode, payload }));
                }
            }
        }
    }
}

impl<H: HeaderFormat> Default for FrameDecoder<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Total wire length of a frame carrying `payload_len` bytes.
pub fn frame_len<H: HeaderFormat>(payload_len: usize) -> usize {
    H::SIZE + payload_len
}

/// Reject payloads the header cannot describe.
pub fn check_payload<H: HeaderFormat>(payload_len: usize) -> Result<(), ConnectionError> {
    if payload_len > H::MAX_PAYLOAD {
        return Err(ConnectionError::PacketTooLarge {
            len: payload_len,
            max: H::MAX_PAYLOAD,
        });
    }
    Ok(())
}

/// Append one frame to `dst`, encrypting the header if `crypt` is active.
/// The caller has already validated the payload with [`check_payload`].
pub fn encode_into<H: HeaderFormat>(
    opcode: Opcode,
    payload: &[u8],
    crypt: &mut EncryptionContext,
    dst: &mut BytesMut,
) {
    let mut header = [0u8; MAX_HEADER_SIZE];
    H::write(payload.len(), opcode, &mut header);
    crypt.encrypt_header(&mut header[..H::SIZE]);

    dst.reserve(frame_len::<H>(payload.len()));
    dst.put_slice(&header[..H::SIZE]);
    dst.put_slice(payload);
}

/// Encode one frame into a fresh buffer.
pub fn encode<H: HeaderFormat>(
    opcode: Opcode,
    payload: &[u8],
    crypt: &mut EncryptionContext,
) -> Result<BytesMut, ConnectionError> {
    check_payload::<H>(payload.len())?;
    let mut dst = BytesMut::with_capacity(frame_len::<H>(payload.len()));
    encode_into::<H>(opcode, payload, crypt, &mut dst);
    Ok(dst)
}

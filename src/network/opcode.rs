//! Protocol-control opcodes and auth result codes.
//!
//! Gameplay opcodes are opaque to this crate; only the handshake and
//! keep-alive packets are interpreted here.

pub type Opcode = u16;

/// Number of opcodes the client protocol defines. Anything at or above this
/// is unknown in strict mode.
pub const NUM_MSG_TYPES: Opcode = 0x51F;

/// Hard upper bound on a client header's opcode field, checked regardless of
/// strict mode.
pub const MAX_CLIENT_OPCODE: u32 = 10240;

pub const CMSG_PING: Opcode = 0x1DC;
pub const SMSG_PONG: Opcode = 0x1DD;
pub const SMSG_AUTH_CHALLENGE: Opcode = 0x1EC;
pub const CMSG_AUTH_SESSION: Opcode = 0x1ED;
pub const SMSG_AUTH_RESPONSE: Opcode = 0x1EE;
pub const CMSG_KEEP_ALIVE: Opcode = 0x407;

// Result codes carried in SMSG_AUTH_RESPONSE
pub const AUTH_OK: u8 = 0x0C;
pub const AUTH_UNAVAILABLE: u8 = 0x10;
pub const AUTH_UNKNOWN_ACCOUNT: u8 = 0x15;
pub const AUTH_INCORRECT_PASSWORD: u8 = 0x16;
pub const AUTH_BANNED: u8 = 0x1C;

/// Opcodes handled by the connection itself rather than the session.
pub fn is_control(opcode: Opcode) -> bool {
    matches!(opcode, CMSG_PING | CMSG_AUTH_SESSION | CMSG_KEEP_ALIVE)
}

pub fn is_known(opcode: Opcode) -> bool {
    opcode < NUM_MSG_TYPES
}

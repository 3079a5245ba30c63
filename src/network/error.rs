//! Error taxonomy for the connection engine.
//!
//! `WouldBlock` is not an error and never appears here; it is an
//! [`IoOutcome`](super::IoOutcome). Everything below is fatal to the
//! connection except an `AuthFailure` when retries are configured.

use std::io;

use super::opcode::Opcode;

/// Malformed or out-of-order client traffic. Always closes the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("header size {size} below opcode width")]
    Undersized { size: u16 },

    #[error("frame size {size} exceeds maximum {max}")]
    Oversized { size: usize, max: usize },

    #[error("opcode {opcode:#X} out of range")]
    OpcodeOutOfRange { opcode: u32 },

    #[error("unknown opcode {opcode:#06X} in strict mode")]
    UnknownOpcode { opcode: Opcode },

    #[error("opcode {opcode:#06X} received before authentication")]
    NotAuthenticated { opcode: Opcode },

    #[error("duplicate authentication attempt")]
    DuplicateAuth,

    #[error("truncated {what}: needed {needed} bytes, {available} available")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("ping flood: {overspeed} consecutive over-speed pings")]
    PingFlood { overspeed: u32 },
}

/// Reported to the client with a specific result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("unknown account")]
    UnknownAccount,

    #[error("bad proof")]
    BadProof,

    #[error("account banned")]
    Banned,

    #[error("server full")]
    ServerFull,
}

/// Encryption state machine misuse. Treated as an invariant violation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptError {
    #[error("encryption context already active")]
    AlreadyActive,

    #[error("session key already set")]
    SessionKeyAlreadySet,

    #[error("session key is empty")]
    EmptySessionKey,

    #[error("cipher rejected key of {len} bytes")]
    InvalidKeyLength { len: usize },
}

/// Umbrella error for operations on a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthFailure),

    #[error("encryption state error: {0}")]
    Crypt(#[from] CryptError),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("outbound payload of {len} bytes exceeds maximum {max}")]
    PacketTooLarge { len: usize, max: usize },

    #[error("connection closed")]
    Closed,
}

/// Why a connection was torn down. The first reason recorded wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close_socket` called by the manager or a session.
    Requested,
    /// Peer closed the stream.
    PeerClosed,
    Protocol(ProtocolViolation),
    Transport(io::ErrorKind),
    Encryption(CryptError),
    AuthRejected(AuthFailure),
}

impl From<&ConnectionError> for CloseReason {
    fn from(err: &ConnectionError) -> Self {
        match err {
            ConnectionError::Protocol(v) => CloseReason::Protocol(v.clone()),
            ConnectionError::Auth(f) => CloseReason::AuthRejected(*f),
            ConnectionError::Crypt(c) => CloseReason::Encryption(c.clone()),
            ConnectionError::Transport(e) => CloseReason::Transport(e.kind()),
            ConnectionError::PacketTooLarge { .. } | ConnectionError::Closed => {
                CloseReason::Requested
            }
        }
    }
}

//! worldsocket - per-connection protocol engine for the world server
//!
//! Terminates one client TCP connection: frames the binary protocol,
//! encrypts headers once the client has authenticated, batches outbound
//! writes and routes decoded packets to the bound game session.

/// Engine configuration (buffer sizes, ping policy, strict mode)
pub mod config;
/// Framing, header crypt, output batching and the connection engine
pub mod network;

pub use config::EngineConfig;
pub use network::connection::ConnectionEngine;

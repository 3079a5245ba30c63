//! Authentication handshake: challenge, session request, result.

use std::sync::Arc;

use super::binding::GameSession;
use super::connection::ConnectionEngine;
use super::crypt::SessionKey;
use super::error::{AuthFailure, ProtocolViolation};
use super::opcode::{
    AUTH_BANNED, AUTH_INCORRECT_PASSWORD, AUTH_OK, AUTH_UNAVAILABLE, AUTH_UNKNOWN_ACCOUNT,
    SMSG_AUTH_CHALLENGE, SMSG_AUTH_RESPONSE,
};
use super::packet::{Packet, PacketReader, PacketWriter};

/// Fields of the client's auth session packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub build: u32,
    pub login_server_id: u32,
    /// Upper-cased account name.
    pub account: String,
    pub login_server_type: u32,
    pub client_seed: u32,
    pub region_id: u32,
    pub battlegroup_id: u32,
    pub realm_id: u32,
    pub dos_response: u64,
    /// SHA1 proof that the client holds the session key.
    pub digest: [u8; 20],
    /// Compressed addon info, passed through untouched.
    pub addon_data: Vec<u8>,
    /// Seed this connection sent in its challenge.
    pub server_seed: u32,
}

impl AuthRequest {
    pub fn parse(payload: &[u8], server_seed: u32) -> Result<Self, ProtocolViolation> {
        let mut r = PacketReader::new(payload);
        let build = r.read_u32("build")?;
        let login_server_id = r.read_u32("login server id")?;
        let account = r.read_cstring("account")?.to_ascii_uppercase();
        let login_server_type = r.read_u32("login server type")?;
        let client_seed = r.read_u32("client seed")?;
        let region_id = r.read_u32("region id")?;
        let battlegroup_id = r.read_u32("battlegroup id")?;
        let realm_id = r.read_u32("realm id")?;
        let dos_response = r.read_u64("dos response")?;
        let digest = r.read_array::<20>("digest")?;
        let addon_data = r.read_rest().to_vec();

        Ok(Self {
            build,
            login_server_id,
            account,
            login_server_type,
            client_seed,
            region_id,
            battlegroup_id,
            realm_id,
            dos_response,
            digest,
            addon_data,
            server_seed,
        })
    }

    /// Serialize as the client would send it (without `server_seed`).
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.account.len() + self.addon_data.len());
        out.extend_from_slice(&self.build.to_le_bytes());
        out.extend_from_slice(&self.login_server_id.to_le_bytes());
        out.extend_from_slice(self.account.as_bytes());
        out.push(0);
        out.extend_from_slice(&self.login_server_type.to_le_bytes());
        out.extend_from_slice(&self.client_seed.to_le_bytes());
        out.extend_from_slice(&self.region_id.to_le_bytes());
        out.extend_from_slice(&self.battlegroup_id.to_le_bytes());
        out.extend_from_slice(&self.realm_id.to_le_bytes());
        out.extend_from_slice(&self.dos_response.to_le_bytes());
        out.extend_from_slice(&self.digest);
        out.extend_from_slice(&self.addon_data);
        out
    }
}

/// What a successful lookup hands back.
pub struct AuthGrant {
    pub session: Arc<dyn GameSession>,
    pub session_key: SessionKey,
    /// Expansion level reported to the client.
    pub expansion: u8,
}

pub enum AuthOutcome {
    Granted(AuthGrant),
    Rejected(AuthFailure),
}

impl From<AuthFailure> for AuthOutcome {
    fn from(failure: AuthFailure) -> Self {
        AuthOutcome::Rejected(failure)
    }
}

/// Account lookup and proof verification, owned by the session layer.
///
/// `connection` lets the implementation build a session that sends packets
/// back through this connection.
pub trait Authenticator: Send + Sync {
    fn verify_credentials(
        &self,
        request: &AuthRequest,
        connection: &Arc<ConnectionEngine>,
    ) -> AuthOutcome;
}

pub fn result_code(failure: AuthFailure) -> u8 {
    match failure {
        AuthFailure::UnknownAccount => AUTH_UNKNOWN_ACCOUNT,
        AuthFailure::BadProof => AUTH_INCORRECT_PASSWORD,
        AuthFailure::Banned => AUTH_BANNED,
        AuthFailure::ServerFull => AUTH_UNAVAILABLE,
    }
}

/// Challenge sent right after accept.
pub fn challenge_packet(seed: u32, random: &[u8; 32]) -> Packet {
    PacketWriter::with_capacity(40)
        .u32(1)
        .u32(seed)
        .bytes(random)
        .finish(SMSG_AUTH_CHALLENGE)
}

pub fn auth_ok_packet(expansion: u8) -> Packet {
    PacketWriter::with_capacity(11)
        .u8(AUTH_OK)
        .u32(0) // billing time remaining
        .u8(0) // billing plan flags
        .u32(0) // billing time rested
        .u8(expansion)
        .finish(SMSG_AUTH_RESPONSE)
}

pub fn auth_failed_packet(failure: AuthFailure) -> Packet {
    PacketWriter::with_capacity(1)
        .u8(result_code(failure))
        .finish(SMSG_AUTH_RESPONSE)
}

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use worldsocket::network::auth::{AuthGrant, AuthOutcome, AuthRequest, Authenticator};
use worldsocket::network::binding::GameSession;
use worldsocket::network::codec::{self, ClientHeader, FrameDecoder, ServerHeader};
use worldsocket::network::connection::ConnectionEngine;
use worldsocket::network::crypt::{self, CipherSeeds, EncryptionContext, SessionKey};
use worldsocket::network::error::AuthFailure;
use worldsocket::network::opcode::{Opcode, CMSG_AUTH_SESSION, CMSG_PING};
use worldsocket::network::packet::Packet;
use worldsocket::network::{IoOutcome, Transport};

/// Opcode the test session treats as "log me out".
pub const LOGOUT: Opcode = 0x4B;

/// Opcode the test session echoes back through the connection.
pub const ECHO: Opcode = 0x1CE;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================
// Transport
// ============================================

/// In-memory transport fed from a script of inbound chunks.
#[derive(Default)]
pub struct ScriptedTransport {
    inbound: VecDeque<Vec<u8>>,
    pub eof: bool,
    pub read_error: Option<io::ErrorKind>,
    pub written: Vec<u8>,
    /// Max bytes accepted per write call. `Some(0)` means the socket is full.
    pub write_limit: Option<usize>,
    pub close_calls: usize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: impl Into<Vec<u8>>) {
        let bytes = bytes.into();
        if !bytes.is_empty() {
            self.inbound.push_back(bytes);
        }
    }

    /// Queue `bytes` as separate reads of at most `chunk` bytes.
    pub fn push_split(&mut self, bytes: &[u8], chunk: usize) {
        for piece in bytes.chunks(chunk) {
            self.push(piece.to_vec());
        }
    }

    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.written)
    }

    pub fn is_closed(&self) -> bool {
        self.close_calls > 0
    }
}

impl Transport for ScriptedTransport {
    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<IoOutcome> {
        if let Some(mut chunk) = self.inbound.pop_front() {
            if chunk.len() > buf.len() {
                let rest = chunk.split_off(buf.len());
                self.inbound.push_front(rest);
            }
            buf[..chunk.len()].copy_from_slice(&chunk);
            return Ok(IoOutcome::Transferred(chunk.len()));
        }
        if let Some(kind) = self.read_error.take() {
            return Err(kind.into());
        }
        if self.eof {
            return Ok(IoOutcome::Closed);
        }
        Ok(IoOutcome::WouldBlock)
    }

    fn write_from(&mut self, buf: &[u8]) -> io::Result<IoOutcome> {
        let n = self.write_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
        if n == 0 {
            return Ok(IoOutcome::WouldBlock);
        }
        self.written.extend_from_slice(&buf[..n]);
        Ok(IoOutcome::Transferred(n))
    }

    fn close(&mut self) {
        self.close_calls += 1;
    }
}

// ============================================
// Client side of the protocol
// ============================================

pub struct TestClient {
    crypt: EncryptionContext,
    decoder: FrameDecoder<ServerHeader>,
}

impl TestClient {
    pub fn new() -> Self {
        Self {
            crypt: EncryptionContext::new(CipherSeeds::client()),
            decoder: FrameDecoder::new(),
        }
    }

    pub fn activate(&mut self, key: &SessionKey) {
        self.crypt.activate(key).unwrap();
    }

    pub fn frame(&mut self, opcode: Opcode, payload: &[u8]) -> Vec<u8> {
        codec::encode::<ClientHeader>(opcode, payload, &mut self.crypt)
            .unwrap()
            .to_vec()
    }

    pub fn ping(&mut self, ping: u32, latency: u32) -> Vec<u8> {
        let mut payload = ping.to_le_bytes().to_vec();
        payload.extend_from_slice(&latency.to_le_bytes());
        self.frame(CMSG_PING, &payload)
    }

    pub fn auth_session(&mut self, request: &AuthRequest) -> Vec<u8> {
        self.frame(CMSG_AUTH_SESSION, &request.to_payload())
    }

    /// Decode everything in `bytes`; panics on a partial trailing frame.
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<Packet> {
        let mut input = bytes;
        let mut packets = Vec::new();
        while let Some(packet) = self.decoder.decode(&mut input, &mut self.crypt).unwrap() {
            packets.push(packet);
        }
        assert!(self.decoder.is_idle(), "partial frame left in server output");
        packets
    }
}

/// Auth request with a valid proof for `key`.
pub fn signed_request(account: &str, key: &SessionKey, server_seed: u32) -> AuthRequest {
    let client_seed = 0x5EED_1234;
    let account = account.to_ascii_uppercase();
    AuthRequest {
        build: 12340,
        login_server_id: 0,
        login_server_type: 0,
        client_seed,
        region_id: 0,
        battlegroup_id: 0,
        realm_id: 1,
        dos_response: 0,
        digest: crypt::auth_digest(&account, client_seed, server_seed, key),
        addon_data: Vec::new(),
        server_seed,
        account,
    }
}

pub fn session_key(fill: u8) -> SessionKey {
    SessionKey::new(vec![fill; 40]).unwrap()
}

// ============================================
// Session layer
// ============================================

pub struct TestSession {
    pub account: String,
    pub privileged: bool,
    pub packets: Mutex<Vec<Packet>>,
    pub latency: AtomicU32,
    pub socket_closed: AtomicBool,
    connection: Weak<ConnectionEngine>,
}

impl TestSession {
    pub fn received(&self) -> Vec<Packet> {
        self.packets.lock().clone()
    }
}

impl GameSession for TestSession {
    fn queue_packet(&self, packet: Packet) {
        match packet.opcode {
            LOGOUT => {
                if let Some(conn) = self.connection.upgrade() {
                    conn.clear_session();
                }
            }
            ECHO => {
                if let Some(conn) = self.connection.upgrade() {
                    conn.send(&packet).unwrap();
                }
            }
            _ => {}
        }
        self.packets.lock().push(packet);
    }

    fn set_latency(&self, latency: u32) {
        self.latency.store(latency, Ordering::Relaxed);
    }

    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn on_socket_closed(&self) {
        self.socket_closed.store(true, Ordering::Relaxed);
    }
}

pub struct Account {
    pub key: SessionKey,
    pub status: Option<AuthFailure>,
    pub privileged: bool,
}

/// Account table that checks the proof digest the way a realm would.
#[derive(Default)]
pub struct TestAccounts {
    accounts: HashMap<String, Account>,
    pub full: AtomicBool,
    pub sessions: Mutex<Vec<Arc<TestSession>>>,
}

impl TestAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(mut self, name: &str, key: SessionKey) -> Self {
        self.accounts.insert(
            name.to_ascii_uppercase(),
            Account { key, status: None, privileged: false },
        );
        self
    }

    pub fn with_banned(mut self, name: &str, key: SessionKey) -> Self {
        self.accounts.insert(
            name.to_ascii_uppercase(),
            Account { key, status: Some(AuthFailure::Banned), privileged: false },
        );
        self
    }

    pub fn with_gm(mut self, name: &str, key: SessionKey) -> Self {
        self.accounts.insert(
            name.to_ascii_uppercase(),
            Account { key, status: None, privileged: true },
        );
        self
    }

    pub fn last_session(&self) -> Arc<TestSession> {
        self.sessions.lock().last().cloned().expect("no session granted")
    }
}

impl Authenticator for TestAccounts {
    fn verify_credentials(
        &self,
        request: &AuthRequest,
        connection: &Arc<ConnectionEngine>,
    ) -> AuthOutcome {
        let Some(account) = self.accounts.get(&request.account) else {
            return AuthFailure::UnknownAccount.into();
        };

        let expected = crypt::auth_digest(
            &request.account,
            request.client_seed,
            request.server_seed,
            &account.key,
        );
        if expected != request.digest {
            return AuthFailure::BadProof.into();
        }
        if let Some(status) = account.status {
            return status.into();
        }
        if self.full.load(Ordering::Relaxed) {
            return AuthFailure::ServerFull.into();
        }

        let session = Arc::new(TestSession {
            account: request.account.clone(),
            privileged: account.privileged,
            packets: Mutex::new(Vec::new()),
            latency: AtomicU32::new(0),
            socket_closed: AtomicBool::new(false),
            connection: Arc::downgrade(connection),
        });
        self.sessions.lock().push(session.clone());

        AuthOutcome::Granted(AuthGrant {
            session,
            session_key: account.key.clone(),
            expansion: 2,
        })
    }
}

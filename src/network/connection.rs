//! Per-connection protocol engine.
//!
//! One `ConnectionEngine` per accepted socket. The reactor owns the transport
//! and lends it to the entry points (`open`, `on_readable`, `on_writable`,
//! `tick`); game-logic threads only ever call `send_packet`.
//!
//! Lock order: output batcher, then crypt. Decoding takes the crypt lock
//! alone, and nothing takes the output lock while holding crypt.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use anyhow::Context;
use parking_lot::Mutex;

use super::auth::{self, AuthOutcome, AuthRequest, Authenticator};
use super::batcher::{FlushOutcome, OutputBatcher};
use super::binding::{BindError, GameSession, SessionBinding};
use super::codec::{self, ClientHeader, FrameDecoder, ServerHeader};
use super::crypt::{EncryptionContext, SessionKey};
use super::error::{CloseReason, ConnectionError, CryptError, ProtocolViolation};
use super::opcode::{self, Opcode, CMSG_AUTH_SESSION, CMSG_KEEP_ALIVE, CMSG_PING, SMSG_PONG};
use super::packet::{Packet, PacketWriter};
use super::ping::{PingGuard, PingVerdict};
use super::{IoOutcome, Transport};
use crate::config::EngineConfig;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Reported by every reactor-facing entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Open,
    Closed,
}

/// State only the reactor thread touches.
struct InputState {
    decoder: FrameDecoder<ClientHeader>,
    ping: PingGuard,
    scratch: Vec<u8>,
}

pub struct ConnectionEngine {
    id: u64,
    me: Weak<ConnectionEngine>,
    config: EngineConfig,
    authenticator: Arc<dyn Authenticator>,

    seed: AtomicU32,
    opened: AtomicBool,
    session_key: OnceLock<SessionKey>,
    latency: AtomicU32,

    crypt: Mutex<EncryptionContext>,
    output: OutputBatcher,
    input: Mutex<InputState>,
    binding: SessionBinding,

    closed: AtomicBool,
    transport_closed: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
}

impl ConnectionEngine {
    /// Fails if `config` does not pass `EngineConfig::validate`.
    pub fn new(
        config: EngineConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate().context("invalid engine config")?;
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

        Ok(Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            authenticator,
            seed: AtomicU32::new(0),
            opened: AtomicBool::new(false),
            session_key: OnceLock::new(),
            latency: AtomicU32::new(0),
            crypt: Mutex::new(EncryptionContext::default()),
            output: OutputBatcher::new(config.output_buffer_size),
            input: Mutex::new(InputState {
                decoder: FrameDecoder::new(),
                ping: PingGuard::new(config.ping),
                scratch: vec![0; config.read_chunk_size],
            }),
            binding: SessionBinding::new(),
            closed: AtomicBool::new(false),
            transport_closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            config,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Seed sent in the auth challenge. Zero until `open`.
    pub fn seed(&self) -> u32 {
        self.seed.load(Ordering::Acquire)
    }

    pub fn session_key(&self) -> Option<&SessionKey> {
        self.session_key.get()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session_key.get().is_some()
    }

    /// Latency the client reported in its last ping (ms).
    pub fn latency(&self) -> u32 {
        self.latency.load(Ordering::Relaxed)
    }

    pub fn session(&self) -> Option<Arc<dyn GameSession>> {
        self.binding.current()
    }

    /// Detach the session without closing the socket. Terminal: the
    /// connection can never be bound again, and gameplay opcodes arriving
    /// afterwards are violations.
    pub fn clear_session(&self) -> Option<Arc<dyn GameSession>> {
        self.binding.clear()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    pub fn has_pending_output(&self) -> bool {
        self.output.has_pending()
    }

    // ============================================
    // Reactor entry points
    // ============================================

    /// Post-accept initialisation: pick the seed and send the auth challenge.
    pub fn open<T: Transport + ?Sized>(&self, transport: &mut T) -> SocketStatus {
        if self.opened.swap(true, Ordering::AcqRel) {
            tracing::warn!("[world] [open] conn={} already opened", self.id);
            return self.status(transport);
        }

        let seed: u32 = rand::random();
        self.seed.store(seed, Ordering::Release);
        let challenge = auth::challenge_packet(seed, &rand::random::<[u8; 32]>());

        tracing::info!("[world] [open] conn={} seed={:08X}", self.id, seed);

        if let Err(e) = self.send(&challenge) {
            return self.fail(transport, e);
        }
        self.flush(transport)
    }

    /// Read everything the transport has buffered and dispatch each complete
    /// frame.
    pub fn on_readable<T: Transport + ?Sized>(&self, transport: &mut T) -> SocketStatus {
        if self.is_closed() {
            return self.finish_close(transport);
        }

        let mut input = self.input.lock();
        let InputState { decoder, ping, scratch } = &mut *input;

        loop {
            let n = match transport.read_into(scratch) {
                Ok(IoOutcome::Transferred(n)) => n,
                Ok(IoOutcome::WouldBlock) => break,
                Ok(IoOutcome::Closed) => {
                    drop(input);
                    tracing::info!("[world] [peer_closed] conn={}", self.id);
                    self.shutdown(CloseReason::PeerClosed);
                    return self.finish_close(transport);
                }
                Err(e) => {
                    drop(input);
                    return self.fail(transport, e.into());
                }
            };

            tracing::trace!("[world] [read] conn={} bytes={}", self.id, n);

            if let Err(e) = self.process_input(&scratch[..n], decoder, ping) {
                drop(input);
                return self.fail(transport, e);
            }
            if self.is_closed() {
                break;
            }
        }

        drop(input);
        self.status(transport)
    }

    pub fn on_writable<T: Transport + ?Sized>(&self, transport: &mut T) -> SocketStatus {
        self.flush(transport)
    }

    /// Periodic flush opportunity, independent of write readiness.
    pub fn tick<T: Transport + ?Sized>(&self, transport: &mut T) -> SocketStatus {
        self.flush(transport)
    }

    // ============================================
    // Outbound
    // ============================================

    /// Queue one packet for the client. Callable from any thread; never
    /// touches the socket.
    pub fn send_packet(&self, opcode: Opcode, payload: &[u8]) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        codec::check_payload::<ServerHeader>(payload.len())?;

        let len = codec::frame_len::<ServerHeader>(payload.len());
        self.output.enqueue(len, |dst| {
            let mut crypt = self.crypt.lock();
            codec::encode_into::<ServerHeader>(opcode, payload, &mut crypt, dst);
        })
    }

    pub fn send(&self, packet: &Packet) -> Result<(), ConnectionError> {
        self.send_packet(packet.opcode, &packet.payload)
    }

    /// Idempotent teardown, callable from any thread. The transport itself
    /// is closed by the next entry point on the reactor thread.
    pub fn close_socket(&self) {
        self.shutdown(CloseReason::Requested);
    }

    // ============================================
    // Inbound
    // ============================================

    fn process_input(
        &self,
        mut data: &[u8],
        decoder: &mut FrameDecoder<ClientHeader>,
        ping: &mut PingGuard,
    ) -> Result<(), ConnectionError> {
        while !data.is_empty() && !self.is_closed() {
            let frame = {
                let mut crypt = self.crypt.lock();
                decoder.decode(&mut data, &mut crypt)?
            };
            match frame {
                Some(packet) => self.dispatch(packet, ping)?,
                None => break,
            }
        }
        Ok(())
    }

    fn dispatch(&self, packet: Packet, ping: &mut PingGuard) -> Result<(), ConnectionError> {
        tracing::trace!(
            "[world] [dispatch] conn={} opcode={:#06X} len={} control={}",
            self.id,
            packet.opcode,
            packet.len(),
            opcode::is_control(packet.opcode)
        );

        if self.config.strict_opcodes && !opcode::is_known(packet.opcode) {
            return Err(ProtocolViolation::UnknownOpcode {
                opcode: packet.opcode,
            }
            .into());
        }

        match packet.opcode {
            CMSG_PING => self.handle_ping(&packet, ping),
            CMSG_AUTH_SESSION => self.handle_auth_session(&packet),
            CMSG_KEEP_ALIVE => {
                tracing::debug!("[world] [keep_alive] conn={}", self.id);
                Ok(())
            }
            _ => self.binding.route(packet).map_err(|packet| {
                ProtocolViolation::NotAuthenticated {
                    opcode: packet.opcode,
                }
                .into()
            }),
        }
    }

    fn handle_ping(&self, packet: &Packet, guard: &mut PingGuard) -> Result<(), ConnectionError> {
        let (ping, latency) = if packet.is_empty() {
            (0, 0)
        } else {
            let mut r = packet.reader();
            (r.read_u32("ping")?, r.read_u32("latency")?)
        };

        let now = Instant::now();
        let interval = guard.interval_since_last(now);

        if let PingVerdict::Flood(overspeed) = guard.on_ping(now) {
            let privileged = self
                .binding
                .with_session(|session| session.is_privileged())
                .unwrap_or(false);
            if !privileged {
                return Err(ProtocolViolation::PingFlood { overspeed }.into());
            }
            tracing::debug!(
                "[world] [ping] conn={} privileged session over limit overspeed={}",
                self.id,
                overspeed
            );
        }

        tracing::debug!(
            "[world] [ping] conn={} ping={} latency={} interval_ms={:?}",
            self.id,
            ping,
            latency,
            interval.map(|d| d.as_millis())
        );

        self.latency.store(latency, Ordering::Relaxed);
        self.binding.with_session(|session| session.set_latency(latency));

        self.send(&PacketWriter::with_capacity(4).u32(ping).finish(SMSG_PONG))
    }

    fn handle_auth_session(&self, packet: &Packet) -> Result<(), ConnectionError> {
        if self.is_authenticated() || self.binding.is_bound() {
            return Err(ProtocolViolation::DuplicateAuth.into());
        }

        let request = AuthRequest::parse(&packet.payload, self.seed())?;
        let Some(me) = self.me.upgrade() else {
            return Err(ConnectionError::Closed);
        };

        tracing::debug!(
            "[world] [auth_session] conn={} account={} build={} realm={}",
            self.id,
            request.account,
            request.build,
            request.realm_id
        );

        let grant = match self.authenticator.verify_credentials(&request, &me) {
            AuthOutcome::Granted(grant) => grant,
            AuthOutcome::Rejected(failure) => {
                tracing::warn!(
                    "[world] [auth_failed] conn={} account={} reason={}",
                    self.id,
                    request.account,
                    failure
                );
                self.send(&auth::auth_failed_packet(failure))?;
                if self.config.allow_auth_retry {
                    return Ok(());
                }
                return Err(failure.into());
            }
        };

        self.session_key
            .set(grant.session_key.clone())
            .map_err(|_| CryptError::SessionKeyAlreadySet)?;
        self.crypt.lock().activate(&grant.session_key)?;

        match self.binding.bind(grant.session) {
            Ok(()) => {}
            Err(BindError::AlreadyBound) => return Err(ProtocolViolation::DuplicateAuth.into()),
            Err(BindError::Cleared) => return Err(ConnectionError::Closed),
        }

        self.send(&auth::auth_ok_packet(grant.expansion))?;

        tracing::info!(
            "[world] [auth_ok] conn={} account={} expansion={}",
            self.id,
            request.account,
            grant.expansion
        );
        Ok(())
    }

    // ============================================
    // Teardown
    // ============================================

    fn flush<T: Transport + ?Sized>(&self, transport: &mut T) -> SocketStatus {
        if self.is_closed() {
            return self.finish_close(transport);
        }

        match self.output.flush(transport) {
            Ok(FlushOutcome::Drained) | Ok(FlushOutcome::Pending) => self.status(transport),
            Ok(FlushOutcome::PeerClosed) => {
                tracing::info!("[world] [peer_closed] conn={} during write", self.id);
                self.shutdown(CloseReason::PeerClosed);
                self.finish_close(transport)
            }
            Err(e) => self.fail(transport, e.into()),
        }
    }

    /// Fatal error on the reactor thread: log, close, report.
    fn fail<T: Transport + ?Sized>(&self, transport: &mut T, err: ConnectionError) -> SocketStatus {
        match &err {
            ConnectionError::Protocol(violation) => {
                tracing::warn!("[world] [violation] conn={} {}", self.id, violation);
            }
            ConnectionError::Auth(_) => {
                // result packet is already queued; give it one chance to leave
                if let Err(e) = self.output.flush(transport) {
                    tracing::debug!("[world] [auth_failed] conn={} flush error={}", self.id, e);
                }
            }
            ConnectionError::Closed => {}
            other => {
                tracing::warn!("[world] [error] conn={} {}", self.id, other);
            }
        }

        self.shutdown(CloseReason::from(&err));
        self.finish_close(transport)
    }

    fn shutdown(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason.clone());
            }
        }

        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.output.close();
        if let Some(session) = self.binding.clear() {
            session.on_socket_closed();
        }

        tracing::info!("[world] [close] conn={} reason={:?}", self.id, reason);
    }

    fn finish_close<T: Transport + ?Sized>(&self, transport: &mut T) -> SocketStatus {
        if !self.transport_closed.swap(true, Ordering::AcqRel) {
            transport.close();
        }
        SocketStatus::Closed
    }

    fn status<T: Transport + ?Sized>(&self, transport: &mut T) -> SocketStatus {
        if self.is_closed() {
            self.finish_close(transport)
        } else {
            SocketStatus::Open
        }
    }
}

impl std::fmt::Debug for ConnectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEngine")
            .field("id", &self.id)
            .field("authenticated", &self.is_authenticated())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

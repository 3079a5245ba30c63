use std::fmt;

use cipher::consts::U20;
use cipher::StreamCipher;
use hmac::{digest::KeyInit, Hmac, Mac};
use rc4::Rc4;
use sha1::{Digest, Sha1};

use super::error::CryptError;

type HmacSha1 = Hmac<Sha1>;
type HeaderCipher = Rc4<U20>;

/// Keystream bytes discarded after keying each RC4 stream.
const RC4_DROP: usize = 1024;

/// HMAC seed for the server → client stream.
pub const SERVER_ENCRYPTION_SEED: [u8; 16] = [
    0xCC, 0x98, 0xAE, 0x04, 0xE8, 0x97, 0xEA, 0xCA, 0x12, 0xDD, 0xC0, 0x93, 0x42, 0x91, 0x53, 0x57,
];

/// HMAC seed for the client → server stream.
pub const SERVER_DECRYPTION_SEED: [u8; 16] = [
    0xC2, 0xB3, 0x72, 0x3C, 0xC6, 0xAE, 0xD9, 0xB5, 0x34, 0x3C, 0x53, 0xEE, 0x2F, 0x43, 0x67, 0xCE,
];

/// Session key negotiated during login (little-endian magnitude of the
/// big integer `K`, 40 bytes in practice).
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey(Vec<u8>);

impl SessionKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, CryptError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(CryptError::EmptySessionKey);
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // only a short fingerprint ever reaches the logs
        let shown = self.0.len().min(4);
        write!(f, "SessionKey({}.., {} bytes)", hex::encode(&self.0[..shown]), self.0.len())
    }
}

/// HMAC seeds for the two header streams of one side of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSeeds {
    pub encrypt: [u8; 16],
    pub decrypt: [u8; 16],
}

impl CipherSeeds {
    pub const fn server() -> Self {
        Self {
            encrypt: SERVER_ENCRYPTION_SEED,
            decrypt: SERVER_DECRYPTION_SEED,
        }
    }

    /// Mirror image of [`CipherSeeds::server`], for the peer.
    pub const fn client() -> Self {
        Self {
            encrypt: SERVER_DECRYPTION_SEED,
            decrypt: SERVER_ENCRYPTION_SEED,
        }
    }

    /// Same seed both ways.
    pub const fn symmetric(seed: [u8; 16]) -> Self {
        Self {
            encrypt: seed,
            decrypt: seed,
        }
    }
}

impl Default for CipherSeeds {
    fn default() -> Self {
        Self::server()
    }
}

struct ActiveCipher {
    encrypt: HeaderCipher,
    decrypt: HeaderCipher,
}

/// Header cipher state for one connection.
///
/// Inert until [`activate`](Self::activate): headers pass through in clear
/// text. After activation every header in both directions goes through its
/// RC4 stream. Each call advances the stream, so callers must serialize
/// encryption and emit bytes in the order they were encrypted.
pub struct EncryptionContext {
    seeds: CipherSeeds,
    active: Option<ActiveCipher>,
}

impl EncryptionContext {
    pub fn new(seeds: CipherSeeds) -> Self {
        Self { seeds, active: None }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Key both streams from the session key. One-shot.
    pub fn activate(&mut self, key: &SessionKey) -> Result<(), CryptError> {
        if self.active.is_some() {
            return Err(CryptError::AlreadyActive);
        }
        let encrypt = keyed_stream(&self.seeds.encrypt, key)?;
        let decrypt = keyed_stream(&self.seeds.decrypt, key)?;
        self.active = Some(ActiveCipher { encrypt, decrypt });
        Ok(())
    }

    pub fn encrypt_header(&mut self, header: &mut [u8]) {
        if let Some(active) = self.active.as_mut() {
            active.encrypt.apply_keystream(header);
        }
    }

    pub fn decrypt_header(&mut self, header: &mut [u8]) {
        if let Some(active) = self.active.as_mut() {
            active.decrypt.apply_keystream(header);
        }
    }
}

impl Default for EncryptionContext {
    fn default() -> Self {
        Self::new(CipherSeeds::server())
    }
}

impl fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionContext")
            .field("active", &self.is_active())
            .finish()
    }
}

/// RC4 keyed with HMAC-SHA1(seed, K), first `RC4_DROP` bytes discarded.
fn keyed_stream(seed: &[u8; 16], key: &SessionKey) -> Result<HeaderCipher, CryptError> {
    let mut mac = <HmacSha1 as KeyInit>::new_from_slice(seed)
        .map_err(|_| CryptError::InvalidKeyLength { len: seed.len() })?;
    mac.update(key.as_bytes());
    let digest = mac.finalize().into_bytes();

    let mut stream = <HeaderCipher as KeyInit>::new_from_slice(&digest)
        .map_err(|_| CryptError::InvalidKeyLength { len: digest.len() })?;
    let mut discard = [0u8; RC4_DROP];
    stream.apply_keystream(&mut discard);
    Ok(stream)
}

/// Digest the client sends in its auth session packet to prove it holds `K`:
/// `SHA1(account | 0u32 | client_seed | server_seed | K)`.
pub fn auth_digest(account: &str, client_seed: u32, server_seed: u32, key: &SessionKey) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(account.as_bytes());
    hasher.update(0u32.to_le_bytes());
    hasher.update(client_seed.to_le_bytes());
    hasher.update(server_seed.to_le_bytes());
    hasher.update(key.as_bytes());

    let mut out = [0u8; 20];
    out.copy_from_slice(&hasher.finalize());
    out
}

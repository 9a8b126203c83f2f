//! Session crypto for the fabric transport.
//!
//! The token a client connects with is the root of three derivations:
//!
//! - a **long-term secret** (PBKDF2-HMAC-SHA256 over a fixed salt) used to
//!   wrap the per-connection session key during the handshake,
//! - the **channel id** (SHA-256, salted) naming the broadcast group,
//! - the **tenant id** (64-bit non-cryptographic hash) naming the data
//!   namespace. The tenant id is a key prefix, not a security boundary;
//!   authentication is the handshake's job.
//!
//! After the handshake, every frame in both directions is AES-256-GCM with
//! the session key. The wire layout is `base64(iv(16) || tag(16) || ct)`.
//! Senders generate a fresh IV for every frame; the handshake still carries
//! a session IV for wire compatibility, but receivers always decrypt with
//! the IV found in the frame prefix.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// AES-256-GCM with the fabric's 16-byte IVs.
type FrameCipher = AesGcm<Aes256, U16>;

/// Salt for the token-derived long-term secret. Shared by client and server.
pub const ENCRYPTION_SALT: &[u8] = b"ws_encryption_salt";

/// PBKDF2 iteration count for the token-derived secret.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Salt appended to the token for the channel-id derivation.
pub const CHANNEL_SALT: &str = "_ws_channel_salt_v1";

/// Session key length in bytes.
pub const SESSION_KEY_LEN: usize = 32;

/// Frame IV length in bytes.
pub const IV_LEN: usize = 16;

/// GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Errors from sealing or opening frames.
#[derive(Debug)]
pub enum CryptoError {
    /// The frame was not valid base64.
    Decode(base64::DecodeError),
    /// The frame was too short to carry an IV and tag.
    Truncated,
    /// Encryption failed.
    Encrypt,
    /// Authentication failed: wrong key, tampered frame, or garbage input.
    Decrypt,
    /// An unwrapped session key had the wrong length.
    BadKeyLength(usize),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::Decode(e) => write!(f, "invalid base64: {}", e),
            CryptoError::Truncated => write!(f, "frame shorter than iv + tag"),
            CryptoError::Encrypt => write!(f, "encryption failed"),
            CryptoError::Decrypt => write!(f, "decryption failed"),
            CryptoError::BadKeyLength(n) => write!(f, "unwrapped key has {} bytes, expected 32", n),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<base64::DecodeError> for CryptoError {
    fn from(e: base64::DecodeError) -> Self {
        CryptoError::Decode(e)
    }
}

/// Derive the long-term secret for a token.
///
/// Pure function of the token; both ends compute it independently.
pub fn derive_token_secret(token: &str) -> [u8; SESSION_KEY_LEN] {
    let mut secret = [0u8; SESSION_KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        token.as_bytes(),
        ENCRYPTION_SALT,
        PBKDF2_ITERATIONS,
        &mut secret,
    );
    secret
}

/// Derive the broadcast channel id for a token.
///
/// `channel_` followed by the first 16 hex chars of
/// `SHA-256(token || CHANNEL_SALT)`.
pub fn derive_channel_id(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(CHANNEL_SALT.as_bytes());
    let digest = hasher.finalize();
    format!("channel_{}", hex::encode(&digest[..8]))
}

/// Derive the tenant id for a token.
///
/// `user_` followed by a 64-bit hash of the token. Deliberately a distinct
/// derivation from [`derive_channel_id`]: tenant = data namespace, channel =
/// broadcast group.
pub fn derive_tenant_id(token: &str) -> String {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    format!("user_{:016x}", hasher.finish())
}

/// Generate a fresh random session key.
pub fn generate_session_key() -> [u8; SESSION_KEY_LEN] {
    let mut key = [0u8; SESSION_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Generate a fresh random IV.
pub fn generate_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Seal a plaintext under `key` with a fresh IV.
///
/// Output is `base64(iv || tag || ciphertext)`.
pub fn seal(key: &[u8; SESSION_KEY_LEN], plaintext: &[u8]) -> Result<String, CryptoError> {
    let iv = generate_iv();
    let cipher = FrameCipher::new(GenericArray::from_slice(key));
    let sealed = cipher
        .encrypt(GenericArray::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    // aes-gcm appends the tag to the ciphertext; the wire wants it up front.
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);
    let mut framed = Vec::with_capacity(IV_LEN + TAG_LEN + ciphertext.len());
    framed.extend_from_slice(&iv);
    framed.extend_from_slice(tag);
    framed.extend_from_slice(ciphertext);
    Ok(BASE64.encode(framed))
}

/// Open a `base64(iv || tag || ciphertext)` frame under `key`.
pub fn open(key: &[u8; SESSION_KEY_LEN], frame: &str) -> Result<Vec<u8>, CryptoError> {
    let raw = BASE64.decode(frame)?;
    if raw.len() < IV_LEN + TAG_LEN {
        return Err(CryptoError::Truncated);
    }
    let (iv, rest) = raw.split_at(IV_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);
    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);
    let cipher = FrameCipher::new(GenericArray::from_slice(key));
    cipher
        .decrypt(GenericArray::from_slice(iv), sealed.as_ref())
        .map_err(|_| CryptoError::Decrypt)
}

/// Wrap a session key under the token-derived secret for the handshake.
pub fn wrap_session_key(
    secret: &[u8; SESSION_KEY_LEN],
    session_key: &[u8; SESSION_KEY_LEN],
) -> Result<String, CryptoError> {
    seal(secret, session_key)
}

/// Unwrap the handshake's sealed session key.
pub fn unwrap_session_key(
    secret: &[u8; SESSION_KEY_LEN],
    wrapped: &str,
) -> Result<[u8; SESSION_KEY_LEN], CryptoError> {
    let bytes = open(secret, wrapped)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CryptoError::BadKeyLength(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key = generate_session_key();
        let frame = seal(&key, b"hello fabric").unwrap();
        assert_eq!(open(&key, &frame).unwrap(), b"hello fabric");
    }

    #[test]
    fn fresh_iv_per_frame() {
        let key = generate_session_key();
        let a = seal(&key, b"same plaintext").unwrap();
        let b = seal(&key, b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn open_rejects_wrong_key() {
        let frame = seal(&generate_session_key(), b"secret").unwrap();
        let other = generate_session_key();
        assert!(matches!(open(&other, &frame), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn open_rejects_tampering() {
        let key = generate_session_key();
        let frame = seal(&key, b"secret").unwrap();
        let mut raw = BASE64.decode(&frame).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);
        assert!(matches!(open(&key, &tampered), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn open_rejects_garbage() {
        let key = generate_session_key();
        assert!(matches!(open(&key, "not base64!!"), Err(CryptoError::Decode(_))));
        assert!(matches!(open(&key, "AAAA"), Err(CryptoError::Truncated)));
    }

    #[test]
    fn session_key_wrap_round_trip() {
        let secret = derive_token_secret("meow moew meow");
        let session_key = generate_session_key();
        let wrapped = wrap_session_key(&secret, &session_key).unwrap();
        assert_eq!(unwrap_session_key(&secret, &wrapped).unwrap(), session_key);
    }

    #[test]
    fn derivations_are_stable_and_distinct() {
        let token = "meow moew meow";
        assert_eq!(derive_channel_id(token), derive_channel_id(token));
        assert_eq!(derive_tenant_id(token), derive_tenant_id(token));
        assert_eq!(derive_token_secret(token), derive_token_secret(token));

        let channel = derive_channel_id(token);
        assert!(channel.starts_with("channel_"));
        assert_eq!(channel.len(), "channel_".len() + 16);

        let tenant = derive_tenant_id(token);
        assert!(tenant.starts_with("user_"));
        assert_eq!(tenant.len(), "user_".len() + 16);

        // Different tokens land in different channels and namespaces.
        assert_ne!(derive_channel_id("alpha"), derive_channel_id("beta"));
        assert_ne!(derive_tenant_id("alpha"), derive_tenant_id("beta"));
    }
}

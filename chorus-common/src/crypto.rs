//! Authenticated payload encryption
//!
//! Every audio payload is sealed with AES-256-GCM under a pre-shared 256-bit
//! key. A fresh random 96-bit nonce is generated per seal and prepended, so
//! a sealed payload is `nonce(12) || ciphertext || tag(16)`. Nonce
//! uniqueness comes from the OS random generator; there is no counter state
//! to coordinate between the two ends.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;

/// Key length in bytes (AES-256)
pub const KEY_LEN: usize = 32;

/// Nonce length in bytes (96-bit, the GCM standard size)
pub const NONCE_LEN: usize = 12;

/// Authentication tag length in bytes
pub const TAG_LEN: usize = 16;

// =============================================================================
// Errors
// =============================================================================

/// Errors from sealing or opening payloads
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The configured key does not decode to exactly [`KEY_LEN`] bytes
    #[error("invalid key: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    /// The configured key is not valid base64
    #[error("key is not valid base64: {0}")]
    InvalidKeyEncoding(#[from] base64::DecodeError),

    /// Tag mismatch, truncated input, or otherwise unauthentic payload
    #[error("authentication failed")]
    Authentication,

    /// The cryptographic backend refused to seal (effectively unreachable
    /// for payloads under the datagram size limit)
    #[error("encryption failed")]
    Encryption,
}

// =============================================================================
// Secret Key
// =============================================================================

/// A pre-shared 256-bit symmetric key
///
/// Must be identical on sender and receiver. Loaded once at session start;
/// the `Debug` impl never prints key material.
#[derive(Clone)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Decode a key from its base64 configuration form
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64.decode(encoded.trim())?;
        let bytes: [u8; KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(bytes))
    }

    /// Generate a random key (for tests and key provisioning)
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Encode the key in its base64 configuration form
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

// =============================================================================
// Seal / Open
// =============================================================================

/// Encrypt a payload, producing `nonce || ciphertext || tag`
pub fn seal(key: &SecretKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = key
        .cipher()
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt a sealed payload
///
/// Fails with [`CryptoError::Authentication`] on tag mismatch or any
/// malformed input. Callers treat that as a discard, never a crash.
pub fn open(key: &SecretKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Authentication);
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    key.cipher()
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Authentication)
}

// =============================================================================
// Tests
// =============================================================================

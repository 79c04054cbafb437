//! AES-256-GCM encryption for secrets at rest.
//!
//! The vault passphrase is stretched to a 256-bit cipher key with
//! PBKDF2-HMAC-SHA256 under a fixed application-wide salt. The fixed salt is a
//! deliberate trade-off: key material stays reproducible across restarts
//! without per-secret salt bookkeeping, at the cost of rainbow-table
//! resistance beyond what the slow KDF already provides.
//!
//! Every encryption call draws a fresh random 96-bit IV, so encrypting the
//! same plaintext twice never yields the same ciphertext. The GCM tag is
//! stored separately from the ciphertext so a persisted record is always the
//! `(ciphertext, iv, auth_tag)` triple.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64, engine::general_purpose::URL_SAFE_NO_PAD};
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

/// Cipher key size in bytes (AES-256).
const KEY_SIZE: usize = 32;

/// IV size in bytes (96 bits, standard for GCM).
const IV_SIZE: usize = 12;

/// GCM authentication tag size in bytes.
const TAG_SIZE: usize = 16;

/// PBKDF2 iteration count. Slow enough to blunt offline guessing, fast
/// enough that key derivation happens once per vault open, not per request.
const KDF_ITERATIONS: u32 = 100_000;

/// Fixed application-wide KDF salt. See the module docs for the trade-off.
const KDF_SALT: &[u8] = b"mcp-auth-gateway/token-vault/v1";

/// Minimum accepted passphrase length.
const MIN_KEY_LENGTH: usize = 32;

/// Error variants for encryption failures.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Decryption failed: wrong key, or ciphertext/tag tampered with.
    #[error("decryption failed: authentication tag did not verify")]
    Decrypt,

    /// Encryption failed (cipher-internal error).
    #[error("encryption failed")]
    Encrypt,

    /// A stored field was not valid base64.
    #[error("invalid base64 in stored record: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// A stored IV or tag had the wrong length.
    #[error("invalid {field} length: expected {expected}, got {actual}")]
    BadLength {
        /// Which field was malformed.
        field: &'static str,
        /// Expected byte length.
        expected: usize,
        /// Actual byte length.
        actual: usize,
    },

    /// The decrypted bytes were not valid UTF-8.
    #[error("decrypted data is not valid UTF-8")]
    NotUtf8,

    /// Passphrase rejected by strength validation.
    #[error("weak encryption key: {0}")]
    WeakKey(String),
}

/// Persisted encryption triple. All fields base64-encoded.
///
/// Invariant: exactly one valid `(iv, auth_tag)` pair exists for a record
/// under the key that produced it; plaintext is never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretBox {
    /// Ciphertext without the GCM tag.
    pub ciphertext: String,
    /// The random IV drawn for this encryption call.
    pub iv: String,
    /// GCM authentication tag.
    pub auth_tag: String,
}

/// A cipher key derived from a passphrase, ready for encrypt/decrypt calls.
///
/// Derivation is deterministic: the same passphrase always yields the same
/// key, so records written before a restart stay readable after it.
#[derive(Clone)]
pub struct DerivedKey {
    key: [u8; KEY_SIZE],
}

impl DerivedKey {
    /// Stretch a passphrase into a 256-bit cipher key.
    #[must_use]
    pub fn from_passphrase(passphrase: &str) -> Self {
        let mut key = [0u8; KEY_SIZE];
        pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), KDF_SALT, KDF_ITERATIONS, &mut key);
        Self { key }
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never leak key material through Debug output
        f.write_str("DerivedKey(..)")
    }
}

/// Encrypt a plaintext under the derived key with a fresh random IV.
pub fn encrypt(plaintext: &str, key: &DerivedKey) -> Result<SecretBox, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(&key.key).map_err(|_| CryptoError::Encrypt)?;
    let iv = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut sealed = cipher
        .encrypt(&iv, plaintext.as_bytes())
        .map_err(|_| CryptoError::Encrypt)?;

    // aes-gcm appends the tag to the ciphertext; split it back out so the
    // stored record carries the (ciphertext, iv, auth_tag) triple.
    let tag = sealed.split_off(sealed.len() - TAG_SIZE);

    Ok(SecretBox {
        ciphertext: BASE64.encode(&sealed),
        iv: BASE64.encode(iv),
        auth_tag: BASE64.encode(&tag),
    })
}

/// Decrypt a stored record, failing closed on any tampering or wrong key.
pub fn decrypt(boxed: &SecretBox, key: &DerivedKey) -> Result<String, CryptoError> {
    let mut ciphertext = BASE64.decode(&boxed.ciphertext)?;
    let iv = BASE64.decode(&boxed.iv)?;
    let tag = BASE64.decode(&boxed.auth_tag)?;

    if iv.len() != IV_SIZE {
        return Err(CryptoError::BadLength {
            field: "iv",
            expected: IV_SIZE,
            actual: iv.len(),
        });
    }
    if tag.len() != TAG_SIZE {
        return Err(CryptoError::BadLength {
            field: "auth_tag",
            expected: TAG_SIZE,
            actual: tag.len(),
        });
    }

    let cipher = Aes256Gcm::new_from_slice(&key.key).map_err(|_| CryptoError::Decrypt)?;
    ciphertext.extend_from_slice(&tag);

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
        .map_err(|_| CryptoError::Decrypt)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::NotUtf8)
}

/// Generate a fresh random vault passphrase (32 bytes, base64url).
#[must_use]
pub fn generate_key() -> String {
    use rand::RngExt;
    let random_bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Validate passphrase strength.
///
/// Rejects passphrases under [`MIN_KEY_LENGTH`] characters, and passphrases
/// whose unique-character count falls below `min(0.3 * len, 10)` — a cheap
/// heuristic that catches `"aaaa..."`-style keys.
pub fn validate_key(passphrase: &str) -> Result<(), CryptoError> {
    if passphrase.len() < MIN_KEY_LENGTH {
        return Err(CryptoError::WeakKey(format!(
            "must be at least {MIN_KEY_LENGTH} characters, got {}",
            passphrase.len()
        )));
    }

    let unique: std::collections::HashSet<char> = passphrase.chars().collect();
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let required = ((passphrase.len() as f64 * 0.3).min(10.0)) as usize;
    if unique.len() < required {
        return Err(CryptoError::WeakKey(format!(
            "insufficient character diversity: {} unique characters, need {required}",
            unique.len()
        )));
    }

    Ok(())
}

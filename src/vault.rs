//! Credential vault: symmetric authenticated encryption for per-tenant
//! upstream credentials.
//!
//! Ciphertexts use the compact `1:<nonce>:<ciphertext>` wire format with
//! base64 fields. The key comes from `SYMMETRIC_ENCRYPTION_KEY`, either a
//! base64-encoded 32-byte key or an arbitrary passphrase stretched with
//! iterated SHA-256.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{Result, ScrapeError};
use crate::models::Credentials;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const STRETCH_ITERATIONS: u32 = 100_000;
const FORMAT_VERSION: &str = "1";

/// Installation-wide salt for passphrase stretching. Changing it invalidates
/// every stored credential.
const KEY_SALT: &[u8] = b"conectasei.credential.vault.v1";

/// Vault holding the process-global credential key.
#[derive(Clone)]
pub struct CredentialVault {
    key: [u8; KEY_SIZE],
}

impl CredentialVault {
    /// Build a vault from the configured key material.
    pub fn from_key_material(material: &str) -> Result<Self> {
        if material.is_empty() {
            return Err(ScrapeError::Config("encryption key material is empty".into()));
        }

        // A base64-encoded 32-byte value is used verbatim; anything else is
        // treated as a passphrase and stretched.
        let key = match BASE64.decode(material) {
            Ok(raw) if raw.len() == KEY_SIZE => {
                let mut key = [0u8; KEY_SIZE];
                key.copy_from_slice(&raw);
                key
            }
            _ => stretch_passphrase(material),
        };

        Ok(Self { key })
    }

    /// Encrypt an arbitrary byte payload.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

        let mut rng = rand::rng();
        let nonce_bytes: [u8; NONCE_SIZE] = std::array::from_fn(|_| rng.random());
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| ScrapeError::Config(format!("encryption failed: {e}")))?;

        let wire = format!(
            "{FORMAT_VERSION}:{}:{}",
            BASE64.encode(nonce_bytes),
            BASE64.encode(ciphertext)
        );
        Ok(wire.into_bytes())
    }

    /// Decrypt a payload produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let wire = std::str::from_utf8(ciphertext)
            .map_err(|_| ScrapeError::Config("encrypted payload is not valid UTF-8".into()))?;

        let mut parts = wire.splitn(3, ':');
        let version = parts.next().unwrap_or_default();
        let nonce_b64 = parts.next().unwrap_or_default();
        let ct_b64 = parts.next().unwrap_or_default();

        if version != FORMAT_VERSION || nonce_b64.is_empty() || ct_b64.is_empty() {
            return Err(ScrapeError::Config("unrecognized encrypted payload format".into()));
        }

        let nonce_bytes = BASE64
            .decode(nonce_b64)
            .map_err(|e| ScrapeError::Config(format!("invalid nonce encoding: {e}")))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(ScrapeError::Config("invalid nonce size".into()));
        }

        let ct = BASE64
            .decode(ct_b64)
            .map_err(|e| ScrapeError::Config(format!("invalid ciphertext encoding: {e}")))?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ct.as_ref())
            .map_err(|_| ScrapeError::Config("credential decryption failed".into()))
    }

    /// Encrypt a credential pair as a JSON payload.
    pub fn encrypt_credentials(&self, credentials: &Credentials) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(credentials)
            .map_err(|e| ScrapeError::Config(format!("credential serialization failed: {e}")))?;
        self.encrypt(&json)
    }

    /// Decrypt a credential pair stored by
    /// [`encrypt_credentials`](Self::encrypt_credentials).
    pub fn decrypt_credentials(&self, ciphertext: &[u8]) -> Result<Credentials> {
        let plaintext = self.decrypt(ciphertext)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| ScrapeError::Config(format!("credential deserialization failed: {e}")))
    }
}

fn stretch_passphrase(passphrase: &str) -> [u8; KEY_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(passphrase.as_bytes());
    hasher.update(KEY_SALT);
    let mut digest = hasher.finalize_reset();

    for _ in 0..STRETCH_ITERATIONS {
        hasher.update(digest);
        hasher.update(KEY_SALT);
        digest = hasher.finalize_reset();
    }

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&digest);
    key
}

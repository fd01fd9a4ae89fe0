// Symmetric encryption for per-lease access secrets at rest.
//
// ChaCha20-Poly1305 with a process-wide key supplied by configuration and a
// random nonce prepended to each ciphertext. Stored form is base64 of
// `nonce || ciphertext`. The vault is an injected value, not a module-level
// singleton; callers treat `DecryptionFailed` as missing-secret.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Nonce,
};

const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VaultError {
    #[error("secret encryption failed")]
    EncryptionFailed,
    #[error("stored secret could not be decrypted")]
    DecryptionFailed,
}

#[derive(Clone)]
pub struct Vault {
    cipher: ChaCha20Poly1305,
}

impl Vault {
    /// Build a vault from a base64-encoded 32-byte key.
    pub fn from_base64_key(key: &str) -> Result<Self> {
        let key_bytes = BASE64.decode(key).context("vault key is not valid base64")?;
        if key_bytes.len() != 32 {
            bail!("vault key must decode to exactly 32 bytes, got {}", key_bytes.len());
        }
        let cipher = ChaCha20Poly1305::new_from_slice(&key_bytes)
            .context("vault key rejected by cipher")?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::EncryptionFailed)?;

        let mut wire = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(wire))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, VaultError> {
        let wire = BASE64.decode(stored).map_err(|_| VaultError::DecryptionFailed)?;
        if wire.len() <= NONCE_LEN {
            return Err(VaultError::DecryptionFailed);
        }
        let (nonce, ciphertext) = wire.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| VaultError::DecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| VaultError::DecryptionFailed)
    }

    /// `None` in, `None` out; leases may legitimately carry no secret.
    pub fn encrypt_opt(&self, plaintext: Option<&str>) -> Result<Option<String>, VaultError> {
        plaintext.map(|value| self.encrypt(value)).transpose()
    }

    /// `None` in, `None` out.
    pub fn decrypt_opt(&self, stored: Option<&str>) -> Result<Option<String>, VaultError> {
        stored.map(|value| self.decrypt(value)).transpose()
    }
}

//! Secret sealing at rest
//!
//! Secrets are serialized to JSON and sealed with AES-256-GCM under a
//! process-wide key derived from the `DBVAULT_SECRET_KEY` passphrase via
//! Argon2 with a fixed application salt. The ciphertext carries a random
//! nonce, so tampering (or a wrong key) fails decryption.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;

use super::SECRET_KEY_ENV;
use crate::error::{Error, Result};
use crate::models::Secrets;

// Fixed application salt - changing this would invalidate all sealed secrets.
const APP_SALT: &[u8; 16] = b"dbvault-seal-v1.";

const NONCE_LEN: usize = 12;

/// Process-wide secret sealer. Cheap to clone.
#[derive(Clone)]
pub struct SecretSealer {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretSealer")
    }
}

impl SecretSealer {
    /// Build the sealer from the `DBVAULT_SECRET_KEY` environment variable.
    pub fn from_env() -> Result<Self> {
        let passphrase = std::env::var(SECRET_KEY_ENV).map_err(|_| {
            Error::Secret(format!(
                "secret sealing requires the {} environment variable",
                SECRET_KEY_ENV
            ))
        })?;
        Self::from_passphrase(&passphrase)
    }

    /// Derive the sealing key from a passphrase with Argon2.
    pub fn from_passphrase(passphrase: &str) -> Result<Self> {
        let mut key = [0u8; 32];
        argon2::Argon2::default()
            .hash_password_into(passphrase.as_bytes(), APP_SALT, &mut key)
            .map_err(|e| Error::Secret(format!("key derivation failed: {}", e)))?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| Error::Secret(format!("invalid sealing key: {}", e)))?;
        Ok(Self { cipher })
    }

    /// Seal a plaintext string: base64(nonce || ciphertext).
    pub fn seal_str(&self, plain: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plain.as_bytes())
            .map_err(|_| Error::Secret("seal failed".into()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Open a sealed string. Fails on tampering or a different key.
    pub fn open_str(&self, sealed: &str) -> Result<String> {
        let blob = BASE64
            .decode(sealed)
            .map_err(|_| Error::Secret("sealed blob is not valid base64".into()))?;
        if blob.len() < NONCE_LEN {
            return Err(Error::Secret("sealed blob is truncated".into()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plain = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::Secret("secret authentication failed".into()))?;
        String::from_utf8(plain).map_err(|_| Error::Secret("sealed secret is not UTF-8".into()))
    }

    /// Seal a [`Secrets`] value as one blob.
    pub fn seal(&self, secrets: &Secrets) -> Result<String> {
        self.seal_str(&serde_json::to_string(secrets)?)
    }

    /// Open a sealed [`Secrets`] blob.
    pub fn open(&self, sealed: &str) -> Result<Secrets> {
        let json = self.open_str(sealed)?;
        Ok(serde_json::from_str(&json)?)
    }
}

//! Encrypt-at-rest for local log lines.
//!
//! Each stored message is one line: `base64(nonce12 ‖ ciphertext‖tag)`
//! under ChaCha20-Poly1305 with a process-local storage key. The key is
//! either 32 random bytes persisted by the caller, or derived from
//! `AGENT_PULSE_KEY_PASSWORD` with PBKDF2-HMAC-SHA256.

use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{CryptoError, Result};

/// Nonce size for ChaCha20-Poly1305 (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Storage key size (256 bits).
pub const KEY_SIZE: usize = 32;

/// PBKDF2 salt for password-derived keys, fixed by the deployed format.
const PBKDF2_SALT: &[u8] = b"agent-pulse-storage";

/// PBKDF2 iteration count.
const PBKDF2_ROUNDS: u32 = 100_000;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// The process-local symmetric key for the message log.
pub struct StorageKey([u8; KEY_SIZE]);

impl StorageKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Parse a key from its persisted hex form.
    pub fn from_hex(key_hex: &str) -> Result<Self> {
        let bytes =
            hex::decode(key_hex.trim()).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "expected {KEY_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }

    /// Derive a key from a password.
    pub fn from_password(password: &str) -> Self {
        let mut key = [0u8; KEY_SIZE];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), PBKDF2_SALT, PBKDF2_ROUNDS, &mut key);
        Self(key)
    }

    /// Hex form for persistence.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Encrypt one log line.
    pub fn seal_line(&self, plaintext: &[u8]) -> Result<String> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        let nonce_bytes: [u8; NONCE_SIZE] = rand::random();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CryptoError::Decryption)?;

        let mut framed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        framed.extend_from_slice(&nonce_bytes);
        framed.extend_from_slice(&ciphertext);
        Ok(B64.encode(framed))
    }

    /// Decrypt one log line.
    pub fn open_line(&self, line: &str) -> Result<Vec<u8>> {
        let framed = B64
            .decode(line.trim())
            .map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
        if framed.len() < NONCE_SIZE {
            return Err(CryptoError::InvalidInput("line too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = framed.split_at(NONCE_SIZE);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::Decryption)
    }
}

impl Drop for StorageKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl Clone for StorageKey {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl std::fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageKey").finish_non_exhaustive()
    }
}

//! Topic-derived group keys and message framing.
//!
//! Every member of a group derives the same AEAD key and IV prefix from the
//! group topic with HKDF-SHA256. A message is framed as
//! `base64(iv8) ":" base64(ciphertext)` where the AEAD nonce is the 8-byte
//! derived prefix followed by 8 random bytes.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::AesGcm;
use base64::Engine;
use hkdf::Hkdf;
use sha2::Sha256;

use crate::{CryptoError, Result};

type GroupCipher = AesGcm<aes::Aes256, U16>;

/// HKDF salt fixed by the deployed group-message format.
const KDF_SALT: &[u8] = b"agent-p2p-group-v2";

/// Info string for the AEAD key.
const INFO_KEY: &[u8] = b"encryption";

/// Info string for the IV prefix.
const INFO_IV: &[u8] = b"iv";

/// Length of the random nonce suffix carried on the wire.
const IV_RANDOM_SIZE: usize = 8;

/// Length of the derived nonce prefix.
const IV_PREFIX_SIZE: usize = 8;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Key material shared by all members of one group topic.
#[derive(Clone)]
pub struct GroupKey {
    key: [u8; 32],
    iv_prefix: [u8; IV_PREFIX_SIZE],
}

impl GroupKey {
    /// Derive the group key for a topic.
    pub fn derive(topic: &str) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), topic.as_bytes());

        let mut key = [0u8; 32];
        hk.expand(INFO_KEY, &mut key)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        let mut iv_prefix = [0u8; IV_PREFIX_SIZE];
        hk.expand(INFO_IV, &mut iv_prefix)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        Ok(Self { key, iv_prefix })
    }

    /// Encrypt a plaintext for the group.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let iv_random: [u8; IV_RANDOM_SIZE] = rand::random();
        let mut nonce = [0u8; IV_PREFIX_SIZE + IV_RANDOM_SIZE];
        nonce[..IV_PREFIX_SIZE].copy_from_slice(&self.iv_prefix);
        nonce[IV_PREFIX_SIZE..].copy_from_slice(&iv_random);

        let cipher = GroupCipher::new_from_slice(&self.key)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Decryption)?;

        Ok(format!("{}:{}", B64.encode(iv_random), B64.encode(ciphertext)))
    }

    /// Decrypt a `base64(iv8):base64(ct)` group frame.
    pub fn decrypt(&self, content: &str) -> Result<Vec<u8>> {
        let (iv_b64, ct_b64) = content
            .split_once(':')
            .ok_or_else(|| CryptoError::InvalidInput("missing iv separator".to_string()))?;

        let iv_random = B64
            .decode(iv_b64)
            .map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
        if iv_random.len() != IV_RANDOM_SIZE {
            return Err(CryptoError::InvalidInput(format!(
                "iv must be {IV_RANDOM_SIZE} bytes, got {}",
                iv_random.len()
            )));
        }
        let ciphertext = B64
            .decode(ct_b64)
            .map_err(|e| CryptoError::InvalidInput(e.to_string()))?;

        let mut nonce = [0u8; IV_PREFIX_SIZE + IV_RANDOM_SIZE];
        nonce[..IV_PREFIX_SIZE].copy_from_slice(&self.iv_prefix);
        nonce[IV_PREFIX_SIZE..].copy_from_slice(&iv_random);

        let cipher = GroupCipher::new_from_slice(&self.key)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        cipher
            .decrypt(aes_gcm::Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| CryptoError::Decryption)
    }
}

impl Drop for GroupKey {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.key.zeroize();
    }
}

impl std::fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupKey").finish_non_exhaustive()
    }
}

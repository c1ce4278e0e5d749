//! secp256k1 keypairs with BIP-340 x-only public keys.
//!
//! The protocol identifies agents by the 32-byte x-coordinate of their
//! secp256k1 public key, transported as lowercase hex. This module wraps
//! `k256` with agent-pulse types. The raw secret bytes are kept as loaded:
//! the Schnorr layer may normalize the scalar internally, and a persisted
//! identity must survive a load/store roundtrip byte-for-byte.

use k256::schnorr::{SigningKey, VerifyingKey};
use zeroize::Zeroize;

use crate::{CryptoError, Result};

/// Size of a secret key in bytes.
pub const SECRET_KEY_SIZE: usize = 32;

/// Size of an x-only public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// A long-term agent keypair.
pub struct Keypair {
    secret: [u8; SECRET_KEY_SIZE],
    signing: SigningKey,
    public_hex: String,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        loop {
            let secret: [u8; SECRET_KEY_SIZE] = rand::random();
            // Rejected only for 0 or >= the group order; retry is immediate.
            if let Ok(kp) = Self::from_secret_bytes(&secret) {
                return kp;
            }
        }
    }

    /// Build a keypair from raw secret bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SECRET_KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "expected {SECRET_KEY_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let signing =
            SigningKey::from_bytes(bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let public_hex = hex::encode(signing.verifying_key().to_bytes());
        let mut secret = [0u8; SECRET_KEY_SIZE];
        secret.copy_from_slice(bytes);
        Ok(Self {
            secret,
            signing,
            public_hex,
        })
    }

    /// Build a keypair from a 64-char hex secret.
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self> {
        let mut bytes = hex::decode(secret_hex.trim())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let result = Self::from_secret_bytes(&bytes);
        bytes.zeroize();
        result
    }

    /// The x-only public key, lowercase hex.
    pub fn public_hex(&self) -> &str {
        &self.public_hex
    }

    /// Raw secret bytes as loaded. Callers gate exposure behind export
    /// authorization.
    pub fn secret_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.secret
    }

    /// Secret key as lowercase hex.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret)
    }

    /// The underlying Schnorr signing key.
    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing
    }
}

impl Drop for Keypair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self {
            secret: self.secret,
            signing: self.signing.clone(),
            public_hex: self.public_hex.clone(),
        }
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public_hex)
            .finish()
    }
}

/// Parse an x-only public key from hex.
pub fn verifying_key_from_hex(pubkey_hex: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(pubkey_hex).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    if bytes.len() != PUBLIC_KEY_SIZE {
        return Err(CryptoError::InvalidKey(format!(
            "expected {PUBLIC_KEY_SIZE} bytes, got {}",
            bytes.len()
        )));
    }
    VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Whether a string is a plausible x-only public key (64 hex chars naming a
/// valid curve point).
pub fn is_valid_pubkey_hex(pubkey_hex: &str) -> bool {
    pubkey_hex.len() == PUBLIC_KEY_SIZE * 2 && verifying_key_from_hex(pubkey_hex).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_has_valid_public() {
        let kp = Keypair::generate();
        assert_eq!(kp.public_hex().len(), 64);
        assert!(is_valid_pubkey_hex(kp.public_hex()));
    }

    #[test]
    fn test_hex_roundtrip_preserves_secret() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_hex(&kp.secret_hex()).expect("restore");
        assert_eq!(kp.secret_hex(), restored.secret_hex());
        assert_eq!(kp.public_hex(), restored.public_hex());
    }

    #[test]
    fn test_deterministic_derivation() {
        let seed = [7u8; 32];
        let a = Keypair::from_secret_bytes(&seed).expect("keypair");
        let b = Keypair::from_secret_bytes(&seed).expect("keypair");
        assert_eq!(a.public_hex(), b.public_hex());
        assert_eq!(a.secret_bytes(), &seed);
    }

    #[test]
    fn test_zero_secret_rejected() {
        assert!(Keypair::from_secret_bytes(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_short_hex_rejected() {
        assert!(Keypair::from_secret_hex("abcd").is_err());
    }

    #[test]
    fn test_invalid_pubkey_rejected() {
        assert!(!is_valid_pubkey_hex("zz"));
        // 64 hex chars that do not name a curve point
        assert!(!is_valid_pubkey_hex(&"ff".repeat(32)));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let kp = Keypair::generate();
        let debug = format!("{kp:?}");
        assert!(!debug.contains(&kp.secret_hex()));
    }
}

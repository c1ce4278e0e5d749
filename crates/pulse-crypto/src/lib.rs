//! # pulse-crypto
//!
//! Cryptographic operations for the agent-pulse protocol. The suite is
//! fixed; no algorithm negotiation.
//!
//! ## Modules
//!
//! - [`keys`] — secp256k1 keypairs with BIP-340 x-only public keys
//! - [`event`] — event canonicalization, SHA-256 ids, Schnorr sign/verify
//! - [`payload`] — the signed application-payload envelope
//! - [`dm`] — NIP-04 direct-message encryption (ECDH + AES-256-CBC)
//! - [`group`] — topic-derived group keys (HKDF-SHA256) and AEAD framing
//! - [`envelope`] — local encrypt-at-rest for log lines (ChaCha20-Poly1305)
//! - [`bech32`] — npub/nsec human-readable key encoding

pub mod bech32;
pub mod dm;
pub mod envelope;
pub mod event;
pub mod group;
pub mod keys;
pub mod payload;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Schnorr signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// Event id does not match the canonical hash.
    #[error("event id mismatch")]
    IdMismatch,

    /// AEAD or CBC decryption failed.
    #[error("decryption failed")]
    Decryption,

    /// Key material was malformed.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A bech32 string decoded to a different kind than expected.
    #[error("key type mismatch: expected {expected}, got {actual}")]
    KeyTypeMismatch { expected: String, actual: String },

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Malformed ciphertext or wire string.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

//! Human-readable key encoding (NIP-19).
//!
//! Public keys travel as `npub1…`, secret keys as `nsec1…`, event ids as
//! `note1…`; all are plain Bech32 over the raw 32 bytes.

use bech32::{Bech32, Hrp};

use crate::{CryptoError, Result};

/// The kinds of values this codec handles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyKind {
    /// `npub` — x-only public key.
    Public,
    /// `nsec` — secret key.
    Secret,
    /// `note` — event id.
    EventId,
}

impl KeyKind {
    fn hrp(self) -> &'static str {
        match self {
            KeyKind::Public => "npub",
            KeyKind::Secret => "nsec",
            KeyKind::EventId => "note",
        }
    }
}

/// Encode 32 hex-encoded bytes into the human-readable form for `kind`.
pub fn encode(kind: KeyKind, data_hex: &str) -> Result<String> {
    let bytes = hex::decode(data_hex).map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(CryptoError::InvalidInput(format!(
            "expected 32 bytes, got {}",
            bytes.len()
        )));
    }
    let hrp = Hrp::parse(kind.hrp()).map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, &bytes).map_err(|e| CryptoError::InvalidInput(e.to_string()))
}

/// Decode a human-readable string, requiring it to be of `expected` kind.
///
/// Returns the lowercase hex of the carried bytes. A well-formed string of
/// a different kind fails with [`CryptoError::KeyTypeMismatch`].
pub fn decode(encoded: &str, expected: KeyKind) -> Result<String> {
    let (hrp, data) =
        bech32::decode(encoded.trim()).map_err(|e| CryptoError::InvalidInput(e.to_string()))?;

    if hrp.as_str() != expected.hrp() {
        return Err(CryptoError::KeyTypeMismatch {
            expected: expected.hrp().to_string(),
            actual: hrp.as_str().to_string(),
        });
    }
    if data.len() != 32 {
        return Err(CryptoError::InvalidInput(format!(
            "expected 32 bytes, got {}",
            data.len()
        )));
    }
    Ok(hex::encode(data))
}

/// Accept either a 64-char hex key or an `npub` string; return hex.
pub fn normalize_pubkey(input: &str) -> Result<String> {
    let trimmed = input.trim();
    if trimmed.starts_with("npub1") {
        return decode(trimmed, KeyKind::Public);
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.len() == 64 && lower.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Ok(lower);
    }
    Err(CryptoError::InvalidInput(
        "expected 64-char hex or npub string".to_string(),
    ))
}

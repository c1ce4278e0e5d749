//! The signed application-payload envelope.
//!
//! A payload travels as `{content, timestamp, signature}` where `signature`
//! is Schnorr over the SHA-256 of the canonical JSON of
//! `{content, timestamp}` — object keys sorted recursively, no added
//! whitespace. Bare payloads without the envelope are legal; their
//! signature status is reported as unknown rather than invalid.

use k256::schnorr::Signature;
use sha2::{Digest, Sha256};

use pulse_types::payload::SignedEnvelope;

use crate::keys::{verifying_key_from_hex, Keypair};
use crate::{CryptoError, Result};

/// Deterministic JSON: object keys sorted recursively at every level.
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(k.clone()),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let fields: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", fields.join(","))
        }
        other => other.to_string(),
    }
}

fn envelope_digest(content: &serde_json::Value, timestamp: i64) -> [u8; 32] {
    let canonical = canonical_json(&serde_json::json!({
        "content": content,
        "timestamp": timestamp,
    }));
    Sha256::digest(canonical.as_bytes()).into()
}

/// Wrap `content` in a signed envelope.
pub fn sign_payload(
    keypair: &Keypair,
    content: serde_json::Value,
    timestamp: i64,
) -> Result<SignedEnvelope> {
    let digest = envelope_digest(&content, timestamp);
    let aux_rand: [u8; 32] = rand::random();
    let sig = keypair
        .signing_key()
        .sign_raw(&digest, &aux_rand)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    Ok(SignedEnvelope {
        content,
        timestamp,
        signature: hex::encode(sig.to_bytes()),
    })
}

/// Verify an envelope against the claimed sender.
pub fn verify_payload(envelope: &SignedEnvelope, sender_pubkey_hex: &str) -> Result<()> {
    let vk = verifying_key_from_hex(sender_pubkey_hex)?;
    let digest = envelope_digest(&envelope.content, envelope.timestamp);
    let sig_bytes =
        hex::decode(&envelope.signature).map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
    let sig = Signature::try_from(sig_bytes.as_slice())
        .map_err(|_| CryptoError::SignatureVerification)?;
    vk.verify_raw(&digest, &sig)
        .map_err(|_| CryptoError::SignatureVerification)
}

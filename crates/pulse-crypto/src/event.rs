//! Event canonicalization, hashing, and Schnorr signatures.
//!
//! The canonical form of an event is the JSON array
//! `[0, pubkey, created_at, kind, tags, content]` with no added whitespace;
//! the event id is the SHA-256 of that form, and the signature is BIP-340
//! Schnorr over the raw id bytes.

use k256::schnorr::Signature;
use sha2::{Digest, Sha256};

use pulse_types::event::Event;

use crate::keys::{verifying_key_from_hex, Keypair};
use crate::{CryptoError, Result};

/// Canonical serialization of the event fields covered by the id.
pub fn canonical_event(
    pubkey: &str,
    created_at: i64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> Result<String> {
    serde_json::to_string(&serde_json::json!([0, pubkey, created_at, kind, tags, content]))
        .map_err(|e| CryptoError::Serialization(e.to_string()))
}

/// SHA-256 of the canonical form.
pub fn event_id(
    pubkey: &str,
    created_at: i64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> Result<[u8; 32]> {
    let canonical = canonical_event(pubkey, created_at, kind, tags, content)?;
    Ok(Sha256::digest(canonical.as_bytes()).into())
}

/// Build and sign a complete event.
pub fn sign_event(
    keypair: &Keypair,
    created_at: i64,
    kind: u32,
    tags: Vec<Vec<String>>,
    content: String,
) -> Result<Event> {
    let pubkey = keypair.public_hex().to_string();
    let id_bytes = event_id(&pubkey, created_at, kind, &tags, &content)?;
    let aux_rand: [u8; 32] = rand::random();
    let sig = keypair
        .signing_key()
        .sign_raw(&id_bytes, &aux_rand)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    Ok(Event {
        id: hex::encode(id_bytes),
        pubkey,
        created_at,
        kind,
        tags,
        content,
        sig: hex::encode(sig.to_bytes()),
    })
}

/// Verify an event: shape, id recomputation, and signature.
///
/// Any mismatch is an error; callers drop such events without surfacing
/// them.
pub fn verify_event(event: &Event) -> Result<()> {
    if !event.is_well_formed() {
        return Err(CryptoError::InvalidInput("malformed event".to_string()));
    }

    let id_bytes = event_id(
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    )?;
    if hex::encode(id_bytes) != event.id {
        return Err(CryptoError::IdMismatch);
    }

    let vk = verifying_key_from_hex(&event.pubkey)?;
    let sig_bytes = hex::decode(&event.sig).map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
    let sig = Signature::try_from(sig_bytes.as_slice())
        .map_err(|_| CryptoError::SignatureVerification)?;
    vk.verify_raw(&id_bytes, &sig)
        .map_err(|_| CryptoError::SignatureVerification)
}

//! Builders for outgoing events.
//!
//! Every outgoing message is a signed-payload envelope wrapped in the
//! transport encryption for its class (NIP-04 for direct, group AEAD for
//! group traffic), carried in a kind-30078 event with a `["d", topic]`
//! tag.

use pulse_crypto::event::sign_event;
use pulse_crypto::keys::Keypair;
use pulse_crypto::payload::sign_payload;
use pulse_crypto::{dm, group::GroupKey};
use pulse_types::event::Event;
use pulse_types::payload::{Payload, PayloadKind};
use pulse_types::{AGENT_EVENT_KIND, MAX_CONTENT_BYTES};

use crate::{Result, WorkerError};

fn tagged(topic: &str) -> Vec<Vec<String>> {
    vec![vec!["d".to_string(), topic.to_string()]]
}

fn check_size(content: &str) -> Result<()> {
    if content.len() > MAX_CONTENT_BYTES {
        return Err(WorkerError::InvalidArgs(format!(
            "content exceeds {MAX_CONTENT_BYTES} bytes"
        )));
    }
    Ok(())
}

/// Build a direct message event for `target`: the signed envelope around
/// the user's content, DM-encrypted, published under the primary topic.
pub fn direct_event(
    keypair: &Keypair,
    target_pubkey: &str,
    content: &str,
    primary_topic: &str,
    now_ms: i64,
) -> Result<Event> {
    let envelope = sign_payload(keypair, serde_json::json!(content), now_ms)?;
    let plaintext = serde_json::to_string(&envelope)
        .map_err(|e| WorkerError::InvalidArgs(e.to_string()))?;
    let ciphertext = dm::encrypt(keypair, target_pubkey, plaintext.as_bytes())?;
    check_size(&ciphertext)?;
    Ok(sign_event(
        keypair,
        now_ms / 1000,
        AGENT_EVENT_KIND,
        tagged(primary_topic),
        ciphertext,
    )?)
}

/// Build a group message event: a `group_message` payload in a signed
/// envelope, AEAD-encrypted under the topic key, published to the topic.
pub fn group_event(
    keypair: &Keypair,
    group_id: &str,
    topic: &str,
    content: &str,
    now_ms: i64,
) -> Result<Event> {
    let mut payload = Payload::new(PayloadKind::GroupMessage, keypair.public_hex(), now_ms);
    payload.content = Some(serde_json::json!(content));
    payload.group_id = Some(group_id.to_string());
    payload.nonce = Some(hex::encode(rand::random::<[u8; 16]>()));

    let envelope = sign_payload(keypair, serde_json::to_value(&payload).map_err(|e| {
        WorkerError::InvalidArgs(e.to_string())
    })?, now_ms)?;
    let plaintext = serde_json::to_string(&envelope)
        .map_err(|e| WorkerError::InvalidArgs(e.to_string()))?;

    let key = GroupKey::derive(topic)?;
    let ciphertext = key.encrypt(plaintext.as_bytes())?;
    check_size(&ciphertext)?;
    Ok(sign_event(
        keypair,
        now_ms / 1000,
        AGENT_EVENT_KIND,
        tagged(topic),
        ciphertext,
    )?)
}

/// Build the presence announce published after the pool connects.
///
/// Announces are plaintext signed envelopes; peers only need the sender
/// and name.
pub fn announce_event(
    keypair: &Keypair,
    primary_topic: &str,
    agent_name: &str,
    now_ms: i64,
) -> Result<Event> {
    let mut payload = Payload::new(PayloadKind::Announce, keypair.public_hex(), now_ms);
    if !agent_name.is_empty() {
        payload.agent_name = Some(agent_name.to_string());
    }
    let envelope = sign_payload(keypair, serde_json::to_value(&payload).map_err(|e| {
        WorkerError::InvalidArgs(e.to_string())
    })?, now_ms)?;
    let content = serde_json::to_string(&envelope)
        .map_err(|e| WorkerError::InvalidArgs(e.to_string()))?;
    Ok(sign_event(
        keypair,
        now_ms / 1000,
        AGENT_EVENT_KIND,
        tagged(primary_topic),
        content,
    )?)
}

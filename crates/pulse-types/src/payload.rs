//! Application payloads carried inside event content.
//!
//! A payload is either a bare JSON object `{type, from, to?, ts, ...}` or
//! that object wrapped in the signed envelope `{content, timestamp,
//! signature}`. Direct messages carry the envelope inside NIP-04
//! ciphertext; group messages carry it inside the group AEAD.

use serde::{Deserialize, Serialize};

use crate::PubkeyHex;

/// Payload discriminator. Unknown types are logged and dropped upstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Announce,
    Broadcast,
    Task,
    Result,
    GroupMessage,
    #[serde(rename = "_ping")]
    Ping,
}

/// A decoded application payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(rename = "type")]
    pub kind: PayloadKind,
    /// Sender's public key, lowercase hex.
    pub from: PubkeyHex,
    /// Recipient for direct traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PubkeyHex>,
    /// Milliseconds since epoch.
    pub ts: i64,
    /// Message body: UTF-8 string or JSON object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
    /// Group the payload belongs to, for group traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Single-use replay nonce.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Self-reported agent name, used by the peer cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

impl Payload {
    /// A minimal payload of the given kind from `from` at `ts`.
    pub fn new(kind: PayloadKind, from: impl Into<PubkeyHex>, ts: i64) -> Self {
        Self {
            kind,
            from: from.into(),
            to: None,
            ts,
            content: None,
            group_id: None,
            nonce: None,
            agent_name: None,
        }
    }
}

/// The signed-payload envelope: an application payload plus a detached
/// Schnorr signature over its canonical form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    /// The signed value; a [`Payload`] object or a bare string.
    pub content: serde_json::Value,
    /// Milliseconds since epoch, bound into the signature.
    pub timestamp: i64,
    /// 64-byte Schnorr signature, lowercase hex.
    pub signature: String,
}

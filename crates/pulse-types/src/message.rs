//! Stored messages and the offline retry queue.

use serde::{Deserialize, Serialize};

use crate::PubkeyHex;

/// A message appended to the local log, one per line,
/// envelope-encrypted at rest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Event id, or a synthesized id when the source event had none.
    pub id: String,
    /// Sender's public key, lowercase hex.
    pub from: PubkeyHex,
    /// Post-decryption body: UTF-8 string or JSON object.
    pub content: serde_json::Value,
    /// Sender-claimed timestamp, ms.
    pub timestamp: i64,
    /// Local arrival time, ms.
    pub received_at: i64,
    pub is_group: bool,
    #[serde(default)]
    pub group_id: Option<String>,
    /// `None` when the payload carried no signature envelope.
    #[serde(default)]
    pub signature_valid: Option<bool>,
}

/// A [`StoredMessage`] as persisted in a group's history file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupHistoryRecord {
    #[serde(flatten)]
    pub message: StoredMessage,
    /// When this record was appended to the history file, ms.
    pub saved_at: i64,
}

/// Destination class of a queued message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuedKind {
    Send,
    GroupSend,
}

/// An outgoing message awaiting redelivery.
///
/// Invariant: `retry_count < MAX_RETRIES`; entries at the cap are removed
/// and reported as a terminal failure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: QueuedKind,
    /// Recipient public key, or group topic for group sends.
    pub target: String,
    pub content: String,
    pub retry_count: u32,
    /// Enqueue time, ms; FIFO eviction key.
    pub created_at: i64,
    /// Earliest next attempt, ms.
    pub next_retry_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Group topic, for group sends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Group id, for group sends; the topic is not a substitute for it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_message_wire_names() {
        let msg = StoredMessage {
            id: "evt1".into(),
            from: "a".repeat(64),
            content: serde_json::json!("hi"),
            timestamp: 1000,
            received_at: 1001,
            is_group: false,
            group_id: None,
            signature_valid: Some(true),
        };
        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(json.contains("\"receivedAt\":1001"));
        assert!(json.contains("\"isGroup\":false"));
        assert!(json.contains("\"signatureValid\":true"));
    }

    #[test]
    fn test_history_record_flattens() {
        let record = GroupHistoryRecord {
            message: StoredMessage {
                id: "evt1".into(),
                from: "a".repeat(64),
                content: serde_json::json!("hi"),
                timestamp: 1000,
                received_at: 1001,
                is_group: true,
                group_id: Some("g1".into()),
                signature_valid: None,
            },
            saved_at: 1002,
        };
        let json = serde_json::to_string(&record).expect("serialize");
        assert!(json.contains("\"savedAt\":1002"));
        assert!(json.contains("\"groupId\":\"g1\""));
        let back: GroupHistoryRecord = serde_json::from_str(&json).expect("parse");
        assert_eq!(record, back);
    }

    #[test]
    fn test_queued_message_roundtrip() {
        let q = QueuedMessage {
            id: "q1".into(),
            kind: QueuedKind::GroupSend,
            target: "group-abc".into(),
            content: "payload".into(),
            retry_count: 1,
            created_at: 5000,
            next_retry_at: 10_000,
            last_error: Some("RELAY_ALL_FAILED".into()),
            topic: Some("group-abc".into()),
            group_id: Some("abc".into()),
        };
        let json = serde_json::to_string(&q).expect("serialize");
        assert!(json.contains("\"type\":\"group_send\""));
        assert!(json.contains("\"nextRetryAt\":10000"));
        assert!(json.contains("\"groupId\":\"abc\""));
        let back: QueuedMessage = serde_json::from_str(&json).expect("parse");
        assert_eq!(q, back);
    }
}

//! The wire event carried by relays.

use serde::{Deserialize, Serialize};

use crate::{EventIdHex, PubkeyHex, MAX_CONTENT_BYTES};

/// A relay event as defined by the pub/sub protocol.
///
/// The fields the agent consumes: `id` is the SHA-256 of the canonical
/// serialization `[0, pubkey, created_at, kind, tags, content]`, and `sig`
/// is a BIP-340 Schnorr signature over `id` under `pubkey`. Events are
/// immutable once received.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-byte event hash, lowercase hex.
    pub id: EventIdHex,
    /// Author's x-only public key, lowercase hex.
    pub pubkey: PubkeyHex,
    /// Creation time, unix seconds.
    pub created_at: i64,
    /// Event kind; agent traffic uses a single replaceable kind.
    pub kind: u32,
    /// Ordered tag lists; the agent uses one `["d", <topic>]` tag.
    pub tags: Vec<Vec<String>>,
    /// Opaque application payload, possibly ciphertext.
    pub content: String,
    /// 64-byte Schnorr signature, lowercase hex.
    pub sig: String,
}

impl Event {
    /// The value of the first `d` tag, if any.
    pub fn topic(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.len() >= 2 && t[0] == "d")
            .map(|t| t[1].as_str())
    }

    /// Structural validity: field lengths, kind range, content budget.
    ///
    /// This is a shape check only; cryptographic verification lives in the
    /// event verifier.
    pub fn is_well_formed(&self) -> bool {
        is_hex_of_len(&self.id, 64)
            && is_hex_of_len(&self.pubkey, 64)
            && is_hex_of_len(&self.sig, 128)
            && self.created_at > 0
            && self.content.len() <= MAX_CONTENT_BYTES
    }
}

fn is_hex_of_len(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Subscription filter sent to relays.
///
/// Serializes to the protocol's filter object, e.g.
/// `{"kinds":[30078],"#d":["topic"],"since":1700000000}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    #[serde(rename = "#d", skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl Filter {
    /// The filter the agent installs for one topic: its kind, the `d` tag,
    /// and a five-minute lookback.
    pub fn for_topic(topic: &str, now_secs: i64) -> Self {
        Self {
            kinds: Some(vec![crate::AGENT_EVENT_KIND]),
            topics: Some(vec![topic.to_string()]),
            since: Some(now_secs - 300),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            id: "a".repeat(64),
            pubkey: "b".repeat(64),
            created_at: 1_700_000_000,
            kind: crate::AGENT_EVENT_KIND,
            tags: vec![vec!["d".into(), "agent-main".into()]],
            content: "hello".into(),
            sig: "c".repeat(128),
        }
    }

    #[test]
    fn test_topic_extraction() {
        let ev = sample_event();
        assert_eq!(ev.topic(), Some("agent-main"));
    }

    #[test]
    fn test_topic_missing() {
        let mut ev = sample_event();
        ev.tags.clear();
        assert_eq!(ev.topic(), None);
    }

    #[test]
    fn test_well_formed() {
        assert!(sample_event().is_well_formed());
    }

    #[test]
    fn test_bad_id_rejected() {
        let mut ev = sample_event();
        ev.id = "zz".repeat(32);
        assert!(!ev.is_well_formed());

        let mut ev = sample_event();
        ev.id.truncate(10);
        assert!(!ev.is_well_formed());
    }

    #[test]
    fn test_oversized_content_rejected() {
        let mut ev = sample_event();
        ev.content = "x".repeat(MAX_CONTENT_BYTES + 1);
        assert!(!ev.is_well_formed());
    }

    #[test]
    fn test_filter_serialization() {
        let filter = Filter::for_topic("agent-main", 1_700_000_000);
        let json = serde_json::to_string(&filter).expect("serialize");
        assert!(json.contains("\"#d\":[\"agent-main\"]"));
        assert!(json.contains("\"kinds\":[30078]"));
        assert!(json.contains("\"since\":1699999700"));
        assert!(!json.contains("until"));
    }

    #[test]
    fn test_event_roundtrip() {
        let ev = sample_event();
        let json = serde_json::to_string(&ev).expect("serialize");
        let back: Event = serde_json::from_str(&json).expect("parse");
        assert_eq!(ev, back);
    }
}

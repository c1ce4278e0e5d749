//! The event dispatcher.
//!
//! A single task drains the inbound channel fed by every relay session and
//! runs each verified event through one serial pipeline: dedup →
//! replay/timestamp check → sender filter and rate limit → classification
//! (group topic vs direct) → decryption → payload interpretation → inner
//! signature check → routing into the message log, group history, or the
//! peer cache. Processing serially means the caches and sink writes need
//! no further locking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use pulse_crypto::group::GroupKey;
use pulse_crypto::keys::Keypair;
use pulse_crypto::payload::verify_payload;
use pulse_crypto::{dm, event as crypto_event};
use pulse_groups::history::GroupHistory;
use pulse_groups::manager::GroupManager;
use pulse_relay::session::IncomingEvent;
use pulse_store::lru::BoundedLru;
use pulse_store::message_log::MessageLog;
use pulse_types::event::Event;
use pulse_types::message::StoredMessage;
use pulse_types::payload::{Payload, PayloadKind, SignedEnvelope};
use pulse_types::{DEDUP_CACHE_SIZE, PEER_CACHE_SIZE};

use crate::bus::MessageBus;
use crate::health::Counters;
use crate::ratelimit::SlidingWindowLimiter;
use crate::replay::{ReplayVerdict, ReplayWindow};

/// Nesting depth beyond which payload JSON is rejected outright.
const MAX_PAYLOAD_DEPTH: usize = 64;

/// Keys rejected at any nesting level; they target prototype pollution in
/// JS consumers of the log and webhook feeds.
const FORBIDDEN_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// What the pipeline did with one event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Appended to the message log (and group history for group traffic).
    Stored,
    /// Presence traffic; only the peer cache changed.
    PeerNoted,
    Dropped(DropCause),
}

/// Why an event was dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropCause {
    InvalidSignature,
    Duplicate,
    StaleTimestamp,
    NonceReused,
    OwnEvent,
    Ping,
    RateLimited,
    UnknownType,
    Malformed,
    SinkFailure,
}

/// A known peer, fed by announce and message traffic.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub last_seen: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

/// Best-effort webhook sink for delivered messages.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            url: url.to_string(),
        }
    }

    /// Fire and forget; failures are logged at debug.
    fn notify(&self, message: &StoredMessage) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let request = self.client.post(&self.url).json(message).send();
        handle.spawn(async move {
            if let Err(e) = request.await {
                debug!(error = %e, "webhook delivery failed");
            }
        });
    }
}

/// The serial event pipeline and the caches it owns.
pub struct Dispatcher {
    keypair: Keypair,
    groups: Arc<Mutex<GroupManager>>,
    history: GroupHistory,
    log: Arc<MessageLog>,
    counters: Arc<Counters>,
    webhook: Option<WebhookSink>,
    bus: MessageBus,

    dedup: BoundedLru<String, ()>,
    replay: ReplayWindow,
    peers: BoundedLru<String, PeerInfo>,
    limiter: SlidingWindowLimiter,
    group_keys: HashMap<String, GroupKey>,
}

struct Decoded {
    content: serde_json::Value,
    kind: Option<PayloadKind>,
    nonce: Option<String>,
    group_id: Option<String>,
    agent_name: Option<String>,
    ts: Option<i64>,
    signature_valid: Option<bool>,
}

impl Dispatcher {
    pub fn new(
        keypair: Keypair,
        groups: Arc<Mutex<GroupManager>>,
        history: GroupHistory,
        log: Arc<MessageLog>,
        counters: Arc<Counters>,
        webhook: Option<WebhookSink>,
        bus: MessageBus,
    ) -> Self {
        Self {
            keypair,
            groups,
            history,
            log,
            counters,
            webhook,
            bus,
            dedup: BoundedLru::new(DEDUP_CACHE_SIZE),
            replay: ReplayWindow::default(),
            peers: BoundedLru::new(PEER_CACHE_SIZE),
            limiter: SlidingWindowLimiter::for_messages(),
            group_keys: HashMap::new(),
        }
    }

    /// Run one event through the pipeline.
    pub fn process(&mut self, event: &Event, now_ms: i64, mono_now: Instant) -> Outcome {
        if let Err(e) = crypto_event::verify_event(event) {
            debug!(error = %e, "dropping unverifiable event");
            return Outcome::Dropped(DropCause::InvalidSignature);
        }

        let dedup_key = if event.id.is_empty() {
            format!("{}|{}", event.pubkey, event.created_at)
        } else {
            event.id.clone()
        };
        if self.dedup.check_and_insert(dedup_key, ()) {
            return Outcome::Dropped(DropCause::Duplicate);
        }

        if self.replay.check_timestamp(event.created_at * 1000, now_ms)
            == ReplayVerdict::StaleTimestamp
        {
            warn!(event = %event.id, "dropping event outside replay window");
            return Outcome::Dropped(DropCause::StaleTimestamp);
        }

        if event.pubkey == self.keypair.public_hex() {
            return Outcome::Dropped(DropCause::OwnEvent);
        }

        if !self.limiter.check(&event.pubkey, mono_now) {
            self.counters.incr(&self.counters.rate_limited);
            return Outcome::Dropped(DropCause::RateLimited);
        }

        // A topic owned by a joined group classifies the event as group
        // traffic; everything else is direct.
        let group_route = event.topic().and_then(|topic| {
            let groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
            groups
                .group_by_topic(topic)
                .map(|g| (g.id.clone(), g.topic.clone()))
        });

        let plaintext = match &group_route {
            Some((_, topic)) => {
                let key = self.group_key(topic);
                match key.and_then(|k| k.decrypt(&event.content).ok()) {
                    Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    // Legacy senders publish plaintext group payloads.
                    None => event.content.clone(),
                }
            }
            None => match dm::decrypt(&self.keypair, &event.pubkey, &event.content) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(_) => event.content.clone(),
            },
        };

        let decoded = match self.interpret(&plaintext, &event.pubkey) {
            Ok(decoded) => decoded,
            Err(cause) => return Outcome::Dropped(cause),
        };

        if decoded.kind == Some(PayloadKind::Ping) {
            return Outcome::Dropped(DropCause::Ping);
        }

        if let Some(nonce) = &decoded.nonce {
            if self.replay.check_nonce(nonce, now_ms) == ReplayVerdict::NonceReused {
                warn!(event = %event.id, "dropping replayed nonce");
                return Outcome::Dropped(DropCause::NonceReused);
            }
        }

        self.note_peer(&event.pubkey, decoded.agent_name.clone(), now_ms);

        if decoded.kind == Some(PayloadKind::Announce) {
            return Outcome::PeerNoted;
        }

        let message = StoredMessage {
            id: event.id.clone(),
            from: event.pubkey.clone(),
            content: decoded.content,
            timestamp: decoded.ts.unwrap_or(event.created_at * 1000),
            received_at: now_ms,
            is_group: group_route.is_some(),
            group_id: group_route.as_ref().map(|(id, _)| id.clone()),
            signature_valid: decoded.signature_valid,
        };

        if let Some((group_id, _)) = &group_route {
            if let Err(e) = self.history.append(group_id, &message, now_ms) {
                warn!(error = %e, group = %group_id, "group history append failed");
                self.counters.incr(&self.counters.errors);
                return Outcome::Dropped(DropCause::SinkFailure);
            }
            let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
            groups.record_seen(group_id, &event.pubkey, now_ms);
        }

        if let Err(e) = self.log.append(&message) {
            warn!(error = %e, "message log append failed");
            self.counters.incr(&self.counters.errors);
            return Outcome::Dropped(DropCause::SinkFailure);
        }

        self.counters.incr(&self.counters.received);
        if let Some(webhook) = &self.webhook {
            webhook.notify(&message);
        }
        self.bus.publish(message);
        Outcome::Stored
    }

    /// Decode decrypted (or plaintext) content into its stored form.
    fn interpret(&self, text: &str, sender: &str) -> std::result::Result<Decoded, DropCause> {
        let value = match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => {
                if exceeds_depth(&value, 0) || has_forbidden_keys(&value) {
                    debug!("rejecting unsafe payload JSON");
                    return Err(DropCause::Malformed);
                }
                value
            }
            // Raw text is a legal legacy payload.
            Err(_) => {
                return Ok(Decoded {
                    content: serde_json::Value::String(text.to_string()),
                    kind: None,
                    nonce: None,
                    group_id: None,
                    agent_name: None,
                    ts: None,
                    signature_valid: None,
                })
            }
        };

        let (inner, ts, signature_valid) = match serde_json::from_value::<SignedEnvelope>(
            value.clone(),
        ) {
            Ok(envelope) => {
                let valid = verify_payload(&envelope, sender).is_ok();
                (envelope.content, Some(envelope.timestamp), Some(valid))
            }
            Err(_) => (value, None, None),
        };

        if inner.get("type").is_some() {
            return match serde_json::from_value::<Payload>(inner.clone()) {
                Ok(payload) => Ok(Decoded {
                    content: payload.content.unwrap_or(inner),
                    kind: Some(payload.kind),
                    nonce: payload.nonce,
                    group_id: payload.group_id,
                    agent_name: payload.agent_name,
                    ts: ts.or(Some(payload.ts)),
                    signature_valid,
                }),
                Err(e) => {
                    debug!(error = %e, "dropping payload of unknown type");
                    Err(DropCause::UnknownType)
                }
            };
        }

        Ok(Decoded {
            content: inner,
            kind: None,
            nonce: None,
            group_id: None,
            agent_name: None,
            ts,
            signature_valid,
        })
    }

    fn group_key(&mut self, topic: &str) -> Option<&GroupKey> {
        if !self.group_keys.contains_key(topic) {
            match GroupKey::derive(topic) {
                Ok(key) => {
                    self.group_keys.insert(topic.to_string(), key);
                }
                Err(e) => {
                    debug!(error = %e, topic, "group key derivation failed");
                    return None;
                }
            }
        }
        self.group_keys.get(topic)
    }

    fn note_peer(&mut self, pubkey: &str, agent_name: Option<String>, now_ms: i64) {
        let name = agent_name.or_else(|| {
            self.peers
                .peek(&pubkey.to_string())
                .and_then(|p| p.agent_name.clone())
        });
        self.peers.insert(
            pubkey.to_string(),
            PeerInfo {
                last_seen: now_ms,
                agent_name: name,
            },
        );
        self.counters
            .set(&self.counters.cache_size, self.peers.len() as u64);
    }

    /// Known peers, most recently seen first.
    pub fn peers(&self) -> Vec<(String, PeerInfo)> {
        self.peers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Evict idle rate-limiter entries; called on the expiry tick.
    pub fn sweep(&mut self, mono_now: Instant) {
        self.limiter.evict_idle(mono_now);
    }
}

fn exceeds_depth(value: &serde_json::Value, depth: usize) -> bool {
    if depth > MAX_PAYLOAD_DEPTH {
        return true;
    }
    match value {
        serde_json::Value::Object(map) => map.values().any(|v| exceeds_depth(v, depth + 1)),
        serde_json::Value::Array(items) => items.iter().any(|v| exceeds_depth(v, depth + 1)),
        _ => false,
    }
}

fn has_forbidden_keys(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Object(map) => map
            .iter()
            .any(|(k, v)| FORBIDDEN_KEYS.contains(&k.as_str()) || has_forbidden_keys(v)),
        serde_json::Value::Array(items) => items.iter().any(has_forbidden_keys),
        _ => false,
    }
}

/// Drain the inbound channel until shutdown.
pub async fn run(
    mut dispatcher: Dispatcher,
    mut events_rx: mpsc::Receiver<IncomingEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut sweep_tick = tokio::time::interval(Duration::from_secs(600));
    sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            incoming = events_rx.recv() => match incoming {
                Some(incoming) => {
                    let outcome = dispatcher.process(
                        &incoming.event,
                        pulse_relay::pool::now_ms(),
                        Instant::now(),
                    );
                    debug!(relay = %incoming.relay, ?outcome, "event dispatched");
                }
                None => break,
            },
            _ = sweep_tick.tick() => dispatcher.sweep(Instant::now()),
            _ = shutdown_rx.recv() => break,
        }
    }
    debug!("dispatcher stopped");
}

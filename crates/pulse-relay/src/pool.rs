//! The relay pool: session ownership, subscription fan-out, health-scored
//! selection, and multi-path publishing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use pulse_store::paths::DataDir;
use pulse_types::event::{Event, Filter};
use pulse_types::MULTI_PATH_RELAYS;

use crate::frames::ClientFrame;
use crate::health::HealthTracker;
use crate::session::{
    IncomingEvent, RelaySession, SessionConfig, SessionState, DEFAULT_PUBLISH_TIMEOUT,
};
use crate::{RelayError, Result};

/// Health state shared between the pool, its sessions, and status surfaces.
pub type SharedHealth = Arc<Mutex<HealthTracker>>;

/// A fresh, empty shared tracker.
pub fn new_shared_health() -> SharedHealth {
    Arc::new(Mutex::new(HealthTracker::new()))
}

/// Lock the tracker, surviving a poisoned mutex.
pub fn lock_health(health: &SharedHealth) -> MutexGuard<'_, HealthTracker> {
    health.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wall-clock milliseconds since the epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Pool settings.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Relay URLs to hold sessions against.
    pub relays: Vec<String>,
    /// Per-attempt connect budget.
    pub connect_timeout: Duration,
    /// Per-publish acknowledgement budget.
    pub publish_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            connect_timeout: crate::session::DEFAULT_CONNECT_TIMEOUT,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }
}

/// Outcome of a multi-path publish.
#[derive(Clone, Debug, Default)]
pub struct PublishReport {
    /// Relays that acknowledged the event.
    pub accepted: Vec<String>,
    /// Relays that rejected, timed out, or were unreachable.
    pub failed: Vec<(String, String)>,
}

/// Owns one session per configured relay.
pub struct RelayPool {
    sessions: HashMap<String, RelaySession>,
    subscriptions: Mutex<HashMap<String, Filter>>,
    health: SharedHealth,
    publish_timeout: Duration,
}

impl RelayPool {
    /// Spawn sessions for every configured relay.
    pub fn new(
        config: PoolConfig,
        events_tx: mpsc::Sender<IncomingEvent>,
        health: SharedHealth,
    ) -> Self {
        let mut sessions = HashMap::new();
        for url in &config.relays {
            lock_health(&health).ensure_known(url);
            let session = RelaySession::spawn(
                SessionConfig {
                    url: url.clone(),
                    connect_timeout: config.connect_timeout,
                },
                Vec::new(),
                events_tx.clone(),
                health.clone(),
            );
            sessions.insert(url.clone(), session);
        }

        Self {
            sessions,
            subscriptions: Mutex::new(HashMap::new()),
            health,
            publish_timeout: config.publish_timeout,
        }
    }

    /// Configured relay count.
    pub fn relay_count(&self) -> usize {
        self.sessions.len()
    }

    /// Sessions currently connected or subscribed.
    pub fn connected_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| {
                matches!(
                    s.state(),
                    SessionState::Connected | SessionState::Subscribed
                )
            })
            .count()
    }

    /// At least one live session.
    pub fn is_connected(&self) -> bool {
        self.connected_count() > 0
    }

    /// The shared health tracker.
    pub fn health(&self) -> SharedHealth {
        self.health.clone()
    }

    /// Install a subscription on every session. Idempotent per `sub_id`:
    /// re-installing an identical filter is a no-op.
    pub fn subscribe(&self, sub_id: &str, filter: Filter) {
        {
            let mut subs = self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if subs.get(sub_id) == Some(&filter) {
                return;
            }
            subs.insert(sub_id.to_string(), filter.clone());
        }
        for session in self.sessions.values() {
            session.subscribe(sub_id, filter.clone());
        }
        debug!(sub_id, "subscription installed");
    }

    /// Remove a subscription from every session. Idempotent.
    pub fn unsubscribe(&self, sub_id: &str) {
        let removed = {
            let mut subs = self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subs.remove(sub_id).is_some()
        };
        if removed {
            for session in self.sessions.values() {
                session.unsubscribe(sub_id);
            }
            debug!(sub_id, "subscription removed");
        }
    }

    /// Active subscription ids.
    pub fn subscription_ids(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Publish a signed event to the top-scored relays in parallel.
    ///
    /// Succeeds when at least one relay acknowledges within the budget;
    /// every attempt is recorded against the health tracker.
    pub async fn publish(&self, event: &Event) -> Result<PublishReport> {
        let frame = ClientFrame::Event(event.clone()).to_wire()?;

        let mut targets: Vec<String> = {
            let tracker = lock_health(&self.health);
            tracker
                .multi_path(MULTI_PATH_RELAYS)
                .into_iter()
                .filter(|url| self.sessions.contains_key(url))
                .collect()
        };
        if targets.is_empty() {
            // Degraded mode: every non-blacklisted session is a candidate.
            let blacklisted = lock_health(&self.health).blacklisted();
            targets = self
                .sessions
                .keys()
                .filter(|url| !blacklisted.contains(url))
                .cloned()
                .collect();
        }
        if targets.is_empty() {
            return Err(RelayError::NoHealthyRelays);
        }

        let attempts = targets.iter().filter_map(|url| {
            self.sessions.get(url).map(|session| {
                let frame = frame.clone();
                let event_id = event.id.clone();
                let timeout = self.publish_timeout;
                async move {
                    let started = Instant::now();
                    let outcome = session.publish(&event_id, frame, timeout).await;
                    (url.clone(), started.elapsed(), outcome)
                }
            })
        });

        let mut report = PublishReport::default();
        for (url, elapsed, outcome) in join_all(attempts).await {
            let mut tracker = lock_health(&self.health);
            match outcome {
                Ok(_) => {
                    tracker.record_success(&url, elapsed.as_millis() as u64, now_ms());
                    report.accepted.push(url);
                }
                Err(e) => {
                    tracker.record_failure(&url, now_ms());
                    report.failed.push((url, e.to_string()));
                }
            }
        }

        if report.accepted.is_empty() {
            warn!(
                attempted = report.failed.len(),
                event = %event.id,
                "publish failed on every relay"
            );
            return Err(RelayError::AllRelaysFailed);
        }
        Ok(report)
    }

    /// Persist relay health when the debounce threshold is reached.
    pub fn maybe_persist_health(&self, data: &DataDir) -> Result<()> {
        lock_health(&self.health).maybe_save(data)?;
        Ok(())
    }

    /// Persist relay health unconditionally.
    pub fn persist_health(&self, data: &DataDir) -> Result<()> {
        lock_health(&self.health).save(data)
    }

    /// Close every session and wait for their tasks.
    pub async fn shutdown(self) {
        for session in self.sessions.values() {
            session.close();
        }
        join_all(self.sessions.into_values().map(RelaySession::join)).await;
    }
}

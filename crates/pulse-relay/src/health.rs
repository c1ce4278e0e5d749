//! Relay health accounting: scores, blacklist transitions, recovery, and
//! persistence.
//!
//! The tracker is pure state plus explicit persistence; sessions and the
//! pool feed it success/failure samples, timers drive debounced saves.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, info, warn};

use pulse_store::atomic::{self, FileMode};
use pulse_store::paths::DataDir;
use pulse_types::relay::{HealthProbe, RelayStats};
use pulse_types::{
    BLACKLIST_THRESHOLD, MIN_HEALTHY_RELAYS, MIN_RELAY_SCORE, RECOVERY_SUCCESSES,
};

use crate::Result;

/// Probes retained per relay.
const HISTORY_CAP: usize = 100;

/// Recent window used for the failure-rate health check.
const RECENT_WINDOW: usize = 20;

/// Minimum samples before the failure-rate check can mark a relay
/// unhealthy.
const RECENT_MIN_SAMPLES: usize = 4;

/// Dirty operations that trigger a debounced save.
const SAVE_OPS_THRESHOLD: u32 = 10;

/// Scores, blacklist, and probe history for every known relay.
#[derive(Debug, Default)]
pub struct HealthTracker {
    stats: BTreeMap<String, RelayStats>,
    history: BTreeMap<String, VecDeque<HealthProbe>>,
    pending_ops: u32,
}

impl HealthTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load persisted stats, blacklist, and history from the data dir.
    pub fn load(data: &DataDir) -> Result<Self> {
        let mut stats: BTreeMap<String, RelayStats> =
            atomic::read_json(&data.relay_stats_file())?.unwrap_or_default();
        let blacklist: Vec<String> =
            atomic::read_json(&data.relay_blacklist_file())?.unwrap_or_default();
        let history: BTreeMap<String, Vec<HealthProbe>> =
            atomic::read_json(&data.relay_health_history_file())?.unwrap_or_default();

        // The blacklist file is authoritative over the flag in stats.
        for url in &blacklist {
            stats
                .entry(url.clone())
                .or_insert_with(|| RelayStats::new(url.clone()))
                .blacklisted = true;
        }

        Ok(Self {
            stats,
            history: history
                .into_iter()
                .map(|(url, probes)| (url, probes.into_iter().collect()))
                .collect(),
            pending_ops: 0,
        })
    }

    /// Make a relay known without recording a sample.
    pub fn ensure_known(&mut self, url: &str) {
        self.stats
            .entry(url.to_string())
            .or_insert_with(|| RelayStats::new(url));
    }

    /// Record a successful operation with its latency.
    pub fn record_success(&mut self, url: &str, latency_ms: u64, now_ms: i64) {
        let entry = self
            .stats
            .entry(url.to_string())
            .or_insert_with(|| RelayStats::new(url));
        entry.success_count += 1;
        entry.consecutive_successes += 1;
        entry.consecutive_failures = 0;
        entry.total_latency += latency_ms;
        entry.last_success = now_ms;

        if entry.blacklisted && entry.consecutive_successes >= RECOVERY_SUCCESSES {
            entry.blacklisted = false;
            info!(url, "relay recovered after sustained successes");
        }

        self.push_probe(
            url,
            HealthProbe {
                ts: now_ms,
                success: true,
                latency_ms,
            },
        );
        self.refresh_health(url);
        self.pending_ops += 1;
    }

    /// Record a failed operation.
    pub fn record_failure(&mut self, url: &str, now_ms: i64) {
        let entry = self
            .stats
            .entry(url.to_string())
            .or_insert_with(|| RelayStats::new(url));
        entry.failure_count += 1;
        entry.consecutive_failures += 1;
        entry.consecutive_successes = 0;
        entry.last_failure = now_ms;

        if !entry.blacklisted && entry.consecutive_failures >= BLACKLIST_THRESHOLD {
            entry.blacklisted = true;
            warn!(
                url,
                failures = entry.consecutive_failures,
                "relay blacklisted"
            );
        }

        self.push_probe(
            url,
            HealthProbe {
                ts: now_ms,
                success: false,
                latency_ms: 0,
            },
        );
        self.refresh_health(url);
        self.pending_ops += 1;
    }

    fn push_probe(&mut self, url: &str, probe: HealthProbe) {
        let ring = self.history.entry(url.to_string()).or_default();
        ring.push_back(probe);
        while ring.len() > HISTORY_CAP {
            ring.pop_front();
        }
    }

    /// Recompute `is_healthy` from the recent probe window.
    fn refresh_health(&mut self, url: &str) {
        let Some(ring) = self.history.get(url) else {
            return;
        };
        let recent: Vec<&HealthProbe> = ring.iter().rev().take(RECENT_WINDOW).collect();
        let Some(entry) = self.stats.get_mut(url) else {
            return;
        };
        if recent.len() < RECENT_MIN_SAMPLES {
            entry.is_healthy = true;
            return;
        }
        let failures = recent.iter().filter(|p| !p.success).count();
        entry.is_healthy = (failures as f64 / recent.len() as f64) <= 0.5;
    }

    /// Relays eligible for selection, best score first.
    pub fn healthy_relays(&self) -> Vec<&RelayStats> {
        let mut relays: Vec<&RelayStats> = self
            .stats
            .values()
            .filter(|s| !s.blacklisted && s.score() >= MIN_RELAY_SCORE)
            .collect();
        relays.sort_by(|a, b| {
            b.score()
                .partial_cmp(&a.score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        relays
    }

    /// Top `n` relay URLs for a multi-path publish. Proceeds with fewer
    /// than the configured minimum, warning once per call.
    pub fn multi_path(&self, n: usize) -> Vec<String> {
        let healthy = self.healthy_relays();
        if healthy.len() < MIN_HEALTHY_RELAYS {
            warn!(
                available = healthy.len(),
                wanted = MIN_HEALTHY_RELAYS,
                "proceeding with degraded relay selection"
            );
        }
        healthy.iter().take(n).map(|s| s.url.clone()).collect()
    }

    /// The single best relay, if any is eligible.
    pub fn best_relay(&self) -> Option<String> {
        self.healthy_relays().first().map(|s| s.url.clone())
    }

    /// Manually lift a blacklist entry.
    pub fn recover(&mut self, url: &str) -> bool {
        let Some(entry) = self.stats.get_mut(url) else {
            return false;
        };
        entry.blacklisted = false;
        entry.consecutive_failures = 0;
        entry.is_healthy = true;
        entry.recovery_attempts += 1;
        self.pending_ops += 1;
        debug!(url, "relay manually recovered");
        true
    }

    /// Currently blacklisted relay URLs.
    pub fn blacklisted(&self) -> Vec<String> {
        self.stats
            .values()
            .filter(|s| s.blacklisted)
            .map(|s| s.url.clone())
            .collect()
    }

    /// Stats for one relay.
    pub fn stats_for(&self, url: &str) -> Option<&RelayStats> {
        self.stats.get(url)
    }

    /// All known stats, for status surfaces.
    pub fn snapshot(&self) -> Vec<RelayStats> {
        self.stats.values().cloned().collect()
    }

    /// Probe history for one relay, oldest first.
    pub fn history_for(&self, url: &str) -> Vec<HealthProbe> {
        self.history
            .get(url)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Save when enough operations accumulated since the last write.
    pub fn maybe_save(&mut self, data: &DataDir) -> Result<bool> {
        if self.pending_ops < SAVE_OPS_THRESHOLD {
            return Ok(false);
        }
        self.save(data)?;
        Ok(true)
    }

    /// Unconditional save of stats, blacklist, and history.
    pub fn save(&mut self, data: &DataDir) -> Result<()> {
        atomic::write_json(&data.relay_stats_file(), &self.stats, FileMode::Shared)?;
        atomic::write_json(
            &data.relay_blacklist_file(),
            &self.blacklisted(),
            FileMode::Shared,
        )?;
        let history: BTreeMap<&String, Vec<&HealthProbe>> = self
            .history
            .iter()
            .map(|(url, ring)| (url, ring.iter().collect()))
            .collect();
        atomic::write_json(&data.relay_health_history_file(), &history, FileMode::Shared)?;
        self.pending_ops = 0;
        Ok(())
    }
}

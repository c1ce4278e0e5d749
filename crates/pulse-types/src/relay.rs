//! Relay quality statistics and scoring.

use serde::{Deserialize, Serialize};

/// Latency above which a relay's latency score reaches zero, ms.
const LATENCY_FLOOR_MS: f64 = 5000.0;

/// Persistent per-relay statistics.
///
/// Score ∈ [0, 1]: `(success_rate·0.7 + latency_score·0.3) ·
/// 0.9^consecutive_failures`, damped ×0.3 while unhealthy, forced to 0 while
/// blacklisted. A relay with no samples scores 0.5.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub url: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Sum of successful-operation latencies, ms.
    pub total_latency: u64,
    /// Last success time, ms; 0 = never.
    pub last_success: i64,
    /// Last failure time, ms; 0 = never.
    pub last_failure: i64,
    pub is_healthy: bool,
    pub blacklisted: bool,
    pub recovery_attempts: u32,
}

impl RelayStats {
    /// Fresh stats for a relay with no samples.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_latency: 0,
            last_success: 0,
            last_failure: 0,
            is_healthy: true,
            blacklisted: false,
            recovery_attempts: 0,
        }
    }

    /// Total recorded operations.
    pub fn samples(&self) -> u64 {
        self.success_count + self.failure_count
    }

    /// Mean latency over successful operations, ms.
    pub fn avg_latency(&self) -> f64 {
        if self.success_count == 0 {
            0.0
        } else {
            self.total_latency as f64 / self.success_count as f64
        }
    }

    /// Quality estimate in [0, 1].
    pub fn score(&self) -> f64 {
        if self.blacklisted {
            return 0.0;
        }
        if self.samples() == 0 {
            return 0.5;
        }
        let success_rate = self.success_count as f64 / self.samples() as f64;
        let latency_score = (1.0 - self.avg_latency() / LATENCY_FLOOR_MS).max(0.0);
        let mut score =
            (success_rate * 0.7 + latency_score * 0.3) * 0.9_f64.powi(self.consecutive_failures as i32);
        if !self.is_healthy {
            score *= 0.3;
        }
        score.clamp(0.0, 1.0)
    }
}

/// One probe outcome in a relay's bounded health history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthProbe {
    /// Probe time, ms.
    pub ts: i64,
    pub success: bool,
    /// Observed latency, ms; 0 on failure.
    pub latency_ms: u64,
}

//! Replay protection: timestamp tolerance plus a bounded nonce window.

use pulse_store::lru::BoundedLru;
use pulse_types::{HISTORIC_CUTOFF_MS, NONCE_CACHE_SIZE, REPLAY_WINDOW_MS};

/// Why a timestamp or nonce was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayVerdict {
    Fresh,
    /// Outside the tolerance window, and not old enough to be a
    /// historical fetch.
    StaleTimestamp,
    /// The nonce was already seen inside the window.
    NonceReused,
}

/// Bounded nonce cache with timestamp tolerance.
#[derive(Debug)]
pub struct ReplayWindow {
    nonces: BoundedLru<String, i64>,
    tolerance_ms: i64,
    historic_cutoff_ms: i64,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new(REPLAY_WINDOW_MS, HISTORIC_CUTOFF_MS, NONCE_CACHE_SIZE)
    }
}

impl ReplayWindow {
    pub fn new(tolerance_ms: i64, historic_cutoff_ms: i64, nonce_capacity: usize) -> Self {
        Self {
            nonces: BoundedLru::new(nonce_capacity),
            tolerance_ms,
            historic_cutoff_ms,
        }
    }

    /// Check a sender-claimed timestamp (ms) against local time.
    ///
    /// Rejects drift beyond the tolerance, except timestamps so far in the
    /// past that they are clearly a missed historical fetch.
    pub fn check_timestamp(&self, ts_ms: i64, now_ms: i64) -> ReplayVerdict {
        let drift = now_ms - ts_ms;
        if drift.abs() <= self.tolerance_ms {
            return ReplayVerdict::Fresh;
        }
        if drift >= self.historic_cutoff_ms {
            return ReplayVerdict::Fresh;
        }
        ReplayVerdict::StaleTimestamp
    }

    /// Record a payload nonce; a repeat inside the window is a replay.
    pub fn check_nonce(&mut self, nonce: &str, now_ms: i64) -> ReplayVerdict {
        if self.nonces.check_and_insert(nonce.to_string(), now_ms) {
            ReplayVerdict::NonceReused
        } else {
            ReplayVerdict::Fresh
        }
    }

    /// Nonce cache occupancy.
    pub fn nonce_count(&self) -> usize {
        self.nonces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn test_fresh_within_tolerance() {
        let window = ReplayWindow::default();
        assert_eq!(window.check_timestamp(NOW - 1000, NOW), ReplayVerdict::Fresh);
        assert_eq!(window.check_timestamp(NOW + 1000, NOW), ReplayVerdict::Fresh);
        assert_eq!(
            window.check_timestamp(NOW - REPLAY_WINDOW_MS, NOW),
            ReplayVerdict::Fresh
        );
    }

    #[test]
    fn test_stale_outside_tolerance() {
        let window = ReplayWindow::default();
        assert_eq!(
            window.check_timestamp(NOW - REPLAY_WINDOW_MS - 1, NOW),
            ReplayVerdict::StaleTimestamp
        );
        // Future drift is never historical
        assert_eq!(
            window.check_timestamp(NOW + REPLAY_WINDOW_MS + 1, NOW),
            ReplayVerdict::StaleTimestamp
        );
    }

    #[test]
    fn test_historical_fetch_allowed() {
        let window = ReplayWindow::default();
        assert_eq!(
            window.check_timestamp(NOW - HISTORIC_CUTOFF_MS, NOW),
            ReplayVerdict::Fresh
        );
    }

    #[test]
    fn test_nonce_reuse_rejected() {
        let mut window = ReplayWindow::default();
        assert_eq!(window.check_nonce("n1", NOW), ReplayVerdict::Fresh);
        assert_eq!(window.check_nonce("n1", NOW + 1), ReplayVerdict::NonceReused);
        assert_eq!(window.check_nonce("n2", NOW), ReplayVerdict::Fresh);
    }

    #[test]
    fn test_nonce_window_bounded() {
        let mut window = ReplayWindow::new(REPLAY_WINDOW_MS, HISTORIC_CUTOFF_MS, 3);
        for i in 0..5 {
            window.check_nonce(&format!("n{i}"), NOW);
        }
        assert_eq!(window.nonce_count(), 3);
        // The oldest fell out and would be accepted again
        assert_eq!(window.check_nonce("n0", NOW), ReplayVerdict::Fresh);
    }
}

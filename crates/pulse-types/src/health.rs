//! The heartbeat snapshot the worker overwrites every few seconds.

use serde::{Deserialize, Serialize};

/// Worker counters exposed in the health file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub sent: u64,
    pub received: u64,
    pub commands: u64,
    pub errors: u64,
    pub rate_limited: u64,
    /// Known-peers cache occupancy.
    pub cache_size: u64,
    pub group_count: u64,
    pub pending_queue_size: u64,
}

/// Process memory figures, best effort.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    /// Resident set size in bytes; 0 when unreadable.
    pub rss: u64,
}

/// Contents of `health.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub pid: u32,
    /// Seconds since worker start.
    pub uptime: u64,
    /// At least one relay session is subscribed.
    pub connected: bool,
    /// Relays currently subscribed.
    pub relay_count: usize,
    pub memory: MemoryUsage,
    pub stats: WorkerStats,
    /// Snapshot time, ms.
    pub ts: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_wire_names() {
        let snapshot = HealthSnapshot {
            pid: 42,
            uptime: 7,
            connected: true,
            relay_count: 3,
            memory: MemoryUsage { rss: 1024 },
            stats: WorkerStats {
                pending_queue_size: 2,
                rate_limited: 1,
                ..WorkerStats::default()
            },
            ts: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&snapshot).expect("serialize");
        assert!(json.contains("\"relayCount\":3"));
        assert!(json.contains("\"pendingQueueSize\":2"));
        assert!(json.contains("\"rateLimited\":1"));
        let back: HealthSnapshot = serde_json::from_str(&json).expect("parse");
        assert_eq!(snapshot, back);
    }
}

//! Worker counters and the heartbeat file.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use pulse_store::atomic::{self, FileMode};
use pulse_store::paths::DataDir;
use pulse_types::health::{HealthSnapshot, MemoryUsage, WorkerStats};

use crate::Result;

/// Shared, lock-free worker counters.
#[derive(Debug, Default)]
pub struct Counters {
    pub sent: AtomicU64,
    pub received: AtomicU64,
    pub commands: AtomicU64,
    pub errors: AtomicU64,
    pub rate_limited: AtomicU64,
    pub cache_size: AtomicU64,
    pub group_count: AtomicU64,
    pub pending_queue_size: AtomicU64,
}

impl Counters {
    pub fn incr(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set(&self, counter: &AtomicU64, value: u64) {
        counter.store(value, Ordering::Relaxed);
    }

    /// Snapshot for the health file.
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            commands: self.commands.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            cache_size: self.cache_size.load(Ordering::Relaxed),
            group_count: self.group_count.load(Ordering::Relaxed),
            pending_queue_size: self.pending_queue_size.load(Ordering::Relaxed),
        }
    }
}

/// Resident set size in bytes, best effort.
pub fn rss_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        let page_size = 4096u64;
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(rss_pages) = statm
                .split_whitespace()
                .nth(1)
                .and_then(|f| f.parse::<u64>().ok())
            {
                return rss_pages * page_size;
            }
        }
        0
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

/// Overwrite the heartbeat file.
pub fn write_snapshot(
    data: &DataDir,
    started: Instant,
    connected: bool,
    relay_count: usize,
    stats: WorkerStats,
    now_ms: i64,
) -> Result<()> {
    let snapshot = HealthSnapshot {
        pid: std::process::id(),
        uptime: started.elapsed().as_secs(),
        connected,
        relay_count,
        memory: MemoryUsage { rss: rss_bytes() },
        stats,
        ts: now_ms,
    };
    atomic::write_json(&data.health_file(), &snapshot, FileMode::Shared)?;
    Ok(())
}

/// Remove the heartbeat file on shutdown.
pub fn remove_snapshot(data: &DataDir) {
    let _ = std::fs::remove_file(data.health_file());
}

/// Read the current snapshot, if a worker wrote one.
pub fn read_snapshot(data: &DataDir) -> Result<Option<HealthSnapshot>> {
    Ok(atomic::read_json(&data.health_file())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let counters = Counters::default();
        counters.incr(&counters.sent);
        counters.incr(&counters.sent);
        counters.incr(&counters.rate_limited);
        counters.set(&counters.pending_queue_size, 7);

        let stats = counters.stats();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.rate_limited, 1);
        assert_eq!(stats.pending_queue_size, 7);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn test_write_read_remove() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = DataDir::new(dir.path());

        write_snapshot(&data, Instant::now(), true, 3, WorkerStats::default(), 1234)
            .expect("write");
        let snapshot = read_snapshot(&data).expect("read").expect("present");
        assert_eq!(snapshot.pid, std::process::id());
        assert!(snapshot.connected);
        assert_eq!(snapshot.relay_count, 3);
        assert_eq!(snapshot.ts, 1234);

        remove_snapshot(&data);
        assert!(read_snapshot(&data).expect("read").is_none());
    }
}

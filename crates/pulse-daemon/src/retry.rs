//! The offline retry queue.
//!
//! Durable FIFO of outgoing messages awaiting redelivery. The in-memory
//! queue is authoritative during a run; the on-disk form is a debounced
//! whole-file JSON-lines snapshot, rebuilt at startup and flushed on
//! shutdown. Capacity overflows evict the oldest entry by `created_at`.

use tracing::{debug, info, warn};

use pulse_store::atomic::{self, FileMode};
use pulse_store::paths::DataDir;
use pulse_types::message::{QueuedKind, QueuedMessage};
use pulse_types::{MAX_QUEUE, MAX_RETRIES, QUEUE_TTL_MS, RETRY_BASE_MS, RETRY_FACTOR};

use crate::Result;

/// Dirty operations that trigger a debounced snapshot.
const FLUSH_OPS_THRESHOLD: u32 = 10;

/// An entry that left the queue without being delivered.
#[derive(Clone, Debug, PartialEq)]
pub struct DroppedMessage {
    pub message: QueuedMessage,
    pub reason: DropReason,
}

/// Why an entry was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// `retry_count` reached the cap.
    RetriesExhausted,
    /// Older than the queue TTL.
    Expired,
    /// Evicted to make room for a newer entry.
    Evicted,
}

/// The persistent retry queue.
#[derive(Debug)]
pub struct RetryQueue {
    entries: Vec<QueuedMessage>,
    data: DataDir,
    pending_ops: u32,
    max_entries: usize,
}

impl RetryQueue {
    /// Rebuild the queue from its snapshot file.
    pub fn load(data: DataDir) -> Result<Self> {
        let entries: Vec<QueuedMessage> = atomic::read_jsonl(&data.queue_file())?;
        if !entries.is_empty() {
            info!(count = entries.len(), "retry queue restored");
        }
        Ok(Self {
            entries,
            data,
            pending_ops: 0,
            max_entries: MAX_QUEUE,
        })
    }

    #[cfg(test)]
    fn with_capacity(data: DataDir, max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            data,
            pending_ops: 0,
            max_entries,
        }
    }

    /// Enqueue an outgoing message. Returns the queue id and the evicted
    /// entry when the capacity bound displaced one.
    pub fn enqueue(
        &mut self,
        kind: QueuedKind,
        target: &str,
        content: &str,
        group_id: Option<&str>,
        topic: Option<&str>,
        now_ms: i64,
    ) -> (String, Option<DroppedMessage>) {
        let mut evicted = None;
        if self.entries.len() >= self.max_entries {
            // Oldest by created_at goes first.
            if let Some(oldest) = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(i, _)| i)
            {
                let message = self.entries.remove(oldest);
                warn!(id = %message.id, "retry queue full; evicting oldest");
                evicted = Some(DroppedMessage {
                    message,
                    reason: DropReason::Evicted,
                });
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.entries.push(QueuedMessage {
            id: id.clone(),
            kind,
            target: target.to_string(),
            content: content.to_string(),
            retry_count: 0,
            created_at: now_ms,
            next_retry_at: now_ms,
            last_error: None,
            topic: topic.map(str::to_string),
            group_id: group_id.map(str::to_string),
        });
        self.pending_ops += 1;
        debug!(%id, ?kind, "message queued for retry");
        (id, evicted)
    }

    /// Entries whose `next_retry_at` has passed, in FIFO order.
    pub fn due(&self, now_ms: i64) -> Vec<QueuedMessage> {
        self.entries
            .iter()
            .filter(|e| e.next_retry_at <= now_ms)
            .cloned()
            .collect()
    }

    /// Remove a delivered entry.
    pub fn mark_delivered(&mut self, id: &str) {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        if self.entries.len() != before {
            self.pending_ops += 1;
        }
    }

    /// Record a failed attempt: bump the count, push `next_retry_at` out
    /// by `base · factor^(retry_count − 1)`. Entries at the retry cap are
    /// dropped and returned.
    pub fn mark_failed(&mut self, id: &str, error: &str, now_ms: i64) -> Option<DroppedMessage> {
        let index = self.entries.iter().position(|e| e.id == id)?;
        let entry = &mut self.entries[index];
        entry.retry_count += 1;
        entry.last_error = Some(error.to_string());
        self.pending_ops += 1;

        if entry.retry_count >= MAX_RETRIES {
            let message = self.entries.remove(index);
            warn!(id = %message.id, "message dropped after retry limit");
            return Some(DroppedMessage {
                message,
                reason: DropReason::RetriesExhausted,
            });
        }

        let entry = &mut self.entries[index];
        let backoff = RETRY_BASE_MS * RETRY_FACTOR.pow(entry.retry_count - 1);
        entry.next_retry_at = now_ms + backoff;
        None
    }

    /// Drop entries older than the queue TTL; returns what was dropped.
    pub fn expire(&mut self, now_ms: i64) -> Vec<DroppedMessage> {
        let (expired, kept): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| now_ms - e.created_at >= QUEUE_TTL_MS);
        self.entries = kept;
        if !expired.is_empty() {
            self.pending_ops += 1;
            info!(count = expired.len(), "expired queued messages");
        }
        expired
            .into_iter()
            .map(|message| DroppedMessage {
                message,
                reason: DropReason::Expired,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of all entries, for status surfaces.
    pub fn entries(&self) -> &[QueuedMessage] {
        &self.entries
    }

    /// Snapshot to disk when enough operations accumulated.
    pub fn maybe_flush(&mut self) -> Result<()> {
        if self.pending_ops >= FLUSH_OPS_THRESHOLD {
            self.flush()?;
        }
        Ok(())
    }

    /// Unconditional snapshot; called on shutdown.
    pub fn flush(&mut self) -> Result<()> {
        atomic::write_jsonl(&self.data.queue_file(), &self.entries, FileMode::Shared)?;
        self.pending_ops = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> (RetryQueue, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = DataDir::new(dir.path());
        (RetryQueue::load(data).expect("load"), dir)
    }

    #[test]
    fn test_enqueue_due_immediately() {
        let (mut q, _dir) = queue();
        let (id, evicted) = q.enqueue(QueuedKind::Send, "pk", "hello", None, None, 1000);
        assert!(evicted.is_none());
        let due = q.due(1000);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, id);
        assert_eq!(due[0].retry_count, 0);
    }

    #[test]
    fn test_backoff_schedule_monotonic() {
        let (mut q, _dir) = queue();
        let (id, _) = q.enqueue(QueuedKind::Send, "pk", "m", None, None, 0);

        let mut now = 0;
        let mut last_next = 0;
        for k in 1..MAX_RETRIES {
            now += 10;
            assert!(q.mark_failed(&id, "no relay", now).is_none());
            let entry = &q.entries()[0];
            assert_eq!(entry.retry_count, k);
            let expected = now + RETRY_BASE_MS * RETRY_FACTOR.pow(k - 1);
            assert_eq!(entry.next_retry_at, expected);
            assert!(entry.next_retry_at > last_next);
            last_next = entry.next_retry_at;
            // Not due before its schedule
            assert!(q.due(entry.next_retry_at - 1).is_empty());
        }
    }

    #[test]
    fn test_terminal_after_max_retries() {
        let (mut q, _dir) = queue();
        let (id, _) = q.enqueue(QueuedKind::Send, "pk", "m", None, None, 0);
        for _ in 1..MAX_RETRIES {
            assert!(q.mark_failed(&id, "err", 0).is_none());
        }
        let dropped = q.mark_failed(&id, "err", 0).expect("terminal");
        assert_eq!(dropped.reason, DropReason::RetriesExhausted);
        assert!(q.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut q = RetryQueue::with_capacity(DataDir::new(dir.path()), 3);
        // Enqueue out of created_at order to prove eviction keys on it
        q.enqueue(QueuedKind::Send, "x", "m5", None, None, 500);
        q.enqueue(QueuedKind::Send, "x", "m1", None, None, 100);
        q.enqueue(QueuedKind::Send, "x", "m9", None, None, 900);

        let (_, evicted) = q.enqueue(QueuedKind::Send, "y", "new", None, None, 1000);
        let evicted = evicted.expect("evicted");
        assert_eq!(evicted.reason, DropReason::Evicted);
        assert_eq!(evicted.message.content, "m1");
        assert_eq!(q.len(), 3);
        assert!(q.entries().iter().any(|e| e.content == "new"));
    }

    #[test]
    fn test_ttl_expiry() {
        let (mut q, _dir) = queue();
        q.enqueue(QueuedKind::Send, "x", "old", None, None, 0);
        q.enqueue(QueuedKind::Send, "x", "young", None, None, QUEUE_TTL_MS / 2);

        let dropped = q.expire(QUEUE_TTL_MS);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].message.content, "old");
        assert_eq!(dropped[0].reason, DropReason::Expired);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = DataDir::new(dir.path());
        {
            let mut q = RetryQueue::load(data.clone()).expect("load");
            q.enqueue(
                QueuedKind::GroupSend,
                "group-g1",
                "hello",
                Some("g1"),
                Some("group-g1"),
                42,
            );
            q.flush().expect("flush");
        }
        let q = RetryQueue::load(data).expect("reload");
        assert_eq!(q.len(), 1);
        assert_eq!(q.entries()[0].kind, QueuedKind::GroupSend);
        assert_eq!(q.entries()[0].topic.as_deref(), Some("group-g1"));
        assert_eq!(q.entries()[0].group_id.as_deref(), Some("g1"));
    }

    #[test]
    fn test_mark_delivered() {
        let (mut q, _dir) = queue();
        let (id, _) = q.enqueue(QueuedKind::Send, "pk", "m", None, None, 0);
        q.mark_delivered(&id);
        assert!(q.is_empty());
        // Unknown ids are a no-op
        q.mark_delivered("nope");
    }
}

//! Rate limiting: a per-sender sliding window for inbound messages and a
//! global token bucket for commands.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Per-sender sliding-window limiter.
///
/// Each sender may pass `limit` checks per `window`; entries idle past the
/// eviction threshold are dropped by the periodic sweep.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    window: Duration,
    limit: usize,
    idle_eviction: Duration,
    entries: HashMap<String, VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(limit: usize, window: Duration, idle_eviction: Duration) -> Self {
        Self {
            window,
            limit,
            idle_eviction,
            entries: HashMap::new(),
        }
    }

    /// The default inbound-message limiter: 30 per minute per sender,
    /// idle entries evicted after 10 minutes.
    pub fn for_messages() -> Self {
        Self::new(
            pulse_types::SENDER_RATE_LIMIT_PER_MIN,
            Duration::from_secs(60),
            Duration::from_secs(600),
        )
    }

    /// Record an arrival; `false` means the sender exceeded its window.
    pub fn check(&mut self, sender: &str, now: Instant) -> bool {
        let hits = self.entries.entry(sender.to_string()).or_default();
        while let Some(front) = hits.front() {
            if now.duration_since(*front) > self.window {
                hits.pop_front();
            } else {
                break;
            }
        }
        if hits.len() >= self.limit {
            return false;
        }
        hits.push_back(now);
        true
    }

    /// Drop senders with no activity inside the eviction threshold.
    pub fn evict_idle(&mut self, now: Instant) {
        let idle = self.idle_eviction;
        self.entries.retain(|_, hits| {
            hits.back()
                .is_some_and(|last| now.duration_since(*last) <= idle)
        });
    }

    /// Tracked sender count.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Global token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    updated: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64, now: Instant) -> Self {
        Self {
            capacity: f64::from(capacity),
            tokens: f64::from(capacity),
            refill_per_sec,
            updated: now,
        }
    }

    /// The default command limiter: burst of 20, refill 10/s.
    pub fn for_commands(now: Instant) -> Self {
        Self::new(20, 10.0, now)
    }

    /// Take one token; `false` when the bucket is dry.
    pub fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.updated).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.updated = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

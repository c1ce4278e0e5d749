//! # pulse-types
//!
//! Shared domain types used across the agent-pulse workspace: the wire
//! event, application payloads, stored messages, groups, the offline queue,
//! relay statistics, the command/result channel, and the failure taxonomy.

pub mod command;
pub mod error;
pub mod event;
pub mod group;
pub mod health;
pub mod message;
pub mod payload;
pub mod relay;

/// Lowercase hex encoding of a 32-byte x-only public key.
pub type PubkeyHex = String;

/// Lowercase hex encoding of a 32-byte event id.
pub type EventIdHex = String;

/// Event kind used for all agent traffic (parameterized replaceable).
pub const AGENT_EVENT_KIND: u32 = 30078;

/// Maximum accepted event content size in bytes.
pub const MAX_CONTENT_BYTES: usize = 8 * 1024;

/// Replay tolerance around an event timestamp, in milliseconds.
pub const REPLAY_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Events older than this are treated as historical fetches, not replays.
pub const HISTORIC_CUTOFF_MS: i64 = 365 * 24 * 60 * 60 * 1000;

/// Capacity of the event-id dedup cache.
pub const DEDUP_CACHE_SIZE: usize = 5000;

/// Capacity of the known-peers cache.
pub const PEER_CACHE_SIZE: usize = 1000;

/// Capacity of the payload-nonce replay window.
pub const NONCE_CACHE_SIZE: usize = 10_000;

/// Maximum entries held in the offline retry queue.
pub const MAX_QUEUE: usize = 10_000;

/// Attempts before a queued message is dropped with a terminal error.
pub const MAX_RETRIES: u32 = 3;

/// Base delay for retry backoff, in milliseconds.
pub const RETRY_BASE_MS: i64 = 5000;

/// Multiplicative backoff factor between retry attempts.
pub const RETRY_FACTOR: i64 = 2;

/// Queued messages older than this are expired, in milliseconds.
pub const QUEUE_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// Consecutive failures before a relay is blacklisted.
pub const BLACKLIST_THRESHOLD: u32 = 10;

/// Consecutive successes that lift a blacklist entry.
pub const RECOVERY_SUCCESSES: u32 = 5;

/// Relays scoring below this are excluded from selection.
pub const MIN_RELAY_SCORE: f64 = 0.2;

/// Warn when fewer healthy relays than this are available for publish.
pub const MIN_HEALTHY_RELAYS: usize = 2;

/// Number of relays used for a multi-path publish.
pub const MULTI_PATH_RELAYS: usize = 3;

/// Per-sender message allowance within one sliding-window minute.
pub const SENDER_RATE_LIMIT_PER_MIN: usize = 30;

/// Newest results retained in the results file after a drain.
pub const RESULTS_RETENTION: usize = 1000;

//! # pulse-relay
//!
//! The relay layer: one WebSocket session per relay with reconnect and
//! backoff, a frame codec for the wire protocol, and a pool that scores
//! relay health, blacklists failing relays, and publishes over multiple
//! paths.

pub mod frames;
pub mod health;
pub mod pool;
pub mod session;

/// Error types for relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// WebSocket connect failed or timed out.
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    /// An operation exceeded its budget.
    #[error("operation timed out")]
    Timeout,

    /// A frame could not be parsed or built.
    #[error("bad frame: {0}")]
    Frame(String),

    /// The session is closed and accepts no further work.
    #[error("session closed")]
    Closed,

    /// No relay is currently eligible for selection.
    #[error("no healthy relay available")]
    NoHealthyRelays,

    /// Every attempted relay rejected or timed out.
    #[error("all relays failed")]
    AllRelaysFailed,

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Persisting relay state failed.
    #[error(transparent)]
    Store(#[from] pulse_store::StoreError),
}

pub type Result<T> = std::result::Result<T, RelayError>;

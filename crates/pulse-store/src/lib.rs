//! # pulse-store
//!
//! Local persistence for the agent: atomic JSON and JSON-lines files, the
//! cross-process directory lock, bounded LRU maps, the data-directory
//! layout, and the encrypted message log.
//!
//! All multi-party file access (worker + CLI invocations) is serialized by
//! [`lock`]; everything else is single-writer (the worker).

pub mod atomic;
pub mod lock;
pub mod lru;
pub mod message_log;
pub mod paths;
pub mod storage_key;

use std::path::PathBuf;
use std::time::Duration;

/// Error types for persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The cross-process lock could not be acquired in time.
    #[error("lock not acquired within {0:?}")]
    LockTimeout(Duration),

    /// The target of a read or write is a symlink.
    #[error("refusing symlink at {0}")]
    Symlink(PathBuf),

    /// A derived path resolved outside its permitted root.
    #[error("path escapes root: {0}")]
    PathOutsideRoot(PathBuf),

    /// A persisted file holds owner-unsafe permissions.
    #[error("unsafe permissions on {0}")]
    UnsafePermissions(PathBuf),

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Envelope encryption failed.
    #[error(transparent)]
    Crypto(#[from] pulse_crypto::CryptoError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

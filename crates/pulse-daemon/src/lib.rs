//! # pulse-daemon
//!
//! The background worker and its machinery: configuration, the identity
//! store, the event dispatcher, the command inbox, the offline retry
//! queue, rate limiting, the replay window, health reporting, service
//! control, and the supervisor that wires them together.
//!
//! The binary (`pulse-daemon`) runs the worker in the foreground (`run`)
//! and offers `start`/`stop`/`status` service control around a detached
//! instance of itself.

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod health;
pub mod identity;
pub mod inbox;
pub mod outbound;
pub mod ratelimit;
pub mod replay;
pub mod retry;
pub mod service;
pub mod worker;

use pulse_types::error::ErrorCode;

/// Error types for worker operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("worker not running")]
    NotRunning,

    #[error("worker failed to start: {0}")]
    StartFailed(String),

    #[error("worker failed to stop: {0}")]
    StopFailed(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("secret key export not authorized")]
    ExportUnauthorized,

    #[error(transparent)]
    Crypto(#[from] pulse_crypto::CryptoError),

    #[error(transparent)]
    Store(#[from] pulse_store::StoreError),

    #[error(transparent)]
    Relay(#[from] pulse_relay::RelayError),

    #[error(transparent)]
    Group(#[from] pulse_groups::GroupError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// The stable incident code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            WorkerError::AlreadyRunning(_) => ErrorCode::ServiceAlreadyRunning,
            WorkerError::NotRunning => ErrorCode::ServiceNotRunning,
            WorkerError::StartFailed(_) => ErrorCode::ServiceStartFailed,
            WorkerError::StopFailed(_) => ErrorCode::ServiceStopFailed,
            WorkerError::InvalidArgs(_) | WorkerError::ExportUnauthorized => ErrorCode::InvalidArgs,
            WorkerError::Crypto(_) => ErrorCode::InvalidSignature,
            WorkerError::Store(pulse_store::StoreError::LockTimeout(_)) => ErrorCode::LockTimeout,
            WorkerError::Store(_) | WorkerError::Io(_) => ErrorCode::FileError,
            WorkerError::Relay(pulse_relay::RelayError::AllRelaysFailed) => ErrorCode::RelayAllFailed,
            WorkerError::Relay(pulse_relay::RelayError::NoHealthyRelays) => {
                ErrorCode::NetworkDisconnected
            }
            WorkerError::Relay(_) => ErrorCode::NetworkSendFailed,
            WorkerError::Group(e) => e.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;

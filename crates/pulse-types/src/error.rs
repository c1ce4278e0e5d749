//! Failure taxonomy.
//!
//! Every incident surfaced to a caller carries one of these stable machine
//! codes plus a short human message; most also carry a recovery suggestion
//! the CLI can print verbatim.

use serde::{Deserialize, Serialize};

/// Stable incident codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    #[error("worker is not running")]
    ServiceNotRunning,
    #[error("worker is already running")]
    ServiceAlreadyRunning,
    #[error("worker failed to start")]
    ServiceStartFailed,
    #[error("worker failed to stop")]
    ServiceStopFailed,

    #[error("no relay connection available")]
    NetworkDisconnected,
    #[error("publish failed")]
    NetworkSendFailed,
    #[error("all relays rejected or timed out")]
    RelayAllFailed,

    #[error("invalid arguments")]
    InvalidArgs,
    #[error("invalid public key")]
    InvalidPubkey,
    #[error("invalid signature")]
    InvalidSignature,

    #[error("group not found")]
    GroupNotFound,
    #[error("group already exists")]
    GroupAlreadyExists,
    #[error("operation requires group ownership")]
    NotGroupOwner,
    #[error("member not found")]
    MemberNotFound,
    #[error("member is banned")]
    MemberBanned,
    #[error("member is muted")]
    MemberMuted,

    #[error("message expired before delivery")]
    MessageExpired,
    #[error("message dropped after retry limit")]
    MessageRetryExhausted,

    #[error("file operation failed")]
    FileError,
    #[error("could not acquire the command lock")]
    LockTimeout,
    #[error("unknown command")]
    UnknownCommand,
    #[error("internal error")]
    InternalError,
}

impl ErrorCode {
    /// The wire form of this code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ServiceNotRunning => "SERVICE_NOT_RUNNING",
            ErrorCode::ServiceAlreadyRunning => "SERVICE_ALREADY_RUNNING",
            ErrorCode::ServiceStartFailed => "SERVICE_START_FAILED",
            ErrorCode::ServiceStopFailed => "SERVICE_STOP_FAILED",
            ErrorCode::NetworkDisconnected => "NETWORK_DISCONNECTED",
            ErrorCode::NetworkSendFailed => "NETWORK_SEND_FAILED",
            ErrorCode::RelayAllFailed => "RELAY_ALL_FAILED",
            ErrorCode::InvalidArgs => "INVALID_ARGS",
            ErrorCode::InvalidPubkey => "INVALID_PUBKEY",
            ErrorCode::InvalidSignature => "INVALID_SIGNATURE",
            ErrorCode::GroupNotFound => "GROUP_NOT_FOUND",
            ErrorCode::GroupAlreadyExists => "GROUP_ALREADY_EXISTS",
            ErrorCode::NotGroupOwner => "NOT_GROUP_OWNER",
            ErrorCode::MemberNotFound => "MEMBER_NOT_FOUND",
            ErrorCode::MemberBanned => "MEMBER_BANNED",
            ErrorCode::MemberMuted => "MEMBER_MUTED",
            ErrorCode::MessageExpired => "MESSAGE_EXPIRED",
            ErrorCode::MessageRetryExhausted => "MESSAGE_RETRY_EXHAUSTED",
            ErrorCode::FileError => "FILE_ERROR",
            ErrorCode::LockTimeout => "LOCK_TIMEOUT",
            ErrorCode::UnknownCommand => "UNKNOWN_COMMAND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// A recovery hint for the caller, when one exists.
    pub fn suggestion(self) -> Option<&'static str> {
        match self {
            ErrorCode::ServiceNotRunning => Some("run start"),
            ErrorCode::ServiceAlreadyRunning => Some("run stop first, or use the running worker"),
            ErrorCode::ServiceStartFailed => Some("check the log output and retry"),
            ErrorCode::NetworkDisconnected | ErrorCode::RelayAllFailed => {
                Some("message was queued; it will retry automatically")
            }
            ErrorCode::InvalidPubkey => Some("pass a 64-char hex key or an npub string"),
            ErrorCode::GroupNotFound => Some("run groups to list known groups"),
            ErrorCode::MemberMuted => Some("wait for the mute to expire or ask an admin"),
            ErrorCode::LockTimeout => Some("retry; another process holds the data lock"),
            _ => None,
        }
    }
}

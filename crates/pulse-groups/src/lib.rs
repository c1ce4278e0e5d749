//! # pulse-groups
//!
//! Group membership state and per-group history persistence: roles,
//! bans, mutes, ownership transfer, and the append-only history files.

pub mod history;
pub mod manager;

use pulse_types::error::ErrorCode;

/// Error types for group operations.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("group {0} not found")]
    NotFound(String),

    #[error("group {0} already exists")]
    AlreadyExists(String),

    /// The operator lacks ownership for an owner-only operation, or an
    /// owner tried to leave without transferring first.
    #[error("operation requires group ownership: {0}")]
    NotOwner(String),

    /// The operator lacks admin rights.
    #[error("operation requires admin rights")]
    NotAdmin,

    /// The target must not be the owner.
    #[error("operation cannot target the owner")]
    TargetIsOwner,

    #[error("member {0} not found")]
    MemberNotFound(String),

    #[error("member {0} is banned")]
    Banned(String),

    #[error("member {0} is muted")]
    Muted(String),

    /// Group name failed validation.
    #[error("invalid group name: {0}")]
    InvalidName(String),

    /// Group id failed path-safety validation.
    #[error("invalid group id: {0}")]
    InvalidId(String),

    #[error(transparent)]
    Store(#[from] pulse_store::StoreError),
}

impl GroupError {
    /// The stable incident code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            GroupError::NotFound(_) => ErrorCode::GroupNotFound,
            GroupError::AlreadyExists(_) => ErrorCode::GroupAlreadyExists,
            GroupError::NotOwner(_) | GroupError::NotAdmin | GroupError::TargetIsOwner => {
                ErrorCode::NotGroupOwner
            }
            GroupError::MemberNotFound(_) => ErrorCode::MemberNotFound,
            GroupError::Banned(_) => ErrorCode::MemberBanned,
            GroupError::Muted(_) => ErrorCode::MemberMuted,
            GroupError::InvalidName(_) | GroupError::InvalidId(_) => ErrorCode::InvalidArgs,
            GroupError::Store(_) => ErrorCode::FileError,
        }
    }
}

pub type Result<T> = std::result::Result<T, GroupError>;

//! Error types for pool operations

use crate::core::PoolId;
use rusqlite::ErrorCode;
use thiserror::Error;

/// Pool operation result type
pub type Result<T> = std::result::Result<T, PoolError>;

/// Pool operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Text is not valid CIDR notation
    #[error("Invalid CIDR notation: {0}")]
    InvalidFormat(String),

    /// Address has bits set beyond the prefix length
    #[error("CIDR notation is invalid: {0} is not the first address of the range")]
    NonCanonicalAddress(String),

    /// Invalid caller-supplied argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Buddy or split requested on a block that has none
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Owner already holds a block of a different size
    #[error("Owner {owner:?} was previously allocated a /{existing} but now requested a /{requested}")]
    OwnerSizeMismatch {
        owner: String,
        existing: u8,
        requested: u8,
    },

    /// No free block is large enough
    #[error("No free address range of size /{prefix_len} or larger in pool {pool}")]
    PoolExhausted { pool: PoolId, prefix_len: u8 },

    /// Owner holds no block in the pool
    #[error("Nothing is allocated to {owner:?} in pool {pool}")]
    NotAllocated { pool: PoolId, owner: String },

    /// Update or delete affected no record
    #[error("Record conflict or missing: {0}")]
    ConflictOrMissing(String),

    /// Primary key or owner uniqueness violated
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Commit could not be linearized with concurrent transactions
    #[error("Serialization conflict: {0}")]
    SerializationConflict(String),

    /// Transport-level store failure
    #[error("Store failure: {0}")]
    StoreFailure(String),

    /// Caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Caller deadline passed
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Configured attempt limit reached while conflicts kept occurring
    #[error("Gave up after {attempts} attempts due to concurrent modifications")]
    RetriesExhausted { attempts: u32 },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Broken store contract or other bug
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PoolError {
    /// Contention outcomes that are resolved by rerunning the whole operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PoolError::SerializationConflict(_) | PoolError::ConstraintViolation(_)
        )
    }

    /// Outcomes that describe pool state rather than a fault.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            PoolError::PoolExhausted { .. }
                | PoolError::NotAllocated { .. }
                | PoolError::OwnerSizeMismatch { .. }
        )
    }
}

impl From<rusqlite::Error> for PoolError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _) => match err.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    PoolError::SerializationConflict(e.to_string())
                }
                ErrorCode::ConstraintViolation => PoolError::ConstraintViolation(e.to_string()),
                _ => PoolError::StoreFailure(e.to_string()),
            },
            _ => PoolError::StoreFailure(e.to_string()),
        }
    }
}

impl From<toml::de::Error> for PoolError {
    fn from(e: toml::de::Error) -> Self {
        PoolError::Config(e.to_string())
    }
}

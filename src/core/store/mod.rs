//! Transactional record stores
//!
//! The allocator never talks to a backend directly. It opens a [`Transaction`]
//! through the [`Store`] trait, reads and writes [`Record`]s, and commits.
//!
//! Implementations map their own conflict signals onto
//! [`PoolError::SerializationConflict`] and [`PoolError::ConstraintViolation`],
//! which the allocator treats as "rerun the operation".
//!
//! Two stores ship with the crate:
//! - [`MemoryStore`]: in-process, optimistic validation at pool granularity
//! - [`SqliteStore`]: durable, backed by SQLite

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::core::block::AddressBlock;
use crate::core::record::{PoolId, Record};
use crate::error::{PoolError, Result};
use serde::{Deserialize, Serialize};

/// Transaction isolation level
///
/// See <https://en.wikipedia.org/wiki/Isolation_(database_systems)#Isolation_levels>.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    Serializable,
}

/// Options for [`Store::begin`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

impl TxOptions {
    /// Read-write serializable transaction
    pub fn serializable() -> Self {
        TxOptions {
            isolation: IsolationLevel::Serializable,
            read_only: false,
        }
    }

    /// Read-only transaction at the given isolation level
    pub fn read_only(isolation: IsolationLevel) -> Self {
        TxOptions {
            isolation,
            read_only: true,
        }
    }
}

/// A store of pool records
pub trait Store: Send + Sync {
    /// Start a transaction
    ///
    /// Callers must finish it with [`Transaction::commit`] or
    /// [`Transaction::rollback`]. Dropping it unfinished rolls it back.
    fn begin(&self, options: TxOptions) -> Result<Box<dyn Transaction + '_>>;
}

impl<S: Store + ?Sized> Store for std::sync::Arc<S> {
    fn begin(&self, options: TxOptions) -> Result<Box<dyn Transaction + '_>> {
        (**self).begin(options)
    }
}

impl<S: Store + ?Sized> Store for &S {
    fn begin(&self, options: TxOptions) -> Result<Box<dyn Transaction + '_>> {
        (**self).begin(options)
    }
}

/// Reads and writes inside one store transaction
pub trait Transaction {
    /// Find the record allocated to `owner`
    ///
    /// There is at most one, since owners are unique within a pool.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `owner` is empty.
    fn find_by_owner(&mut self, pool: PoolId, owner: &str) -> Result<Option<Record>>;

    /// Find a free record of the pool that is at least as large as a
    /// `/min_prefix_len` and is the smallest such record
    ///
    /// Among free records with `prefix_len <= min_prefix_len` this returns one
    /// with the largest `prefix_len`. Ties are broken arbitrarily.
    fn find_smallest_free(&mut self, pool: PoolId, min_prefix_len: u8) -> Result<Option<Record>>;

    /// Exact lookup by primary key
    fn get(&mut self, pool: PoolId, block: &AddressBlock) -> Result<Option<Record>>;

    /// Change the owner of an existing record
    ///
    /// # Errors
    ///
    /// `ConflictOrMissing` if no record has this `(pool, block)`.
    fn update(&mut self, record: &Record) -> Result<()>;

    /// Remove exactly one record
    ///
    /// # Errors
    ///
    /// `ConflictOrMissing` if no record has this `(pool, block)`.
    fn delete(&mut self, pool: PoolId, block: &AddressBlock) -> Result<()>;

    /// Insert a batch of records
    ///
    /// # Errors
    ///
    /// `ConstraintViolation` if a primary key or owner is already taken.
    fn insert_many(&mut self, records: &[Record]) -> Result<()>;

    /// All records of a pool, ordered by address
    fn list(&mut self, pool: PoolId) -> Result<Vec<Record>>;

    /// Commit the transaction
    ///
    /// # Errors
    ///
    /// `SerializationConflict` if the transaction cannot be linearized with
    /// transactions that committed concurrently.
    fn commit(self: Box<Self>) -> Result<()>;

    /// Roll back the transaction
    fn rollback(self: Box<Self>) -> Result<()>;
}

/// Reject an empty owner for owner lookups
pub(crate) fn require_owner(owner: &str) -> Result<()> {
    if owner.is_empty() {
        return Err(PoolError::InvalidArgument(
            "owner must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Reject writes through a read-only transaction
pub(crate) fn require_writable(options: &TxOptions) -> Result<()> {
    if options.read_only {
        return Err(PoolError::InvalidArgument(
            "write in a read-only transaction".to_string(),
        ));
    }
    Ok(())
}

//! Pool records
//!
//! A record is the unit the store persists: one address block of one pool,
//! either free or allocated to an owner.

use crate::core::block::AddressBlock;
use serde::{Deserialize, Serialize};

/// Pool identifier
pub type PoolId = u32;

/// One address block of a pool
///
/// `(pool, block)` is the primary key. A non-empty owner is unique within a pool.
/// The block of a record never changes; resizing is delete + insert.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record {
    pub pool: PoolId,

    pub block: AddressBlock,

    /// Identifier of the object this block is allocated to (None if free)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl Record {
    /// A free record
    pub fn free(pool: PoolId, block: AddressBlock) -> Self {
        Record {
            pool,
            block,
            owner: None,
        }
    }

    /// A record allocated to `owner`
    ///
    /// An empty owner yields a free record.
    pub fn allocated(pool: PoolId, block: AddressBlock, owner: impl Into<String>) -> Self {
        let owner = owner.into();
        Record {
            pool,
            block,
            owner: if owner.is_empty() { None } else { Some(owner) },
        }
    }

    pub fn is_free(&self) -> bool {
        self.owner.is_none()
    }

    /// Owner as a string slice, empty if free
    pub fn owner_str(&self) -> &str {
        self.owner.as_deref().unwrap_or("")
    }
}

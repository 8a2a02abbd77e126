//! # cidr-pool - Buddy-System CIDR Allocation
//!
//! `cidr-pool` hands out IP address blocks from pools of CIDR ranges. Each pool
//! starts as one or more large free blocks. Requests for a `/n` are served by
//! splitting the smallest free block that fits; freed blocks are merged back
//! with their buddies.
//!
//! - **Transactional**: every change goes through a [`Store`] transaction
//! - **Concurrent**: conflicting callers are retried until they linearize
//! - **Idempotent**: an owner asking twice for the same size gets the same block
//! - **IPv4 and IPv6**: all arithmetic is done on 128-bit integers
//!
//! ## Quick Start
//!
//! ```rust
//! use cidr_pool::{AddressBlock, Allocator, Context, MemoryStore, Result};
//!
//! # fn main() -> Result<()> {
//! let alloc = Allocator::new(MemoryStore::new());
//! let ctx = Context::background();
//!
//! // Seed pool 1 with a /16
//! alloc.seed(&ctx, 1, AddressBlock::parse("10.0.0.0/16")?)?;
//!
//! let block = alloc.allocate(&ctx, 1, 24, "vm-1")?;
//! assert_eq!(block.to_string(), "10.0.0.0/24");
//!
//! alloc.deallocate(&ctx, 1, "vm-1")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Durable Storage
//!
//! ```rust,no_run
//! use cidr_pool::{AllocatorBuilder, Context, SqliteStore, Result};
//! use std::time::Duration;
//!
//! # fn main() -> Result<()> {
//! let alloc = AllocatorBuilder::new()
//!     .max_attempts(100)
//!     .retry_backoff(Duration::from_millis(5))
//!     .build(SqliteStore::open("pools.db")?)?;
//!
//! let ctx = Context::background().with_timeout(Duration::from_secs(2));
//! let block = alloc.allocate(&ctx, 1, 26, "subnet-a")?;
//! println!("allocated {}", block);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;

#[cfg(feature = "async")]
pub mod nonblocking;

pub use crate::config::AllocatorConfig;
pub use crate::core::{
    AddressBlock, Allocator, Context, IsolationLevel, MemoryStore, PoolId, Record, SqliteStore,
    Store, Transaction, TxOptions,
};
pub use crate::error::{PoolError, Result};

#[cfg(feature = "async")]
pub use crate::nonblocking::AsyncAllocator;

use std::time::Duration;
use tracing::debug;

/// Builder for [`Allocator`] with custom retry behavior
///
/// # Examples
///
/// ```rust
/// use cidr_pool::{AllocatorBuilder, IsolationLevel, MemoryStore};
///
/// # fn main() -> cidr_pool::Result<()> {
/// let alloc = AllocatorBuilder::new()
///     .max_attempts(10)
///     .fast_path_isolation(IsolationLevel::ReadCommitted)
///     .build(MemoryStore::new())?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct AllocatorBuilder {
    config: AllocatorConfig,
}

impl AllocatorBuilder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        AllocatorBuilder {
            config: AllocatorConfig::default(),
        }
    }

    /// Start from an existing configuration, e.g. one loaded from TOML
    pub fn config(mut self, config: AllocatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Give up after this many attempts of a contended operation
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = Some(attempts);
        self
    }

    /// Retry contended operations until they succeed or the context ends
    pub fn unbounded_retries(mut self) -> Self {
        self.config.max_attempts = None;
        self
    }

    /// Upper bound of the random sleep between attempts
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.retry_backoff_ms = backoff.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    /// Isolation level of the owner lookup done before the main transaction
    pub fn fast_path_isolation(mut self, level: IsolationLevel) -> Self {
        self.config.fast_path_isolation = level;
        self
    }

    /// Build the allocator over `store`
    pub fn build<S: Store>(self, store: S) -> Result<Allocator<S>> {
        debug!("Building allocator: {:?}", self.config);
        Allocator::with_config(store, self.config)
    }
}

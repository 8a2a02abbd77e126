//! Core allocator implementation
//!
//! - [`block`]: CIDR block value type and buddy arithmetic
//! - [`record`]: persisted unit of a pool
//! - [`store`]: transactional store abstraction and its backends
//! - [`allocator`]: allocate/deallocate with split, merge and retries
//! - [`context`]: cancellation and deadlines

pub mod allocator;
pub mod block;
pub mod context;
pub mod record;
pub mod store;

pub use allocator::Allocator;
pub use block::AddressBlock;
pub use context::Context;
pub use record::{PoolId, Record};
pub use store::{IsolationLevel, MemoryStore, SqliteStore, Store, Transaction, TxOptions};

//! Buddy allocator over a transactional store
//!
//! Allocation finds the smallest free block that is large enough and splits it
//! in halves until it has the requested size. Every split leaves the upper half
//! behind as a new free record. Deallocation walks the other way, merging the
//! freed block with its buddy for as long as the buddy is free and unsplit.
//!
//! Each operation runs inside one serializable transaction. A commit conflict
//! or a uniqueness violation means another caller got there first; the whole
//! operation is then rerun from fresh reads. No state is carried from one
//! attempt to the next.
//!
//! Before the main transaction, an owner lookup at a weaker isolation level
//! makes repeated calls cheap. That lookup can miss a concurrent commit, so the
//! main transaction reads the owner again before it touches free blocks.

use crate::config::AllocatorConfig;
use crate::core::block::{AddressBlock, IPV6_BITS};
use crate::core::context::Context;
use crate::core::record::{PoolId, Record};
use crate::core::store::{Store, Transaction, TxOptions};
use crate::error::{PoolError, Result};
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Allocates and frees address blocks of pools kept in a [`Store`]
///
/// Holds no state between calls; all of it lives in the store.
#[derive(Debug)]
pub struct Allocator<S> {
    store: S,
    config: AllocatorConfig,
}

impl<S: Store> Allocator<S> {
    /// Create an allocator with the default configuration
    pub fn new(store: S) -> Self {
        Allocator {
            store,
            config: AllocatorConfig::default(),
        }
    }

    /// Create an allocator with a custom configuration
    pub fn with_config(store: S, config: AllocatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Allocator { store, config })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Allocate a `/prefix_len` block of `pool` to `owner`
    ///
    /// Calling this again for the same owner and size returns the same block
    /// without changing the store.
    ///
    /// # Errors
    ///
    /// - `OwnerSizeMismatch` if the owner already holds a block of another size
    /// - `PoolExhausted` if no free block is large enough
    /// - `Cancelled` / `DeadlineExceeded` if `ctx` ends first
    pub fn allocate(
        &self,
        ctx: &Context,
        pool: PoolId,
        prefix_len: u8,
        owner: &str,
    ) -> Result<AddressBlock> {
        validate_pool(pool)?;
        validate_owner(owner)?;
        if prefix_len > IPV6_BITS {
            return Err(PoolError::InvalidArgument(format!(
                "prefix length /{} exceeds {} bits",
                prefix_len, IPV6_BITS
            )));
        }

        let started = Instant::now();
        let block = self.retry(ctx, "allocate", |attempt| {
            debug!(pool, owner, attempt, "allocate /{}", prefix_len);
            self.try_allocate(ctx, pool, prefix_len, owner)
        })?;

        info!(pool, owner, "allocated {}", block);
        debug!(elapsed = ?started.elapsed(), "allocate finished");
        Ok(block)
    }

    /// Free the block allocated to `owner` and merge it with free buddies
    ///
    /// Returns the block the owner held, before any merging.
    ///
    /// # Errors
    ///
    /// - `NotAllocated` if the owner holds nothing in `pool`
    /// - `Cancelled` / `DeadlineExceeded` if `ctx` ends first
    pub fn deallocate(&self, ctx: &Context, pool: PoolId, owner: &str) -> Result<AddressBlock> {
        validate_pool(pool)?;
        validate_owner(owner)?;

        let started = Instant::now();
        let block = self.retry(ctx, "deallocate", |attempt| {
            debug!(pool, owner, attempt, "deallocate");
            self.try_deallocate(ctx, pool, owner)
        })?;

        info!(pool, owner, "deallocated {}", block);
        debug!(elapsed = ?started.elapsed(), "deallocate finished");
        Ok(block)
    }

    /// Look up the record allocated to `owner` at the fast-path isolation level
    ///
    /// The answer may miss a commit that is happening concurrently.
    pub fn find_allocated(&self, ctx: &Context, pool: PoolId, owner: &str) -> Result<Option<Record>> {
        ctx.check()?;
        validate_owner(owner)?;

        let mut tx = self
            .store
            .begin(TxOptions::read_only(self.config.fast_path_isolation))?;
        let result = tx.find_by_owner(pool, owner);
        finish(ctx, tx, result)
    }

    /// All records of `pool` ordered by address, read at the fast-path isolation level
    pub fn records(&self, ctx: &Context, pool: PoolId) -> Result<Vec<Record>> {
        ctx.check()?;

        let mut tx = self
            .store
            .begin(TxOptions::read_only(self.config.fast_path_isolation))?;
        let result = tx.list(pool);
        finish(ctx, tx, result)
    }

    /// Add `block` to `pool` as a free block
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `block` overlaps any record already in the pool.
    pub fn seed(&self, ctx: &Context, pool: PoolId, block: AddressBlock) -> Result<()> {
        validate_pool(pool)?;

        self.retry(ctx, "seed", |_| {
            let mut tx = self.store.begin(TxOptions::serializable())?;
            let result = seed_in(tx.as_mut(), pool, block);
            finish(ctx, tx, result)
        })?;

        info!(pool, "seeded {}", block);
        Ok(())
    }

    fn try_allocate(
        &self,
        ctx: &Context,
        pool: PoolId,
        prefix_len: u8,
        owner: &str,
    ) -> Result<AddressBlock> {
        if let Some(existing) = self.find_allocated(ctx, pool, owner)? {
            return same_size(&existing, prefix_len);
        }

        ctx.check()?;
        let mut tx = self.store.begin(TxOptions::serializable())?;
        let result = allocate_in(ctx, tx.as_mut(), pool, prefix_len, owner);
        finish(ctx, tx, result)
    }

    fn try_deallocate(&self, ctx: &Context, pool: PoolId, owner: &str) -> Result<AddressBlock> {
        if self.find_allocated(ctx, pool, owner)?.is_none() {
            return Err(not_allocated(pool, owner));
        }

        ctx.check()?;
        let mut tx = self.store.begin(TxOptions::serializable())?;
        let result = deallocate_in(ctx, tx.as_mut(), pool, owner);
        finish(ctx, tx, result)
    }

    /// Run `attempt` until it succeeds, fails for real, or `ctx` ends
    fn retry<T>(
        &self,
        ctx: &Context,
        operation: &str,
        mut attempt: impl FnMut(u32) -> Result<T>,
    ) -> Result<T> {
        let mut attempts = 0u32;
        loop {
            ctx.check()?;
            attempts += 1;

            match attempt(attempts) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_recoverable() => {
                    debug!(
                        attempt = attempts,
                        "{}: retrying on expected concurrency error: {}", operation, e
                    );
                    if let Some(max) = self.config.max_attempts {
                        if attempts >= max {
                            warn!("{}: giving up after {} attempts", operation, attempts);
                            return Err(PoolError::RetriesExhausted { attempts });
                        }
                    }
                    self.backoff(ctx);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sleep a random time up to the configured backoff, never past the deadline
    fn backoff(&self, ctx: &Context) {
        let max_ms = self.config.retry_backoff_ms;
        if max_ms == 0 {
            return;
        }

        let mut pause = Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms));
        if let Some(deadline) = ctx.deadline() {
            pause = pause.min(deadline.saturating_duration_since(Instant::now()));
        }
        if !pause.is_zero() {
            std::thread::sleep(pause);
        }
    }
}

/// Main allocation path, inside a serializable transaction
fn allocate_in(
    ctx: &Context,
    tx: &mut dyn Transaction,
    pool: PoolId,
    prefix_len: u8,
    owner: &str,
) -> Result<AddressBlock> {
    // The fast path may have raced a concurrent allocation for this owner
    if let Some(existing) = tx.find_by_owner(pool, owner)? {
        return same_size(&existing, prefix_len);
    }

    let found = tx
        .find_smallest_free(pool, prefix_len)?
        .ok_or(PoolError::PoolExhausted { pool, prefix_len })?;

    if found.block.prefix_len() > prefix_len
        || prefix_len > found.block.max_prefix_len()
        || !found.is_free()
    {
        return Err(PoolError::Internal(format!(
            "store returned {} (owner {:?}) for a free /{} request",
            found.block,
            found.owner_str(),
            prefix_len
        )));
    }

    // Split down to the requested size, keeping the lower half each time
    let original = found.block;
    let mut candidate = original;
    let mut staged = Vec::new();
    while candidate.prefix_len() < prefix_len {
        staged.push(Record::free(pool, candidate.upper_half()?));
        candidate = candidate.lower_half()?;
    }

    ctx.check()?;
    let assigned = Record::allocated(pool, candidate, owner);
    if candidate == original {
        tx.update(&assigned)?;
    } else {
        debug!(
            pool,
            "splitting {} into {} free halves down to {}",
            original,
            staged.len(),
            candidate
        );
        tx.delete(pool, &original)?;
        staged.push(assigned);
        tx.insert_many(&staged)?;
    }

    Ok(candidate)
}

/// Main deallocation path, inside a serializable transaction
fn deallocate_in(
    ctx: &Context,
    tx: &mut dyn Transaction,
    pool: PoolId,
    owner: &str,
) -> Result<AddressBlock> {
    let record = tx
        .find_by_owner(pool, owner)?
        .ok_or_else(|| not_allocated(pool, owner))?;

    let freed = record.block;
    // `current` is the merged block so far, `stored` the record that still covers it
    let mut current = freed;
    let mut stored = freed;
    let mut merges = 0u32;

    while current.prefix_len() > 0 {
        ctx.check()?;
        let buddy = current.buddy()?;

        match tx.get(pool, &buddy)? {
            // Buddy space is split into smaller blocks
            None => break,
            Some(record) if !record.is_free() => break,
            Some(_) => {}
        }

        if current.is_lower() {
            tx.delete(pool, &buddy)?;
        } else {
            tx.delete(pool, &stored)?;
            current = buddy;
            stored = buddy;
        }
        current = current.parent()?;
        merges += 1;
    }

    if merges > 0 {
        debug!(pool, "merged {} into {} after {} merges", freed, current, merges);
    }

    tx.delete(pool, &stored)?;
    tx.insert_many(&[Record::free(pool, current)])?;

    Ok(freed)
}

fn seed_in(tx: &mut dyn Transaction, pool: PoolId, block: AddressBlock) -> Result<()> {
    if let Some(clash) = tx.list(pool)?.into_iter().find(|r| r.block.overlaps(&block)) {
        return Err(PoolError::InvalidArgument(format!(
            "{} overlaps existing block {} of pool {}",
            block, clash.block, pool
        )));
    }
    tx.insert_many(&[Record::free(pool, block)])
}

/// Commit on success, roll back on failure or if `ctx` ended in the meantime
fn finish<T>(ctx: &Context, tx: Box<dyn Transaction + '_>, result: Result<T>) -> Result<T> {
    let value = match result.and_then(|value| ctx.check().map(|()| value)) {
        Ok(value) => value,
        Err(e) => {
            if let Err(rollback_err) = tx.rollback() {
                error!("Error rolling back transaction: {}", rollback_err);
            }
            return Err(e);
        }
    };

    tx.commit()?;
    Ok(value)
}

fn same_size(existing: &Record, prefix_len: u8) -> Result<AddressBlock> {
    if existing.block.prefix_len() != prefix_len {
        return Err(PoolError::OwnerSizeMismatch {
            owner: existing.owner_str().to_string(),
            existing: existing.block.prefix_len(),
            requested: prefix_len,
        });
    }
    Ok(existing.block)
}

fn not_allocated(pool: PoolId, owner: &str) -> PoolError {
    PoolError::NotAllocated {
        pool,
        owner: owner.to_string(),
    }
}

fn validate_pool(pool: PoolId) -> Result<()> {
    if pool == 0 {
        return Err(PoolError::InvalidArgument(
            "pool id must be positive".to_string(),
        ));
    }
    Ok(())
}

fn validate_owner(owner: &str) -> Result<()> {
    if owner.is_empty() {
        return Err(PoolError::InvalidArgument(
            "owner must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::{IsolationLevel, MemoryStore};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn block(s: &str) -> AddressBlock {
        AddressBlock::parse(s).unwrap()
    }

    fn quiet_config() -> AllocatorConfig {
        AllocatorConfig {
            retry_backoff_ms: 0,
            ..AllocatorConfig::default()
        }
    }

    fn seeded(pool: PoolId, root: &str) -> Allocator<MemoryStore> {
        let alloc = Allocator::with_config(MemoryStore::new(), quiet_config()).unwrap();
        alloc.seed(&Context::background(), pool, block(root)).unwrap();
        alloc
    }

    fn layout(alloc: &Allocator<MemoryStore>, pool: PoolId) -> Vec<(String, String)> {
        alloc
            .records(&Context::background(), pool)
            .unwrap()
            .into_iter()
            .map(|r| (r.block.to_string(), r.owner_str().to_string()))
            .collect()
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(b, o)| (b.to_string(), o.to_string()))
            .collect()
    }

    #[test]
    fn test_split_chain() {
        let alloc = seeded(1, "10.0.0.0/16");
        let ctx = Context::background();

        let a = alloc.allocate(&ctx, 1, 18, "A").unwrap();
        assert_eq!(a, block("10.0.0.0/18"));
        assert_eq!(
            layout(&alloc, 1),
            pairs(&[
                ("10.0.0.0/18", "A"),
                ("10.0.64.0/18", ""),
                ("10.0.128.0/17", ""),
            ])
        );

        let b = alloc.allocate(&ctx, 1, 18, "B").unwrap();
        assert_eq!(b, block("10.0.64.0/18"));
    }

    #[test]
    fn test_full_remerge() {
        let alloc = seeded(1, "10.0.0.0/16");
        let ctx = Context::background();

        alloc.allocate(&ctx, 1, 18, "A").unwrap();
        alloc.allocate(&ctx, 1, 18, "B").unwrap();

        assert_eq!(alloc.deallocate(&ctx, 1, "A").unwrap(), block("10.0.0.0/18"));
        // B still blocks the merge
        assert_eq!(
            layout(&alloc, 1),
            pairs(&[
                ("10.0.0.0/18", ""),
                ("10.0.64.0/18", "B"),
                ("10.0.128.0/17", ""),
            ])
        );

        assert_eq!(alloc.deallocate(&ctx, 1, "B").unwrap(), block("10.0.64.0/18"));
        assert_eq!(layout(&alloc, 1), pairs(&[("10.0.0.0/16", "")]));
    }

    #[test]
    fn test_exact_size_updates_in_place() {
        let alloc = seeded(1, "10.0.0.0/24");
        let ctx = Context::background();

        let a = alloc.allocate(&ctx, 1, 24, "A").unwrap();
        assert_eq!(a, block("10.0.0.0/24"));
        assert_eq!(layout(&alloc, 1), pairs(&[("10.0.0.0/24", "A")]));

        // Nothing to merge with: the block simply becomes free again
        alloc.deallocate(&ctx, 1, "A").unwrap();
        assert_eq!(layout(&alloc, 1), pairs(&[("10.0.0.0/24", "")]));
    }

    #[test]
    fn test_idempotent_allocation() {
        let alloc = seeded(1, "10.0.0.0/16");
        let ctx = Context::background();

        let first = alloc.allocate(&ctx, 1, 20, "X").unwrap();
        let commits = alloc.store().commit_count();
        let before = alloc.store().snapshot();

        let second = alloc.allocate(&ctx, 1, 20, "X").unwrap();
        assert_eq!(first, second);
        assert_eq!(alloc.store().commit_count(), commits);
        assert_eq!(alloc.store().snapshot(), before);
    }

    #[test]
    fn test_owner_size_mismatch() {
        let alloc = seeded(1, "10.0.0.0/16");
        let ctx = Context::background();

        alloc.allocate(&ctx, 1, 20, "X").unwrap();
        let err = alloc.allocate(&ctx, 1, 22, "X").unwrap_err();
        assert_eq!(
            err,
            PoolError::OwnerSizeMismatch {
                owner: "X".to_string(),
                existing: 20,
                requested: 22,
            }
        );
        assert!(err.is_expected());
    }

    #[test]
    fn test_exhaustion_leaves_store_unchanged() {
        let alloc = seeded(1, "10.0.0.0/16");
        let ctx = Context::background();
        alloc.allocate(&ctx, 1, 17, "A").unwrap();
        let before = alloc.store().snapshot();

        let err = alloc.allocate(&ctx, 1, 16, "B").unwrap_err();
        assert_eq!(
            err,
            PoolError::PoolExhausted {
                pool: 1,
                prefix_len: 16
            }
        );
        assert_eq!(alloc.store().snapshot(), before);

        // An unknown pool has nothing to give either
        assert!(matches!(
            alloc.allocate(&ctx, 2, 24, "B"),
            Err(PoolError::PoolExhausted { pool: 2, .. })
        ));
    }

    #[test]
    fn test_deallocate_unknown_owner() {
        let alloc = seeded(1, "10.0.0.0/16");
        let ctx = Context::background();
        let before = alloc.store().snapshot();

        let err = alloc.deallocate(&ctx, 1, "nobody").unwrap_err();
        assert_eq!(
            err,
            PoolError::NotAllocated {
                pool: 1,
                owner: "nobody".to_string()
            }
        );
        assert_eq!(alloc.store().snapshot(), before);
    }

    #[test]
    fn test_argument_validation() {
        let alloc = seeded(1, "10.0.0.0/16");
        let ctx = Context::background();

        assert!(matches!(
            alloc.allocate(&ctx, 0, 24, "A"),
            Err(PoolError::InvalidArgument(_))
        ));
        assert!(matches!(
            alloc.allocate(&ctx, 1, 24, ""),
            Err(PoolError::InvalidArgument(_))
        ));
        assert!(matches!(
            alloc.allocate(&ctx, 1, 129, "A"),
            Err(PoolError::InvalidArgument(_))
        ));
        assert!(matches!(
            alloc.deallocate(&ctx, 1, ""),
            Err(PoolError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_request_wider_than_family() {
        // No IPv4 block can hold a /64
        let alloc = seeded(1, "10.0.0.0/16");
        let ctx = Context::background();
        let before = alloc.store().snapshot();

        assert_eq!(
            alloc.allocate(&ctx, 1, 64, "A"),
            Err(PoolError::PoolExhausted { pool: 1, prefix_len: 64 })
        );
        assert_eq!(alloc.store().snapshot(), before);

        // A mixed pool serves each request from a family wide enough for it
        alloc.seed(&ctx, 1, block("2001:db8::/48")).unwrap();
        assert_eq!(alloc.allocate(&ctx, 1, 64, "v6").unwrap(), block("2001:db8::/64"));
        assert_eq!(alloc.allocate(&ctx, 1, 24, "v4").unwrap(), block("10.0.0.0/24"));
    }

    #[test]
    fn test_single_address_and_ipv6() {
        let alloc = seeded(1, "10.0.0.0/30");
        let ctx = Context::background();
        assert_eq!(alloc.allocate(&ctx, 1, 32, "host").unwrap(), block("10.0.0.0/32"));

        let alloc = seeded(6, "2001:db8::/48");
        let net = alloc.allocate(&ctx, 6, 64, "net").unwrap();
        assert_eq!(net, block("2001:db8::/64"));
        assert_eq!(alloc.records(&ctx, 6).unwrap().len(), 17);

        alloc.deallocate(&ctx, 6, "net").unwrap();
        assert_eq!(layout(&alloc, 6), pairs(&[("2001:db8::/48", "")]));
    }

    #[test]
    fn test_whole_address_space() {
        let alloc = seeded(1, "0.0.0.0/0");
        let ctx = Context::background();

        alloc.allocate(&ctx, 1, 1, "low").unwrap();
        alloc.allocate(&ctx, 1, 1, "high").unwrap();
        alloc.deallocate(&ctx, 1, "low").unwrap();
        alloc.deallocate(&ctx, 1, "high").unwrap();

        // Merging stops at /0, which has no buddy
        assert_eq!(layout(&alloc, 1), pairs(&[("0.0.0.0/0", "")]));
    }

    #[test]
    fn test_seed_rejects_overlap() {
        let alloc = seeded(1, "10.0.0.0/16");
        let ctx = Context::background();

        assert!(matches!(
            alloc.seed(&ctx, 1, block("10.0.128.0/17")),
            Err(PoolError::InvalidArgument(_))
        ));
        assert!(matches!(
            alloc.seed(&ctx, 1, block("10.0.0.0/8")),
            Err(PoolError::InvalidArgument(_))
        ));

        // Disjoint blocks and other pools are fine
        alloc.seed(&ctx, 1, block("10.1.0.0/16")).unwrap();
        alloc.seed(&ctx, 2, block("10.0.0.0/16")).unwrap();
    }

    #[test]
    fn test_cancelled_context() {
        let alloc = seeded(1, "10.0.0.0/16");
        let ctx = Context::background();
        ctx.cancel();
        let before = alloc.store().snapshot();

        assert_eq!(alloc.allocate(&ctx, 1, 24, "A"), Err(PoolError::Cancelled));
        assert_eq!(alloc.store().snapshot(), before);
    }

    /// Fails the first `failures` commits with a serialization conflict
    struct ConflictingStore {
        inner: MemoryStore,
        failures: AtomicU32,
        commits: AtomicU32,
        /// Cancelled when a conflict is injected
        cancel_on_conflict: Option<Context>,
    }

    impl ConflictingStore {
        fn new(inner: MemoryStore, failures: u32) -> Self {
            ConflictingStore {
                inner,
                failures: AtomicU32::new(failures),
                commits: AtomicU32::new(0),
                cancel_on_conflict: None,
            }
        }
    }

    struct ConflictingTransaction<'a> {
        inner: Box<dyn Transaction + 'a>,
        store: &'a ConflictingStore,
        writable: bool,
    }

    impl Store for ConflictingStore {
        fn begin(&self, options: TxOptions) -> Result<Box<dyn Transaction + '_>> {
            Ok(Box::new(ConflictingTransaction {
                inner: self.inner.begin(options)?,
                store: self,
                writable: !options.read_only,
            }))
        }
    }

    impl Transaction for ConflictingTransaction<'_> {
        fn find_by_owner(&mut self, pool: PoolId, owner: &str) -> Result<Option<Record>> {
            self.inner.find_by_owner(pool, owner)
        }

        fn find_smallest_free(&mut self, pool: PoolId, min: u8) -> Result<Option<Record>> {
            self.inner.find_smallest_free(pool, min)
        }

        fn get(&mut self, pool: PoolId, block: &AddressBlock) -> Result<Option<Record>> {
            self.inner.get(pool, block)
        }

        fn update(&mut self, record: &Record) -> Result<()> {
            self.inner.update(record)
        }

        fn delete(&mut self, pool: PoolId, block: &AddressBlock) -> Result<()> {
            self.inner.delete(pool, block)
        }

        fn insert_many(&mut self, records: &[Record]) -> Result<()> {
            self.inner.insert_many(records)
        }

        fn list(&mut self, pool: PoolId) -> Result<Vec<Record>> {
            self.inner.list(pool)
        }

        fn commit(self: Box<Self>) -> Result<()> {
            let this = *self;
            if this.writable {
                this.store.commits.fetch_add(1, Ordering::SeqCst);
                let left = this.store.failures.load(Ordering::SeqCst);
                if left > 0 {
                    this.store.failures.store(left - 1, Ordering::SeqCst);
                    if let Some(ctx) = &this.store.cancel_on_conflict {
                        ctx.cancel();
                    }
                    this.inner.rollback()?;
                    return Err(PoolError::SerializationConflict("injected".to_string()));
                }
            }
            this.inner.commit()
        }

        fn rollback(self: Box<Self>) -> Result<()> {
            self.inner.rollback()
        }
    }

    #[test]
    fn test_cancel_between_attempts() {
        let ctx = Context::background();
        let mut store = ConflictingStore::new(seeded_memory("10.0.0.0/16"), 5);
        store.cancel_on_conflict = Some(ctx.clone());
        let alloc = Allocator::with_config(store, quiet_config()).unwrap();

        assert_eq!(alloc.allocate(&ctx, 1, 24, "A"), Err(PoolError::Cancelled));
        // The conflict was not followed by another attempt
        assert_eq!(alloc.store().commits.load(Ordering::SeqCst), 1);
        assert_eq!(alloc.store().failures.load(Ordering::SeqCst), 4);
        assert_eq!(
            alloc.store().inner.snapshot(),
            vec![Record::free(1, block("10.0.0.0/16"))]
        );
    }

    #[test]
    fn test_cancel_inside_open_transaction() {
        // Cancels as soon as the writing transaction is opened
        struct CancellingStore {
            inner: MemoryStore,
            ctx: Context,
        }

        impl Store for CancellingStore {
            fn begin(&self, options: TxOptions) -> Result<Box<dyn Transaction + '_>> {
                if !options.read_only {
                    self.ctx.cancel();
                }
                self.inner.begin(options)
            }
        }

        let ctx = Context::background();
        let store = CancellingStore {
            inner: seeded_memory("10.0.0.0/16"),
            ctx: ctx.clone(),
        };
        let alloc = Allocator::with_config(store, quiet_config()).unwrap();
        let before = alloc.store().inner.snapshot();
        let commits = alloc.store().inner.commit_count();

        assert_eq!(alloc.allocate(&ctx, 1, 24, "A"), Err(PoolError::Cancelled));
        assert_eq!(alloc.store().inner.snapshot(), before);
        assert_eq!(alloc.store().inner.commit_count(), commits);
    }

    fn seeded_memory(root: &str) -> MemoryStore {
        let store = MemoryStore::new();
        let mut tx = store.begin(TxOptions::serializable()).unwrap();
        tx.insert_many(&[Record::free(1, block(root))]).unwrap();
        tx.commit().unwrap();
        store
    }

    #[test]
    fn test_retries_after_conflicts() {
        let store = ConflictingStore::new(seeded_memory("10.0.0.0/16"), 3);
        let alloc = Allocator::with_config(store, quiet_config()).unwrap();
        let ctx = Context::background();

        let a = alloc.allocate(&ctx, 1, 24, "A").unwrap();
        assert_eq!(a, block("10.0.0.0/24"));
        assert_eq!(alloc.store().commits.load(Ordering::SeqCst), 4);

        // The conflicting attempts left nothing behind
        let owners: Vec<_> = alloc
            .store()
            .inner
            .snapshot()
            .into_iter()
            .filter_map(|r| r.owner)
            .collect();
        assert_eq!(owners, vec!["A".to_string()]);
    }

    #[test]
    fn test_retries_exhausted() {
        let store = ConflictingStore::new(seeded_memory("10.0.0.0/16"), 10);
        let config = AllocatorConfig {
            max_attempts: Some(3),
            ..quiet_config()
        };
        let alloc = Allocator::with_config(store, config).unwrap();

        let err = alloc
            .allocate(&Context::background(), 1, 24, "A")
            .unwrap_err();
        assert_eq!(err, PoolError::RetriesExhausted { attempts: 3 });
        assert_eq!(alloc.store().inner.snapshot().len(), 1);
    }

    #[test]
    fn test_deallocate_retries_after_conflicts() {
        let store = ConflictingStore::new(seeded_memory("10.0.0.0/16"), 0);
        let alloc = Allocator::with_config(store, quiet_config()).unwrap();
        let ctx = Context::background();
        alloc.allocate(&ctx, 1, 24, "A").unwrap();

        alloc.store().failures.store(2, Ordering::SeqCst);
        assert_eq!(alloc.deallocate(&ctx, 1, "A").unwrap(), block("10.0.0.0/24"));
        assert_eq!(
            alloc.store().inner.snapshot(),
            vec![Record::free(1, block("10.0.0.0/16"))]
        );
    }

    #[test]
    fn test_stale_fast_path_is_rechecked() {
        // A fast path that never sees anything still cannot double-allocate
        struct BlindStore {
            real: MemoryStore,
            empty: MemoryStore,
        }

        impl Store for BlindStore {
            fn begin(&self, options: TxOptions) -> Result<Box<dyn Transaction + '_>> {
                if options.read_only {
                    return self.empty.begin(options);
                }
                self.real.begin(options)
            }
        }

        let store = BlindStore {
            real: seeded_memory("10.0.0.0/16"),
            empty: MemoryStore::new(),
        };
        let alloc = Allocator::with_config(store, quiet_config()).unwrap();
        let ctx = Context::background();

        let first = alloc.allocate(&ctx, 1, 24, "A").unwrap();
        let second = alloc.allocate(&ctx, 1, 24, "A").unwrap();
        assert_eq!(first, second);
        assert!(matches!(
            alloc.allocate(&ctx, 1, 20, "A"),
            Err(PoolError::OwnerSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_broken_store_contract_is_internal_error() {
        // Returns a block smaller than requested
        struct LyingStore(MemoryStore);

        struct LyingTransaction<'a>(Box<dyn Transaction + 'a>);

        impl Store for LyingStore {
            fn begin(&self, options: TxOptions) -> Result<Box<dyn Transaction + '_>> {
                Ok(Box::new(LyingTransaction(self.0.begin(options)?)))
            }
        }

        impl Transaction for LyingTransaction<'_> {
            fn find_by_owner(&mut self, pool: PoolId, owner: &str) -> Result<Option<Record>> {
                self.0.find_by_owner(pool, owner)
            }
            fn find_smallest_free(&mut self, pool: PoolId, _min: u8) -> Result<Option<Record>> {
                Ok(Some(Record::free(pool, block("10.0.0.0/30"))))
            }
            fn get(&mut self, pool: PoolId, block: &AddressBlock) -> Result<Option<Record>> {
                self.0.get(pool, block)
            }
            fn update(&mut self, record: &Record) -> Result<()> {
                self.0.update(record)
            }
            fn delete(&mut self, pool: PoolId, block: &AddressBlock) -> Result<()> {
                self.0.delete(pool, block)
            }
            fn insert_many(&mut self, records: &[Record]) -> Result<()> {
                self.0.insert_many(records)
            }
            fn list(&mut self, pool: PoolId) -> Result<Vec<Record>> {
                self.0.list(pool)
            }
            fn commit(self: Box<Self>) -> Result<()> {
                self.0.commit()
            }
            fn rollback(self: Box<Self>) -> Result<()> {
                self.0.rollback()
            }
        }

        let alloc = Allocator::new(LyingStore(MemoryStore::new()));
        let err = alloc
            .allocate(&Context::background(), 1, 24, "A")
            .unwrap_err();
        assert!(matches!(err, PoolError::Internal(_)));
        assert!(alloc.store().0.snapshot().is_empty());
    }

    #[test]
    fn test_find_allocated_and_records() {
        let alloc = seeded(1, "10.0.0.0/16");
        let ctx = Context::background();
        alloc.allocate(&ctx, 1, 24, "A").unwrap();

        let record = alloc.find_allocated(&ctx, 1, "A").unwrap().unwrap();
        assert_eq!(record.block, block("10.0.0.0/24"));
        assert!(alloc.find_allocated(&ctx, 1, "B").unwrap().is_none());

        // /16 split to /24 leaves eight free upper halves plus the allocation
        assert_eq!(alloc.records(&ctx, 1).unwrap().len(), 9);
        assert_eq!(
            alloc.config().fast_path_isolation,
            IsolationLevel::ReadUncommitted
        );
    }
}

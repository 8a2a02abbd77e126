//! In-memory record store
//!
//! All records live in one `BTreeMap` behind a mutex. Transactions buffer their
//! writes in an overlay and an operation log; reads see committed state with the
//! overlay applied on top.
//!
//! Serializable commits use optimistic validation at pool granularity: every
//! pool a transaction read or wrote must not have been changed by another commit
//! since the transaction began. Commits at weaker isolation levels skip that
//! check but still replay their operation log against current state, so
//! uniqueness and "row must exist" rules hold at commit time.

use crate::core::block::AddressBlock;
use crate::core::record::{PoolId, Record};
use crate::core::store::{
    require_owner, require_writable, IsolationLevel, Store, Transaction, TxOptions,
};
use crate::error::{PoolError, Result};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

type Key = (PoolId, AddressBlock);

#[derive(Debug, Default)]
struct Shared {
    /// Committed records; value is the owner (None if free)
    records: BTreeMap<Key, Option<String>>,

    /// Sequence number of the last commit that wrote anything
    commit_seq: u64,

    /// Sequence number of the last commit that wrote to each pool
    pool_versions: HashMap<PoolId, u64>,
}

/// In-memory store
///
/// Cloning is cheap and yields a handle to the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed records of every pool, ordered by pool then address
    pub fn snapshot(&self) -> Vec<Record> {
        let shared = self.shared.lock();
        shared
            .records
            .iter()
            .map(|(&(pool, block), owner)| Record {
                pool,
                block,
                owner: owner.clone(),
            })
            .collect()
    }

    /// Number of commits that wrote at least one record
    pub fn commit_count(&self) -> u64 {
        self.shared.lock().commit_seq
    }
}

impl Store for MemoryStore {
    fn begin(&self, options: TxOptions) -> Result<Box<dyn Transaction + '_>> {
        let begin_seq = self.shared.lock().commit_seq;

        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            options,
            begin_seq,
            overlay: BTreeMap::new(),
            log: Vec::new(),
            touched: HashSet::new(),
        }))
    }
}

/// A buffered write, replayed at commit
#[derive(Debug, Clone)]
enum Op {
    Insert(Key, Option<String>),
    Update(Key, Option<String>),
    Delete(Key),
}

impl Op {
    fn pool(&self) -> PoolId {
        match self {
            Op::Insert((pool, _), _) | Op::Update((pool, _), _) | Op::Delete((pool, _)) => *pool,
        }
    }
}

struct MemoryTransaction {
    shared: Arc<Mutex<Shared>>,
    options: TxOptions,
    begin_seq: u64,

    /// Uncommitted writes; `None` marks a deleted record
    overlay: BTreeMap<Key, Option<Option<String>>>,

    /// Uncommitted writes in the order they were made
    log: Vec<Op>,

    /// Pools this transaction read or wrote
    touched: HashSet<PoolId>,
}

impl MemoryTransaction {
    /// Records of a pool as this transaction sees them
    fn pool_view(&self, shared: &Shared, pool: PoolId) -> BTreeMap<AddressBlock, Option<String>> {
        let mut view: BTreeMap<AddressBlock, Option<String>> = shared
            .records
            .iter()
            .filter(|((p, _), _)| *p == pool)
            .map(|((_, block), owner)| (*block, owner.clone()))
            .collect();

        for ((p, block), slot) in &self.overlay {
            if *p != pool {
                continue;
            }
            match slot {
                Some(owner) => {
                    view.insert(*block, owner.clone());
                }
                None => {
                    view.remove(block);
                }
            }
        }

        view
    }

    fn lookup(&self, shared: &Shared, key: &Key) -> Option<Option<String>> {
        match self.overlay.get(key) {
            Some(slot) => slot.clone(),
            None => shared.records.get(key).cloned(),
        }
    }

    fn owner_holder(
        &self,
        shared: &Shared,
        pool: PoolId,
        owner: &str,
    ) -> Option<AddressBlock> {
        self.pool_view(shared, pool)
            .into_iter()
            .find(|(_, o)| o.as_deref() == Some(owner))
            .map(|(block, _)| block)
    }

    fn write(&mut self, op: Op) {
        match &op {
            Op::Insert(key, owner) | Op::Update(key, owner) => {
                self.overlay.insert(*key, Some(owner.clone()));
            }
            Op::Delete(key) => {
                self.overlay.insert(*key, None);
            }
        }
        self.touched.insert(op.pool());
        self.log.push(op);
    }
}

impl Transaction for MemoryTransaction {
    fn find_by_owner(&mut self, pool: PoolId, owner: &str) -> Result<Option<Record>> {
        require_owner(owner)?;
        self.touched.insert(pool);

        let shared = self.shared.lock();
        Ok(self
            .owner_holder(&shared, pool, owner)
            .map(|block| Record::allocated(pool, block, owner)))
    }

    fn find_smallest_free(&mut self, pool: PoolId, min_prefix_len: u8) -> Result<Option<Record>> {
        self.touched.insert(pool);

        let shared = self.shared.lock();
        // Address order makes the lowest address win ties
        Ok(self
            .pool_view(&shared, pool)
            .into_iter()
            .filter(|(block, owner)| {
                owner.is_none()
                    && block.prefix_len() <= min_prefix_len
                    && block.max_prefix_len() >= min_prefix_len
            })
            .min_by_key(|(block, _)| Reverse(block.prefix_len()))
            .map(|(block, _)| Record::free(pool, block)))
    }

    fn get(&mut self, pool: PoolId, block: &AddressBlock) -> Result<Option<Record>> {
        self.touched.insert(pool);

        let shared = self.shared.lock();
        Ok(self.lookup(&shared, &(pool, *block)).map(|owner| Record {
            pool,
            block: *block,
            owner,
        }))
    }

    fn update(&mut self, record: &Record) -> Result<()> {
        require_writable(&self.options)?;
        let key = (record.pool, record.block);

        {
            let shared = self.shared.lock();
            if self.lookup(&shared, &key).is_none() {
                return Err(PoolError::ConflictOrMissing(format!(
                    "update of {} in pool {} affected no record",
                    record.block, record.pool
                )));
            }
            if let Some(owner) = &record.owner {
                if let Some(holder) = self.owner_holder(&shared, record.pool, owner) {
                    if holder != record.block {
                        return Err(PoolError::ConstraintViolation(format!(
                            "owner {:?} already holds {} in pool {}",
                            owner, holder, record.pool
                        )));
                    }
                }
            }
        }

        self.write(Op::Update(key, record.owner.clone()));
        Ok(())
    }

    fn delete(&mut self, pool: PoolId, block: &AddressBlock) -> Result<()> {
        require_writable(&self.options)?;
        let key = (pool, *block);

        {
            let shared = self.shared.lock();
            if self.lookup(&shared, &key).is_none() {
                return Err(PoolError::ConflictOrMissing(format!(
                    "delete of {} in pool {} affected no record",
                    block, pool
                )));
            }
        }

        self.write(Op::Delete(key));
        Ok(())
    }

    fn insert_many(&mut self, records: &[Record]) -> Result<()> {
        require_writable(&self.options)?;

        // Validate the whole batch before buffering any of it
        {
            let shared = self.shared.lock();
            let mut batch_keys = HashSet::new();
            let mut batch_owners = HashSet::new();

            for record in records {
                let key = (record.pool, record.block);
                if self.lookup(&shared, &key).is_some() || !batch_keys.insert(key) {
                    return Err(PoolError::ConstraintViolation(format!(
                        "{} already exists in pool {}",
                        record.block, record.pool
                    )));
                }

                if let Some(owner) = &record.owner {
                    if self.owner_holder(&shared, record.pool, owner).is_some()
                        || !batch_owners.insert((record.pool, owner.clone()))
                    {
                        return Err(PoolError::ConstraintViolation(format!(
                            "owner {:?} already holds a block in pool {}",
                            owner, record.pool
                        )));
                    }
                }
            }
        }

        for record in records {
            self.write(Op::Insert((record.pool, record.block), record.owner.clone()));
        }
        Ok(())
    }

    fn list(&mut self, pool: PoolId) -> Result<Vec<Record>> {
        self.touched.insert(pool);

        let shared = self.shared.lock();
        Ok(self
            .pool_view(&shared, pool)
            .into_iter()
            .map(|(block, owner)| Record { pool, block, owner })
            .collect())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let mut shared = self.shared.lock();

        if self.options.isolation == IsolationLevel::Serializable {
            for pool in &self.touched {
                let version = shared.pool_versions.get(pool).copied().unwrap_or(0);
                if version > self.begin_seq {
                    debug!(
                        "Serializable commit rejected: pool {} changed at seq {} after begin at seq {}",
                        pool, version, self.begin_seq
                    );
                    return Err(PoolError::SerializationConflict(format!(
                        "pool {} was modified by a concurrent transaction",
                        pool
                    )));
                }
            }
        }

        if self.log.is_empty() {
            return Ok(());
        }

        let mut next = shared.records.clone();
        for op in &self.log {
            replay(&mut next, op)?;
        }

        shared.records = next;
        shared.commit_seq += 1;
        let seq = shared.commit_seq;
        for op in &self.log {
            shared.pool_versions.insert(op.pool(), seq);
        }

        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Apply one buffered write to committed state, enforcing the store rules
fn replay(records: &mut BTreeMap<Key, Option<String>>, op: &Op) -> Result<()> {
    fn holder(
        records: &BTreeMap<Key, Option<String>>,
        pool: PoolId,
        owner: &str,
    ) -> Option<AddressBlock> {
        records
            .iter()
            .find(|((p, _), o)| *p == pool && o.as_deref() == Some(owner))
            .map(|((_, block), _)| *block)
    }

    match op {
        Op::Insert(key, owner) => {
            if records.contains_key(key) {
                return Err(PoolError::ConstraintViolation(format!(
                    "{} already exists in pool {}",
                    key.1, key.0
                )));
            }
            if let Some(owner) = owner {
                if holder(records, key.0, owner).is_some() {
                    return Err(PoolError::ConstraintViolation(format!(
                        "owner {:?} already holds a block in pool {}",
                        owner, key.0
                    )));
                }
            }
            records.insert(*key, owner.clone());
        }
        Op::Update(key, owner) => {
            if !records.contains_key(key) {
                return Err(PoolError::ConflictOrMissing(format!(
                    "update of {} in pool {} affected no record",
                    key.1, key.0
                )));
            }
            if let Some(owner) = owner {
                if let Some(block) = holder(records, key.0, owner) {
                    if block != key.1 {
                        return Err(PoolError::ConstraintViolation(format!(
                            "owner {:?} already holds {} in pool {}",
                            owner, block, key.0
                        )));
                    }
                }
            }
            records.insert(*key, owner.clone());
        }
        Op::Delete(key) => {
            if records.remove(key).is_none() {
                return Err(PoolError::ConflictOrMissing(format!(
                    "delete of {} in pool {} affected no record",
                    key.1, key.0
                )));
            }
        }
    }

    Ok(())
}

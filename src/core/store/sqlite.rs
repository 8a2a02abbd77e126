//! SQLite record store
//!
//! Records live in a single table keyed by `(pool_id, block)`, with a partial
//! unique index on `(pool_id, owner)` covering allocated records only.
//!
//! Serializable transactions start with `BEGIN IMMEDIATE`, which takes the
//! write lock up front; weaker ones use `BEGIN DEFERRED`. Lock contention that
//! outlasts the busy timeout surfaces as `SerializationConflict` and the
//! allocator retries.

use crate::core::block::AddressBlock;
use crate::core::record::{PoolId, Record};
use crate::core::store::{
    require_owner, require_writable, IsolationLevel, Store, Transaction, TxOptions,
};
use crate::error::{PoolError, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, trace};

/// Default time a connection waits on a locked database
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum number of idle connections kept for reuse
const MAX_IDLE_CONNECTIONS: usize = 16;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS address_block (
    pool_id    INTEGER NOT NULL,
    block      TEXT    NOT NULL,
    family     INTEGER NOT NULL,
    network    BLOB    NOT NULL,
    prefix_len INTEGER NOT NULL,
    owner      TEXT,
    PRIMARY KEY (pool_id, block)
);
CREATE UNIQUE INDEX IF NOT EXISTS address_block_owner
    ON address_block (pool_id, owner) WHERE owner IS NOT NULL;
CREATE INDEX IF NOT EXISTS address_block_free
    ON address_block (pool_id, prefix_len) WHERE owner IS NULL;
";

/// SQLite-backed store
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
    idle: Mutex<Vec<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file and make sure the schema exists
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Like [`SqliteStore::open`] with a custom busy timeout
    pub fn open_with_timeout<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Result<Self> {
        let store = SqliteStore {
            path: path.as_ref().to_path_buf(),
            busy_timeout,
            idle: Mutex::new(Vec::new()),
        };

        let conn = store.connect()?;
        // WAL keeps readers from blocking the single writer
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;
        debug!("SQLite journal mode: {}", mode);
        store.release(conn);

        debug!("Opened SQLite store at {:?}", store.path);
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        if let Some(conn) = self.idle.lock().pop() {
            return Ok(conn);
        }

        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    fn release(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
    }
}

impl Store for SqliteStore {
    fn begin(&self, options: TxOptions) -> Result<Box<dyn Transaction + '_>> {
        let conn = self.connect()?;

        let begin = match options.isolation {
            IsolationLevel::Serializable if !options.read_only => "BEGIN IMMEDIATE",
            _ => "BEGIN DEFERRED",
        };
        // A connection that failed to begin is dropped rather than reused
        conn.execute_batch(begin)?;

        Ok(Box::new(SqliteTransaction {
            store: self,
            conn: Some(conn),
            options,
        }))
    }
}

struct SqliteTransaction<'a> {
    store: &'a SqliteStore,

    /// Taken when the transaction finishes
    conn: Option<Connection>,

    options: TxOptions,
}

impl SqliteTransaction<'_> {
    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| PoolError::Internal("transaction already finished".to_string()))
    }

    /// Run a statement that must change exactly one row
    fn execute_one(&self, what: &str, sql: &str, params: impl rusqlite::Params) -> Result<()> {
        trace!(q = sql, "executing statement");
        let affected = self.conn()?.execute(sql, params)?;
        if affected != 1 {
            return Err(PoolError::ConflictOrMissing(format!(
                "{} affected {} rows (expected 1)",
                what, affected
            )));
        }
        Ok(())
    }

    fn finish(&mut self, statement: &str) -> Result<()> {
        let conn = self.conn.take().ok_or_else(|| {
            PoolError::Internal("transaction already finished".to_string())
        })?;

        match conn.execute_batch(statement) {
            Ok(()) => {
                self.store.release(conn);
                Ok(())
            }
            Err(e) => {
                if !conn.is_autocommit() {
                    if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                        error!("Error rolling back SQLite transaction: {}", rollback_err);
                    }
                }
                Err(e.into())
            }
        }
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            match conn.execute_batch("ROLLBACK") {
                Ok(()) => self.store.release(conn),
                Err(e) => error!("Error rolling back abandoned SQLite transaction: {}", e),
            }
        }
    }
}

impl Transaction for SqliteTransaction<'_> {
    fn find_by_owner(&mut self, pool: PoolId, owner: &str) -> Result<Option<Record>> {
        require_owner(owner)?;

        let sql = "SELECT block, owner FROM address_block WHERE pool_id = ?1 AND owner = ?2";
        trace!(q = sql, "doing query");
        self.conn()?
            .query_row(sql, params![pool, owner], |row| record_from_row(pool, row))
            .optional()?
            .transpose()
    }

    fn find_smallest_free(&mut self, pool: PoolId, min_prefix_len: u8) -> Result<Option<Record>> {
        let sql = "SELECT block, owner FROM address_block
            WHERE pool_id = ?1 AND owner IS NULL AND prefix_len <= ?2
              AND (CASE family WHEN 4 THEN 32 ELSE 128 END) >= ?2
            ORDER BY prefix_len DESC, family, network
            LIMIT 1";
        trace!(q = sql, "doing query");
        self.conn()?
            .query_row(sql, params![pool, min_prefix_len], |row| {
                record_from_row(pool, row)
            })
            .optional()?
            .transpose()
    }

    fn get(&mut self, pool: PoolId, block: &AddressBlock) -> Result<Option<Record>> {
        let sql = "SELECT block, owner FROM address_block WHERE pool_id = ?1 AND block = ?2";
        trace!(q = sql, "doing query");
        self.conn()?
            .query_row(sql, params![pool, block.to_string()], |row| {
                record_from_row(pool, row)
            })
            .optional()?
            .transpose()
    }

    fn update(&mut self, record: &Record) -> Result<()> {
        require_writable(&self.options)?;
        self.execute_one(
            &format!("update of {} in pool {}", record.block, record.pool),
            "UPDATE address_block SET owner = ?1 WHERE pool_id = ?2 AND block = ?3",
            params![record.owner, record.pool, record.block.to_string()],
        )
    }

    fn delete(&mut self, pool: PoolId, block: &AddressBlock) -> Result<()> {
        require_writable(&self.options)?;
        self.execute_one(
            &format!("delete of {} in pool {}", block, pool),
            "DELETE FROM address_block WHERE pool_id = ?1 AND block = ?2",
            params![pool, block.to_string()],
        )
    }

    fn insert_many(&mut self, records: &[Record]) -> Result<()> {
        require_writable(&self.options)?;
        if records.is_empty() {
            return Ok(());
        }

        let conn = self.conn()?;
        // Statement-level savepoint keeps a failed batch all-or-nothing
        conn.execute_batch("SAVEPOINT insert_many")?;

        let result = (|| -> Result<()> {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO address_block (pool_id, block, family, network, prefix_len, owner)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for record in records {
                let (family, network) = network_key(&record.block);
                stmt.execute(params![
                    record.pool,
                    record.block.to_string(),
                    family,
                    network,
                    record.block.prefix_len(),
                    record.owner,
                ])?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                conn.execute_batch("RELEASE insert_many")?;
                Ok(())
            }
            Err(e) => {
                conn.execute_batch("ROLLBACK TO insert_many; RELEASE insert_many")?;
                Err(e)
            }
        }
    }

    fn list(&mut self, pool: PoolId) -> Result<Vec<Record>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT block, owner FROM address_block WHERE pool_id = ?1
             ORDER BY family, network, prefix_len",
        )?;

        let rows = stmt.query_map(params![pool], |row| record_from_row(pool, row))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row??);
        }
        Ok(records)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.finish("COMMIT")
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK")
    }
}

/// Family and big-endian address bytes, used for address ordering
fn network_key(block: &AddressBlock) -> (u8, Vec<u8>) {
    match block.addr() {
        IpAddr::V4(a) => (4, a.octets().to_vec()),
        IpAddr::V6(a) => (6, a.octets().to_vec()),
    }
}

/// Decode a `(block, owner)` row
///
/// A block that fails to parse is reported as a store failure rather than a
/// SQLite conversion error so the caller sees what was stored.
fn record_from_row(pool: PoolId, row: &Row<'_>) -> rusqlite::Result<Result<Record>> {
    let text: String = row.get(0)?;
    let owner: Option<String> = row.get(1)?;

    Ok(AddressBlock::parse(&text)
        .map(|block| Record { pool, block, owner })
        .map_err(|e| PoolError::StoreFailure(format!("corrupt block {:?}: {}", text, e))))
}

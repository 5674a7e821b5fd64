//! Durable lease records in `SQLite`.
//!
//! A lease is a row `{task_id, owner_id, acquired_at_ms}` in a store
//! shared by every client instance of the session. The TTL is enforced at
//! read time: a row older than the acquisition TTL is treated as absent
//! regardless of its stored owner, so a crashed instance can never hold a
//! task hostage.
//!
//! All writes go through an `IMMEDIATE` transaction so the read-check-
//! write in [`LeaseStore::acquire`] is atomic against concurrent
//! instances sharing the same database file.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use tether_core::ids::{ClientId, TaskId};

use crate::errors::Result;

/// A stored lease record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    /// Task the lease covers.
    pub task_id: TaskId,
    /// Identity of the owning client instance.
    pub owner_id: ClientId,
    /// Acquisition (or last renewal) time, Unix ms.
    pub acquired_at_ms: i64,
}

impl Lease {
    /// Whether the lease has outlived `ttl_ms` as of `now_ms`.
    #[must_use]
    pub fn is_expired(&self, now_ms: i64, ttl_ms: u64) -> bool {
        now_ms.saturating_sub(self.acquired_at_ms) >= i64::try_from(ttl_ms).unwrap_or(i64::MAX)
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS leases (
    task_id        TEXT PRIMARY KEY,
    owner_id       TEXT NOT NULL,
    acquired_at_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS broadcasts (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    event     TEXT NOT NULL,
    payload   TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    sender_id TEXT NOT NULL
);
";

/// `SQLite`-backed lease store.
///
/// Shared by the coordinator and the storage-relay broadcast fallback
/// (both live in the same database file, like the browser's shared
/// origin storage).
pub struct LeaseStore {
    conn: Mutex<Connection>,
}

impl LeaseStore {
    /// Open (creating if needed) a store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        // Multiple instances share this file; let writers wait briefly
        // instead of failing on contention.
        conn.busy_timeout(std::time::Duration::from_millis(250))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (tests, single-instance sessions).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Read the lease for a task, expired or not.
    pub fn get(&self, task_id: &TaskId) -> Result<Option<Lease>> {
        let conn = self.conn.lock();
        let lease = conn
            .query_row(
                "SELECT task_id, owner_id, acquired_at_ms FROM leases WHERE task_id = ?1",
                params![task_id.as_str()],
                |row| {
                    Ok(Lease {
                        task_id: TaskId::from_string(row.get(0)?),
                        owner_id: ClientId::from_string(row.get(1)?),
                        acquired_at_ms: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(lease)
    }

    /// Atomically acquire (or re-acquire) the lease for `task_id`.
    ///
    /// Returns `true` and writes `{owner, now_ms}` if no lease exists,
    /// the existing lease is expired, or the caller already owns it.
    /// Returns `false` without writing if an unexpired lease is owned by
    /// a different identity.
    pub fn acquire(
        &self,
        task_id: &TaskId,
        owner: &ClientId,
        now_ms: i64,
        ttl_ms: u64,
    ) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = tx
            .query_row(
                "SELECT owner_id, acquired_at_ms FROM leases WHERE task_id = ?1",
                params![task_id.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        if let Some((holder, acquired_at_ms)) = existing {
            let fresh = now_ms.saturating_sub(acquired_at_ms)
                < i64::try_from(ttl_ms).unwrap_or(i64::MAX);
            if fresh && holder != owner.as_str() {
                tx.rollback()?;
                return Ok(false);
            }
        }

        let _ = tx.execute(
            "INSERT OR REPLACE INTO leases (task_id, owner_id, acquired_at_ms)
             VALUES (?1, ?2, ?3)",
            params![task_id.as_str(), owner.as_str(), now_ms],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Refresh the timestamp of a lease the caller still owns.
    ///
    /// Returns `false` (and writes nothing) if ownership was lost —
    /// expiry plus theft by another identity, or deletion by the sweep.
    pub fn renew(&self, task_id: &TaskId, owner: &ClientId, now_ms: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE leases SET acquired_at_ms = ?1 WHERE task_id = ?2 AND owner_id = ?3",
            params![now_ms, task_id.as_str(), owner.as_str()],
        )?;
        Ok(updated > 0)
    }

    /// Delete a lease the caller still owns.
    ///
    /// Returns `false` if the lease was already gone or stolen.
    pub fn delete_owned(&self, task_id: &TaskId, owner: &ClientId) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM leases WHERE task_id = ?1 AND owner_id = ?2",
            params![task_id.as_str(), owner.as_str()],
        )?;
        Ok(deleted > 0)
    }

    /// Delete every lease older than `cutoff_ms`, returning the count.
    ///
    /// Recovers from instances that closed without releasing.
    pub fn sweep_older_than(&self, cutoff_ms: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM leases WHERE acquired_at_ms < ?1",
            params![cutoff_ms],
        )?;
        Ok(deleted)
    }

    /// Run a closure with the raw connection (broadcast relay storage).
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock();
        Ok(f(&conn)?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

//! SQLite storage for the aggregator queues.
//!
//! A single connection behind a mutex. Serialization of mutating sequences
//! does not happen here; the query-group lock owns that (see
//! `txs::query_group`). The connection mutex only keeps individual statements
//! from interleaving.

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, Result as SqliteResult};

/// Table holding records believed immediately executable in nonce order.
pub const READY_TABLE: &str = "ready_txs";
/// Table holding records parked behind a nonce gap.
pub const FUTURE_TABLE: &str = "future_txs";

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &str) -> SqliteResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.create_tables()?;
        Ok(db)
    }

    pub fn in_memory() -> SqliteResult<Self> {
        Self::open(":memory:")
    }

    fn create_tables(&self) -> SqliteResult<()> {
        let conn = self.conn();

        // AUTOINCREMENT keeps ids strictly increasing even after deletes;
        // the id doubles as the batch-selection priority.
        for table in [READY_TABLE, FUTURE_TABLE] {
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        sender TEXT NOT NULL,
                        nonce INTEGER NOT NULL,
                        reward TEXT NOT NULL,
                        contract_address TEXT NOT NULL,
                        method_id TEXT NOT NULL,
                        encoded_params TEXT NOT NULL,
                        signature TEXT NOT NULL,
                        created_at TEXT NOT NULL
                    )"
                ),
                [],
            )?;
            conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS idx_{table}_sender_nonce \
                     ON {table}(sender, nonce)"
                ),
                [],
            )?;
        }

        Ok(())
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Open a transaction. Must be paired with `commit` or `rollback`; the
    /// query-group lock guarantees only one is open at a time.
    pub fn begin(&self) -> SqliteResult<()> {
        self.conn().execute_batch("BEGIN IMMEDIATE")
    }

    pub fn commit(&self) -> SqliteResult<()> {
        self.conn().execute_batch("COMMIT")
    }

    pub fn rollback(&self) -> SqliteResult<()> {
        self.conn().execute_batch("ROLLBACK")
    }
}

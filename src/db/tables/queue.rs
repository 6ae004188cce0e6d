//! Queue table operations.
//!
//! Ordered, indexed storage of pending records, keyed by sender+nonce. Each
//! table carries its own insertion sequence (`AUTOINCREMENT`): the id defines
//! batch-selection priority and is reassigned whenever a record is reinserted
//! or moved between tables.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Result as SqliteResult, Row};

use crate::db::Database;
use crate::txs::types::{TxRecord, TxSubmission};

const COLUMNS: &str =
    "id, sender, nonce, reward, contract_address, method_id, encoded_params, signature, created_at";

/// One ordered queue of pending records (`ready_txs` or `future_txs`).
pub struct QueueTable {
    db: Arc<Database>,
    table: &'static str,
}

fn record_from_row(row: &Row<'_>) -> SqliteResult<TxRecord> {
    let reward: String = row.get(3)?;
    let reward = reward
        .parse::<u128>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    let created_at: String = row.get(8)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?;

    Ok(TxRecord {
        id: row.get(0)?,
        sender: row.get(1)?,
        nonce: row.get::<_, i64>(2)? as u64,
        reward,
        contract_address: row.get(4)?,
        method_id: row.get(5)?,
        encoded_params: row.get(6)?,
        signature: row.get(7)?,
        created_at,
    })
}

impl QueueTable {
    pub fn new(db: Arc<Database>, table: &'static str) -> Self {
        Self { db, table }
    }

    pub fn count(&self) -> SqliteResult<u64> {
        let count: i64 = self.db.conn().query_row(
            &format!("SELECT COUNT(*) FROM {}", self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Insert a new record; the table assigns the next insertion id.
    pub fn add(&self, tx: &TxSubmission) -> SqliteResult<TxRecord> {
        self.insert(tx, Utc::now())
    }

    /// Reinsert an existing record under a fresh insertion id. Used when a
    /// record changes table or must move to the back of the priority order.
    pub fn readd(&self, rec: &TxRecord) -> SqliteResult<TxRecord> {
        self.insert(&rec.to_submission(), rec.created_at)
    }

    fn insert(&self, tx: &TxSubmission, created_at: DateTime<Utc>) -> SqliteResult<TxRecord> {
        let conn = self.db.conn();
        conn.execute(
            &format!(
                "INSERT INTO {} \
                 (sender, nonce, reward, contract_address, method_id, encoded_params, signature, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                self.table
            ),
            params![
                tx.sender,
                tx.nonce as i64,
                tx.reward.to_string(),
                tx.contract_address,
                tx.method_id,
                tx.encoded_params,
                tx.signature,
                created_at.to_rfc3339(),
            ],
        )?;

        Ok(TxRecord {
            id: conn.last_insert_rowid(),
            sender: tx.sender.clone(),
            nonce: tx.nonce,
            reward: tx.reward,
            contract_address: tx.contract_address.clone(),
            method_id: tx.method_id.clone(),
            encoded_params: tx.encoded_params.clone(),
            signature: tx.signature.clone(),
            created_at,
        })
    }

    /// Remove by id. No-op if already absent (races with batch execution).
    pub fn remove(&self, rec: &TxRecord) -> SqliteResult<()> {
        self.db.conn().execute(
            &format!("DELETE FROM {} WHERE id = ?1", self.table),
            params![rec.id],
        )?;
        Ok(())
    }

    /// Look up a record by sender+nonce. When duplicates exist (Future table
    /// only), the earliest-inserted one wins.
    pub fn find(&self, sender: &str, nonce: u64) -> SqliteResult<Option<TxRecord>> {
        self.db
            .conn()
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM {} WHERE sender = ?1 AND nonce = ?2 \
                     ORDER BY id ASC LIMIT 1",
                    self.table
                ),
                params![sender, nonce as i64],
                record_from_row,
            )
            .optional()
    }

    /// Sender-scoped page of records with nonce strictly greater than
    /// `after` (`None` starts from the sender's lowest nonce), ascending by
    /// nonce then insertion id.
    pub fn find_after(
        &self,
        sender: &str,
        after: Option<u64>,
        limit: usize,
    ) -> SqliteResult<Vec<TxRecord>> {
        let conn = self.db.conn();
        let mut out = Vec::new();
        match after {
            Some(nonce) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM {} WHERE sender = ?1 AND nonce > ?2 \
                     ORDER BY nonce ASC, id ASC LIMIT ?3",
                    self.table
                ))?;
                let rows =
                    stmt.query_map(params![sender, nonce as i64, limit as i64], record_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM {} WHERE sender = ?1 \
                     ORDER BY nonce ASC, id ASC LIMIT ?2",
                    self.table
                ))?;
                let rows = stmt.query_map(params![sender, limit as i64], record_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// One past the highest contiguous nonce this table holds for `sender`,
    /// counting from the sender's lowest stored nonce. `None` when the sender
    /// has no records here.
    pub fn next_nonce_of(&self, sender: &str) -> SqliteResult<Option<u64>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT nonce FROM {} WHERE sender = ?1 ORDER BY nonce ASC",
            self.table
        ))?;
        let rows = stmt.query_map(params![sender], |row| row.get::<_, i64>(0))?;

        let mut next: Option<u64> = None;
        for nonce in rows {
            let nonce = nonce? as u64;
            match next {
                None => next = Some(nonce + 1),
                Some(expected) if nonce == expected => next = Some(expected + 1),
                Some(_) => break,
            }
        }
        Ok(next)
    }

    /// Earliest-inserted records first, across all senders.
    pub fn highest_priority(&self, limit: usize) -> SqliteResult<Vec<TxRecord>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM {} ORDER BY id ASC LIMIT ?1",
            self.table
        ))?;
        let rows = stmt.query_map(params![limit as i64], record_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Bulk-evict every record with an insertion id below `id`. Returns the
    /// number of evicted records.
    pub fn clear_before_id(&self, id: i64) -> SqliteResult<u64> {
        let removed = self.db.conn().execute(
            &format!("DELETE FROM {} WHERE id < ?1", self.table),
            params![id],
        )?;
        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::READY_TABLE;

    fn table() -> QueueTable {
        let db = Arc::new(Database::in_memory().unwrap());
        QueueTable::new(db, READY_TABLE)
    }

    fn submission(sender: &str, nonce: u64, reward: u128) -> TxSubmission {
        TxSubmission {
            sender: sender.to_string(),
            nonce,
            reward,
            contract_address: "0xc0ffee".to_string(),
            method_id: "0xabcdef01".to_string(),
            encoded_params: "0x".to_string(),
            signature: "0xsig".to_string(),
        }
    }

    #[test]
    fn test_add_assigns_increasing_ids() {
        let table = table();
        let a = table.add(&submission("alice", 0, 1)).unwrap();
        let b = table.add(&submission("bob", 0, 1)).unwrap();
        assert!(b.id > a.id);
        assert_eq!(table.count().unwrap(), 2);
    }

    #[test]
    fn test_ids_never_reused_after_removal() {
        let table = table();
        let a = table.add(&submission("alice", 0, 1)).unwrap();
        table.remove(&a).unwrap();
        let b = table.add(&submission("alice", 0, 1)).unwrap();
        assert!(b.id > a.id);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let table = table();
        let rec = table.add(&submission("alice", 0, 1)).unwrap();
        table.remove(&rec).unwrap();
        table.remove(&rec).unwrap();
        assert_eq!(table.count().unwrap(), 0);
    }

    #[test]
    fn test_find_prefers_earliest_duplicate() {
        let table = table();
        let first = table.add(&submission("alice", 2, 5)).unwrap();
        table.add(&submission("alice", 2, 9)).unwrap();

        let found = table.find("alice", 2).unwrap().unwrap();
        assert_eq!(found.id, first.id);
        assert_eq!(found.reward, 5);
        assert!(table.find("alice", 3).unwrap().is_none());
    }

    #[test]
    fn test_find_after_is_sender_scoped_and_paginated() {
        let table = table();
        for nonce in 0..5 {
            table.add(&submission("alice", nonce, 1)).unwrap();
        }
        table.add(&submission("bob", 1, 1)).unwrap();

        let page = table.find_after("alice", Some(1), 2).unwrap();
        assert_eq!(
            page.iter().map(|r| r.nonce).collect::<Vec<_>>(),
            vec![2, 3]
        );

        let all = table.find_after("alice", None, 10).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].nonce, 0);
    }

    #[test]
    fn test_next_nonce_of_stops_at_gap() {
        let table = table();
        assert_eq!(table.next_nonce_of("alice").unwrap(), None);

        table.add(&submission("alice", 3, 1)).unwrap();
        table.add(&submission("alice", 4, 1)).unwrap();
        table.add(&submission("alice", 7, 1)).unwrap();

        assert_eq!(table.next_nonce_of("alice").unwrap(), Some(5));
    }

    #[test]
    fn test_highest_priority_is_insertion_order_across_senders() {
        let table = table();
        table.add(&submission("alice", 1, 1)).unwrap();
        table.add(&submission("bob", 0, 9)).unwrap();
        table.add(&submission("alice", 0, 1)).unwrap();

        let page = table.highest_priority(2).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].sender, "alice");
        assert_eq!(page[0].nonce, 1);
        assert_eq!(page[1].sender, "bob");
    }

    #[test]
    fn test_readd_moves_record_to_back_of_priority_order() {
        let table = table();
        let first = table.add(&submission("alice", 0, 1)).unwrap();
        table.add(&submission("bob", 0, 1)).unwrap();

        table.remove(&first).unwrap();
        let moved = table.readd(&first).unwrap();
        assert!(moved.id > first.id);
        assert_eq!(moved.created_at, first.created_at);

        let page = table.highest_priority(10).unwrap();
        assert_eq!(page.last().unwrap().sender, "alice");
    }

    #[test]
    fn test_clear_before_id() {
        let table = table();
        table.add(&submission("alice", 0, 1)).unwrap();
        table.add(&submission("alice", 1, 1)).unwrap();
        let keep = table.add(&submission("alice", 2, 1)).unwrap();

        let removed = table.clear_before_id(keep.id).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(table.count().unwrap(), 1);
        assert!(table.find("alice", 2).unwrap().is_some());
    }

    #[test]
    fn test_reward_roundtrips_beyond_u64() {
        let table = table();
        let big = u128::from(u64::MAX) * 1000;
        table.add(&submission("alice", 0, big)).unwrap();
        let found = table.find("alice", 0).unwrap().unwrap();
        assert_eq!(found.reward, big);
    }
}

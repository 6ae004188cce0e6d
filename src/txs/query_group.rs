//! Exclusive query groups.
//!
//! A query group is a sequence of queue-table mutations executed under one
//! named lock with transaction semantics: acquire → BEGIN → body → COMMIT on
//! success / ROLLBACK on error → release. One group runs at a time; this is
//! the sole concurrency-control mechanism in the aggregator. Every externally
//! observable change to the Ready/Future queues is produced inside a group.
//!
//! Locks live in a [`LockRegistry`] owned by the service and are created on
//! first use, one per key. No global singleton state.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::db::Database;
use crate::txs::types::TxServiceError;

/// Named-lock map with create-on-first-use semantics.
pub struct LockRegistry {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Get the lock registered under `key`, creating it on first use.
    /// Callers holding the returned `Arc` share one mutex per key.
    pub fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializes mutating sequences against one database.
pub struct QueryGroup {
    registry: LockRegistry,
    key: String,
    db: Arc<Database>,
}

impl QueryGroup {
    pub fn new(key: impl Into<String>, db: Arc<Database>) -> Self {
        Self {
            registry: LockRegistry::new(),
            key: key.into(),
            db,
        }
    }

    /// Run `body` as one atomic group. The body may await (the admission
    /// path validates against the chain while holding the lock; that is a
    /// documented throughput trade-off, not an accident).
    pub async fn run<T, F, Fut>(&self, body: F) -> Result<T, TxServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TxServiceError>>,
    {
        let lock = self.registry.lock_for(&self.key);
        let _guard = lock.lock().await;

        self.db.begin()?;
        match body().await {
            Ok(value) => {
                self.db.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.db.rollback() {
                    log::error!("[QueryGroup] rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    use crate::db::READY_TABLE;

    fn insert_row(db: &Database) -> rusqlite::Result<usize> {
        db.conn().execute(
            &format!(
                "INSERT INTO {READY_TABLE} \
                 (sender, nonce, reward, contract_address, method_id, encoded_params, signature, created_at) \
                 VALUES ('s', 0, '1', 'c', 'm', 'p', 'sig', 'now')"
            ),
            [],
        )
    }

    fn row_count(db: &Database) -> i64 {
        db.conn()
            .query_row(&format!("SELECT COUNT(*) FROM {READY_TABLE}"), [], |row| {
                row.get(0)
            })
            .unwrap()
    }

    #[test]
    fn test_lock_registry_returns_same_lock_per_key() {
        let registry = LockRegistry::new();
        let a = registry.lock_for("txs");
        let b = registry.lock_for("txs");
        let other = registry.lock_for("other");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[tokio::test]
    async fn test_commit_on_success() {
        let db = Arc::new(Database::in_memory().unwrap());
        let group = QueryGroup::new("txs", db.clone());

        group
            .run(|| async {
                insert_row(&db)?;
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(row_count(&db), 1);
    }

    #[tokio::test]
    async fn test_rollback_on_error() {
        let db = Arc::new(Database::in_memory().unwrap());
        let group = QueryGroup::new("txs", db.clone());

        let result: Result<(), TxServiceError> = group
            .run(|| async {
                insert_row(&db)?;
                Err(TxServiceError::Wallet(crate::wallet::WalletError::Rpc(
                    "boom".to_string(),
                )))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(row_count(&db), 0);
    }

    #[tokio::test]
    async fn test_groups_do_not_interleave() {
        let db = Arc::new(Database::in_memory().unwrap());
        let group = Arc::new(QueryGroup::new("txs", db.clone()));
        let active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let group = group.clone();
            let active = active.clone();
            handles.push(tokio::spawn(async move {
                group
                    .run(|| async {
                        let now = active.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(now, 0, "two query groups ran concurrently");
                        sleep(Duration::from_millis(5)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }
}

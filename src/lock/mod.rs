//! # Lock Layer
//!
//! Creates, queries, and deletes `ReplicaLock`/`DatasetLock` rows and
//! maintains the replica `lock_cnt`/`tombstone` invariants (I6, I7) in
//! the same transaction as every lock insert/delete — never a follow-up
//! query, per the component design note.

use crate::db::ConnectionPool;
use crate::error::LockError;
use crate::model::{LockState, ReplicaLock};
use chrono::Utc;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, LockError>;

pub struct LockStore {
    pool: ConnectionPool,
}

impl LockStore {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub async fn get_replica_locks(&self, scope: &str, name: &str) -> Result<Vec<ReplicaLock>> {
        let rows: Vec<ReplicaLockRow> = sqlx::query_as(
            "SELECT rule_id, rse_id, scope, name, account, state, bytes, created_at, updated_at
             FROM replica_locks WHERE scope = ? AND name = ?",
        )
        .bind(scope)
        .bind(name)
        .fetch_all(self.pool.inner())
        .await
        .map_err(|e| LockError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Inserts a `ReplicaLock` and increments the replica's `lock_cnt`,
    /// clearing its tombstone, in one transaction.
    pub async fn add_replica_lock(
        &self,
        rule_id: Uuid,
        rse_id: &str,
        scope: &str,
        name: &str,
        account: &str,
        state: LockState,
        bytes: Option<i64>,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin_for_update().await.map_err(LockError::Database)?;

        sqlx::query(
            "INSERT INTO replica_locks (rule_id, rse_id, scope, name, account, state, bytes, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(rule_id.to_string())
        .bind(rse_id)
        .bind(scope)
        .bind(name)
        .bind(account)
        .bind(state.as_str())
        .bind(bytes)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| LockError::Database(crate::db::pool::ConnectionPool::map_lock_error(e)))?;

        sqlx::query(
            "UPDATE rse_file_associations SET lock_cnt = lock_cnt + 1, tombstone = NULL, updated_at = ?
             WHERE rse_id = ? AND scope = ? AND name = ?",
        )
        .bind(now.to_rfc3339())
        .bind(rse_id)
        .bind(scope)
        .bind(name)
        .execute(&mut *tx)
        .await
        .map_err(|e| LockError::Database(crate::db::pool::ConnectionPool::map_lock_error(e)))?;

        tx.commit().await.map_err(|e| LockError::Database(crate::db::DatabaseError::ConnectionPool(e.to_string())))?;
        Ok(())
    }

    /// Deletes every `ReplicaLock` under `rule_id` and, for each one,
    /// decrements its replica's `lock_cnt` and sets the tombstone to now
    /// iff the count reached zero (I7), in one transaction per rule.
    pub async fn delete_locks_for_rule(&self, rule_id: Uuid) -> Result<u64> {
        let mut tx = self.pool.begin_for_update().await.map_err(LockError::Database)?;

        let locks: Vec<(String, String, String)> =
            sqlx::query_as("SELECT rse_id, scope, name FROM replica_locks WHERE rule_id = ?")
                .bind(rule_id.to_string())
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| LockError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

        let deleted = sqlx::query("DELETE FROM replica_locks WHERE rule_id = ?")
            .bind(rule_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| LockError::Database(crate::db::pool::ConnectionPool::map_lock_error(e)))?
            .rows_affected();

        let now = Utc::now().to_rfc3339();
        for (rse_id, scope, name) in locks {
            sqlx::query(
                "UPDATE rse_file_associations SET lock_cnt = lock_cnt - 1,
                 tombstone = CASE WHEN lock_cnt - 1 <= 0 THEN ? ELSE NULL END,
                 updated_at = ?
                 WHERE rse_id = ? AND scope = ? AND name = ?",
            )
            .bind(&now)
            .bind(&now)
            .bind(rse_id)
            .bind(scope)
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(|e| LockError::Database(crate::db::pool::ConnectionPool::map_lock_error(e)))?;
        }

        sqlx::query("DELETE FROM dataset_locks WHERE rule_id = ?")
            .bind(rule_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| LockError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

        tx.commit().await.map_err(|e| LockError::Database(crate::db::DatabaseError::ConnectionPool(e.to_string())))?;
        Ok(deleted)
    }

    /// All `(rse_id, scope, name)` currently locked under `rule_id`, for
    /// the reevaluator to diff against what's still reachable from the
    /// rule's root after a DETACH.
    pub async fn list_locks_for_rule(&self, rule_id: Uuid) -> Result<Vec<(String, String, String)>> {
        sqlx::query_as("SELECT rse_id, scope, name FROM replica_locks WHERE rule_id = ?")
            .bind(rule_id.to_string())
            .fetch_all(self.pool.inner())
            .await
            .map_err(|e| LockError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))
    }

    /// Deletes one `ReplicaLock` and applies the same `lock_cnt`/tombstone
    /// bookkeeping as [`delete_locks_for_rule`](Self::delete_locks_for_rule),
    /// scoped to a single replica instead of an entire rule.
    pub async fn delete_lock(&self, rule_id: Uuid, rse_id: &str, scope: &str, name: &str) -> Result<()> {
        let mut tx = self.pool.begin_for_update().await.map_err(LockError::Database)?;

        let deleted = sqlx::query("DELETE FROM replica_locks WHERE rule_id = ? AND rse_id = ? AND scope = ? AND name = ?")
            .bind(rule_id.to_string())
            .bind(rse_id)
            .bind(scope)
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(|e| LockError::Database(crate::db::pool::ConnectionPool::map_lock_error(e)))?
            .rows_affected();

        if deleted > 0 {
            let now = Utc::now().to_rfc3339();
            sqlx::query(
                "UPDATE rse_file_associations SET lock_cnt = lock_cnt - 1,
                 tombstone = CASE WHEN lock_cnt - 1 <= 0 THEN ? ELSE NULL END,
                 updated_at = ?
                 WHERE rse_id = ? AND scope = ? AND name = ?",
            )
            .bind(&now)
            .bind(&now)
            .bind(rse_id)
            .bind(scope)
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(|e| LockError::Database(crate::db::pool::ConnectionPool::map_lock_error(e)))?;
        }

        tx.commit().await.map_err(|e| LockError::Database(crate::db::DatabaseError::ConnectionPool(e.to_string())))?;
        Ok(())
    }

    /// Transition a lock's state, e.g. `WAITING -> OK` on a transfer
    /// callback or `WAITING -> STUCK` on permanent failure.
    pub async fn set_lock_state(
        &self,
        rule_id: Uuid,
        rse_id: &str,
        scope: &str,
        name: &str,
        state: LockState,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE replica_locks SET state = ?, updated_at = ? WHERE rule_id = ? AND rse_id = ? AND scope = ? AND name = ?",
        )
        .bind(state.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(rule_id.to_string())
        .bind(rse_id)
        .bind(scope)
        .bind(name)
        .execute(self.pool.inner())
        .await
        .map_err(|e| LockError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ReplicaLockRow {
    rule_id: String,
    rse_id: String,
    scope: String,
    name: String,
    account: String,
    state: String,
    bytes: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<ReplicaLockRow> for ReplicaLock {
    type Error = LockError;

    fn try_from(row: ReplicaLockRow) -> Result<Self> {
        let state = match row.state.as_str() {
            "WAITING" => LockState::Waiting,
            "OK" => LockState::Ok,
            "STUCK" => LockState::Stuck,
            other => {
                return Err(LockError::Database(crate::db::DatabaseError::QueryExecution(format!(
                    "unknown lock state: {other}"
                ))))
            }
        };
        Ok(ReplicaLock {
            rule_id: Uuid::parse_str(&row.rule_id).map_err(|e| {
                LockError::Database(crate::db::DatabaseError::QueryExecution(e.to_string()))
            })?,
            rse_id: row.rse_id,
            scope: row.scope,
            name: row.name,
            account: row.account,
            state,
            bytes: row.bytes,
            created_at: chrono::DateTime::parse_from_rfc3339(&row.created_at)
                .map_err(|e| LockError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?
                .with_timezone(&Utc),
            updated_at: chrono::DateTime::parse_from_rfc3339(&row.updated_at)
                .map_err(|e| LockError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?
                .with_timezone(&Utc),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{migrations, DatabaseConfig, MigrationManager};

    async fn test_pool() -> ConnectionPool {
        let pool = ConnectionPool::new(DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        let manager = MigrationManager::new(pool.clone());
        manager.init().await.unwrap();
        migrations::init_default_migrations(&manager);
        manager.run_pending().await.unwrap();
        pool
    }

    async fn seed_replica(pool: &ConnectionPool, rse_id: &str, scope: &str, name: &str) {
        sqlx::query("INSERT INTO rses (id, name, rse_type, created_at) VALUES (?, ?, 'DISK', datetime('now'))")
            .bind(rse_id)
            .bind(rse_id)
            .execute(pool.inner())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO rse_file_associations (rse_id, scope, name, state, lock_cnt, tombstone, created_at, updated_at)
             VALUES (?, ?, ?, 'AVAILABLE', 0, datetime('now'), datetime('now'), datetime('now'))",
        )
        .bind(rse_id)
        .bind(scope)
        .bind(name)
        .execute(pool.inner())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn add_lock_increments_count_and_clears_tombstone() {
        let pool = test_pool().await;
        seed_replica(&pool, "X", "u", "f1").await;
        let store = LockStore::new(pool.clone());
        let rule_id = Uuid::new_v4();

        store
            .add_replica_lock(rule_id, "X", "u", "f1", "alice", LockState::Waiting, Some(10))
            .await
            .unwrap();

        let (lock_cnt, tombstone): (i64, Option<String>) =
            sqlx::query_as("SELECT lock_cnt, tombstone FROM rse_file_associations WHERE rse_id = 'X' AND scope = 'u' AND name = 'f1'")
                .fetch_one(pool.inner())
                .await
                .unwrap();
        assert_eq!(lock_cnt, 1);
        assert!(tombstone.is_none());
    }

    #[tokio::test]
    async fn delete_locks_for_rule_tombstones_at_zero() {
        let pool = test_pool().await;
        seed_replica(&pool, "X", "u", "f1").await;
        let store = LockStore::new(pool.clone());
        let rule_id = Uuid::new_v4();
        store
            .add_replica_lock(rule_id, "X", "u", "f1", "alice", LockState::Ok, Some(10))
            .await
            .unwrap();

        let deleted = store.delete_locks_for_rule(rule_id).await.unwrap();
        assert_eq!(deleted, 1);

        let (lock_cnt, tombstone): (i64, Option<String>) =
            sqlx::query_as("SELECT lock_cnt, tombstone FROM rse_file_associations WHERE rse_id = 'X' AND scope = 'u' AND name = 'f1'")
                .fetch_one(pool.inner())
                .await
                .unwrap();
        assert_eq!(lock_cnt, 0);
        assert!(tombstone.is_some());
    }

    #[tokio::test]
    async fn delete_lock_removes_one_replica_and_tombstones_at_zero() {
        let pool = test_pool().await;
        seed_replica(&pool, "X", "u", "f1").await;
        seed_replica(&pool, "Y", "u", "f1").await;
        let store = LockStore::new(pool.clone());
        let rule_id = Uuid::new_v4();
        store.add_replica_lock(rule_id, "X", "u", "f1", "alice", LockState::Ok, Some(10)).await.unwrap();
        store.add_replica_lock(rule_id, "Y", "u", "f1", "alice", LockState::Ok, Some(10)).await.unwrap();

        store.delete_lock(rule_id, "X", "u", "f1").await.unwrap();

        let remaining = store.list_locks_for_rule(rule_id).await.unwrap();
        assert_eq!(remaining, vec![("Y".to_string(), "u".to_string(), "f1".to_string())]);

        let (lock_cnt, tombstone): (i64, Option<String>) =
            sqlx::query_as("SELECT lock_cnt, tombstone FROM rse_file_associations WHERE rse_id = 'X' AND scope = 'u' AND name = 'f1'")
                .fetch_one(pool.inner())
                .await
                .unwrap();
        assert_eq!(lock_cnt, 0);
        assert!(tombstone.is_some());
    }

    #[tokio::test]
    async fn delete_lock_on_a_missing_lock_is_a_noop() {
        let pool = test_pool().await;
        seed_replica(&pool, "X", "u", "f1").await;
        let store = LockStore::new(pool);
        store.delete_lock(Uuid::new_v4(), "X", "u", "f1").await.unwrap();
    }
}

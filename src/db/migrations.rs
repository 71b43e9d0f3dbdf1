//! # Schema Migrations
//!
//! A versioned, reversible migration runner. Each migration's `up`/`down`
//! SQL and its `_migrations` bookkeeping row commit in the same
//! transaction — [`MigrationManager::migrate_up`]/[`migrate_down`] hand
//! the running transaction straight to the [`Migration`], rather than
//! running the DDL against the pool and recording it as a separate step,
//! so a crash between the two can never leave the schema out of sync
//! with its own history table.

use crate::db::{pool::ConnectionPool, DatabaseError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub type MigrationVersion = i64;

#[async_trait::async_trait]
pub trait Migration: Send + Sync {
    fn version(&self) -> MigrationVersion;
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// Apply the migration against the caller's open transaction.
    async fn up(&self, tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()>;

    /// Undo the migration against the caller's open transaction.
    async fn down(&self, tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()>;

    fn is_reversible(&self) -> bool {
        true
    }
}

/// A migration expressed as a pair of raw SQL scripts.
pub struct SqlMigration {
    version: MigrationVersion,
    name: String,
    description: String,
    up_sql: String,
    down_sql: Option<String>,
}

impl SqlMigration {
    pub fn new(
        version: MigrationVersion,
        name: impl Into<String>,
        description: impl Into<String>,
        up_sql: impl Into<String>,
        down_sql: Option<String>,
    ) -> Self {
        Self { version, name: name.into(), description: description.into(), up_sql: up_sql.into(), down_sql }
    }
}

#[async_trait::async_trait]
impl Migration for SqlMigration {
    fn version(&self) -> MigrationVersion {
        self.version
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn up(&self, tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
        sqlx::query(&self.up_sql)
            .execute(&mut **tx)
            .await
            .map_err(|e| DatabaseError::Migration(format!("migration up failed: {e}")))?;
        Ok(())
    }

    async fn down(&self, tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
        let Some(down_sql) = &self.down_sql else {
            return Err(DatabaseError::Migration("migration is not reversible".to_string()));
        };
        sqlx::query(down_sql)
            .execute(&mut **tx)
            .await
            .map_err(|e| DatabaseError::Migration(format!("migration down failed: {e}")))?;
        Ok(())
    }

    fn is_reversible(&self) -> bool {
        self.down_sql.is_some()
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct MigrationRecord {
    version: i64,
    name: String,
    description: String,
    applied_at: String,
    checksum: String,
}

pub struct MigrationManager {
    pool: ConnectionPool,
    migrations: Arc<RwLock<HashMap<MigrationVersion, Box<dyn Migration>>>>,
    history: Arc<RwLock<Vec<MigrationRecord>>>,
}

impl MigrationManager {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool, migrations: Arc::new(RwLock::new(HashMap::new())), history: Arc::new(RwLock::new(Vec::new())) }
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL,
                checksum TEXT NOT NULL
            )",
        )
        .execute(self.pool.inner())
        .await
        .map_err(|e| DatabaseError::Migration(format!("failed to create migrations table: {e}")))?;

        self.load_history().await
    }

    pub fn register<M: Migration + 'static>(&self, migration: M) {
        self.migrations.write().insert(migration.version(), Box::new(migration));
    }

    async fn load_history(&self) -> Result<()> {
        let records: Vec<MigrationRecord> = sqlx::query_as("SELECT * FROM _migrations ORDER BY version")
            .fetch_all(self.pool.inner())
            .await
            .map_err(|e| DatabaseError::Migration(format!("failed to load migration history: {e}")))?;
        *self.history.write() = records;
        Ok(())
    }

    pub fn pending_migrations(&self) -> Vec<MigrationVersion> {
        let applied: Vec<i64> = self.history.read().iter().map(|r| r.version).collect();
        let mut pending: Vec<MigrationVersion> =
            self.migrations.read().keys().filter(|v| !applied.contains(v)).copied().collect();
        pending.sort();
        pending
    }

    pub async fn run_pending(&self) -> Result<()> {
        let pending = self.pending_migrations();
        if pending.is_empty() {
            log::info!("no pending migrations");
            return Ok(());
        }
        log::info!("running {} pending migrations", pending.len());
        for version in pending {
            self.migrate_up(version).await?;
        }
        Ok(())
    }

    pub async fn migrate_up(&self, version: MigrationVersion) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        {
            let migrations = self.migrations.read();
            let migration = migrations
                .get(&version)
                .ok_or_else(|| DatabaseError::Migration(format!("migration {version} not found")))?;

            log::info!("running migration {version}: {}", migration.name());
            migration.up(&mut tx).await?;

            let checksum = Self::checksum(version);
            let now = chrono::Utc::now().to_rfc3339();
            sqlx::query(
                "INSERT INTO _migrations (version, name, description, applied_at, checksum) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(version)
            .bind(migration.name())
            .bind(migration.description())
            .bind(now)
            .bind(checksum)
            .execute(&mut *tx)
            .await
            .map_err(|e| DatabaseError::Migration(format!("failed to record migration: {e}")))?;
        }

        tx.commit().await.map_err(|e| DatabaseError::Migration(format!("failed to commit migration: {e}")))?;
        self.load_history().await?;
        log::info!("migration {version} applied");
        Ok(())
    }

    pub async fn migrate_down(&self, version: MigrationVersion) -> Result<()> {
        if !self.history.read().iter().any(|r| r.version == version) {
            return Err(DatabaseError::Migration(format!("migration {version} is not applied")));
        }

        let mut tx = self.pool.begin().await?;
        {
            let migrations = self.migrations.read();
            let migration = migrations
                .get(&version)
                .ok_or_else(|| DatabaseError::Migration(format!("migration {version} not found")))?;
            if !migration.is_reversible() {
                return Err(DatabaseError::Migration(format!("migration {version} is not reversible")));
            }

            log::info!("rolling back migration {version}: {}", migration.name());
            migration.down(&mut tx).await?;
        }

        sqlx::query("DELETE FROM _migrations WHERE version = ?")
            .bind(version)
            .execute(&mut *tx)
            .await
            .map_err(|e| DatabaseError::Migration(format!("failed to remove migration record: {e}")))?;

        tx.commit().await.map_err(|e| DatabaseError::Migration(format!("failed to commit rollback: {e}")))?;
        self.load_history().await?;
        log::info!("migration {version} rolled back");
        Ok(())
    }

    pub async fn rollback(&self, count: usize) -> Result<()> {
        let mut applied: Vec<i64> = self.history.read().iter().map(|r| r.version).collect();
        applied.sort_unstable_by(|a, b| b.cmp(a));
        for version in applied.into_iter().take(count) {
            self.migrate_down(version).await?;
        }
        Ok(())
    }

    pub fn status(&self) -> MigrationStatus {
        let applied: Vec<MigrationInfo> = self
            .history
            .read()
            .iter()
            .map(|r| MigrationInfo {
                version: r.version,
                name: r.name.clone(),
                description: r.description.clone(),
                applied_at: Some(r.applied_at.clone()),
                is_applied: true,
            })
            .collect();

        let migrations = self.migrations.read();
        let pending: Vec<MigrationInfo> = self
            .pending_migrations()
            .into_iter()
            .filter_map(|v| {
                migrations.get(&v).map(|m| MigrationInfo {
                    version: v,
                    name: m.name().to_string(),
                    description: m.description().to_string(),
                    applied_at: None,
                    is_applied: false,
                })
            })
            .collect();

        MigrationStatus {
            total: migrations.len(),
            applied: applied.len(),
            pending: pending.len(),
            history: applied,
            pending_migrations: pending,
        }
    }

    fn checksum(version: MigrationVersion) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(version.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub total: usize,
    pub applied: usize,
    pub pending: usize,
    pub history: Vec<MigrationInfo>,
    pub pending_migrations: Vec<MigrationInfo>,
}

#[derive(Debug, Clone)]
pub struct MigrationInfo {
    pub version: MigrationVersion,
    pub name: String,
    pub description: String,
    pub applied_at: Option<String>,
    pub is_applied: bool,
}

/// Registers the persisted schema described in the data model: the DID
/// graph, the replication-rule engine's tables, the lock layer, the
/// re-evaluation feed, the outbox, and the daemon heartbeat table. Each
/// migration is its own `SqlMigration` so `status()`/`rollback()`
/// operate at the same granularity the history table tracks.
pub fn init_default_migrations(manager: &MigrationManager) {
    manager.register(SqlMigration::new(
        20260101000001,
        "create_dids",
        "Data identifiers: files, datasets, containers",
        r#"
            CREATE TABLE dids (
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                did_type TEXT NOT NULL,
                account TEXT NOT NULL,
                bytes INTEGER,
                length INTEGER,
                guid TEXT,
                is_open INTEGER NOT NULL DEFAULT 1,
                is_new INTEGER NOT NULL DEFAULT 1,
                hidden INTEGER NOT NULL DEFAULT 0,
                obsolete INTEGER NOT NULL DEFAULT 0,
                expired_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (scope, name)
            );
            CREATE UNIQUE INDEX idx_dids_scope_name ON dids(scope, name);
            CREATE INDEX idx_dids_expired_at ON dids(expired_at);
            CREATE INDEX idx_dids_is_new ON dids(is_new);
        "#,
        Some("DROP TABLE dids;".to_string()),
    ));

    manager.register(SqlMigration::new(
        20260101000002,
        "create_did_associations",
        "Parent/child edges of the DID graph (contents)",
        r#"
            CREATE TABLE did_associations (
                parent_scope TEXT NOT NULL,
                parent_name TEXT NOT NULL,
                child_scope TEXT NOT NULL,
                child_name TEXT NOT NULL,
                did_type TEXT NOT NULL,
                child_type TEXT NOT NULL,
                bytes INTEGER,
                created_at TEXT NOT NULL,
                PRIMARY KEY (parent_scope, parent_name, child_scope, child_name)
            );
            CREATE INDEX idx_assoc_child ON did_associations(child_scope, child_name);
        "#,
        Some("DROP TABLE did_associations;".to_string()),
    ));

    manager.register(SqlMigration::new(
        20260101000003,
        "create_rses",
        "Storage endpoints and their attributes",
        r#"
            CREATE TABLE rses (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                rse_type TEXT NOT NULL,
                deterministic INTEGER NOT NULL DEFAULT 1,
                staging_area INTEGER NOT NULL DEFAULT 0,
                availability_read INTEGER NOT NULL DEFAULT 1,
                availability_write INTEGER NOT NULL DEFAULT 1,
                availability_delete INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );
            CREATE TABLE rse_attributes (
                rse_id TEXT NOT NULL REFERENCES rses(id),
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (rse_id, key)
            );
        "#,
        Some("DROP TABLE rse_attributes; DROP TABLE rses;".to_string()),
    ));

    manager.register(SqlMigration::new(
        20260101000004,
        "create_rse_file_associations",
        "Physical replicas of a FILE DID at an RSE",
        r#"
            CREATE TABLE rse_file_associations (
                rse_id TEXT NOT NULL REFERENCES rses(id),
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                state TEXT NOT NULL,
                bytes INTEGER,
                lock_cnt INTEGER NOT NULL DEFAULT 0,
                tombstone TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (rse_id, scope, name)
            );
            CREATE INDEX idx_replicas_did ON rse_file_associations(scope, name);
            CREATE INDEX idx_replicas_tombstone ON rse_file_associations(tombstone);
        "#,
        Some("DROP TABLE rse_file_associations;".to_string()),
    ));

    manager.register(SqlMigration::new(
        20260101000005,
        "create_replication_rules",
        "Replication rules and their history",
        r#"
            CREATE TABLE replication_rules (
                id TEXT PRIMARY KEY,
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                account TEXT NOT NULL,
                rse_expression TEXT NOT NULL,
                copies INTEGER NOT NULL,
                grouping TEXT NOT NULL,
                weight TEXT,
                state TEXT NOT NULL,
                locks_ok_cnt INTEGER NOT NULL DEFAULT 0,
                locks_replicating_cnt INTEGER NOT NULL DEFAULT 0,
                locks_stuck_cnt INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX idx_rules_did ON replication_rules(scope, name);
            CREATE TABLE replication_rules_hist_recent (
                id TEXT NOT NULL,
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                account TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE replication_rules_history (
                id TEXT NOT NULL,
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                account TEXT NOT NULL,
                state TEXT NOT NULL,
                archived_at TEXT NOT NULL
            );
        "#,
        Some(
            r#"
            DROP TABLE replication_rules_history;
            DROP TABLE replication_rules_hist_recent;
            DROP TABLE replication_rules;
        "#
            .to_string(),
        ),
    ));

    manager.register(SqlMigration::new(
        20260101000006,
        "create_rule_hints",
        "Per-dataset/container RSE placement bookkeeping for incremental reevaluation",
        r#"
            CREATE TABLE rule_hints (
                rule_id TEXT NOT NULL REFERENCES replication_rules(id),
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                rse_id TEXT NOT NULL REFERENCES rses(id),
                PRIMARY KEY (rule_id, scope, name, rse_id)
            );
        "#,
        Some("DROP TABLE rule_hints;".to_string()),
    ));

    manager.register(SqlMigration::new(
        20260101000007,
        "create_locks",
        "Replica locks and dataset locks",
        r#"
            CREATE TABLE replica_locks (
                rule_id TEXT NOT NULL REFERENCES replication_rules(id),
                rse_id TEXT NOT NULL REFERENCES rses(id),
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                account TEXT NOT NULL,
                state TEXT NOT NULL,
                bytes INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (rule_id, rse_id, scope, name)
            );
            CREATE INDEX idx_locks_rule ON replica_locks(rule_id);
            CREATE INDEX idx_locks_replica ON replica_locks(rse_id, scope, name);
            CREATE TABLE dataset_locks (
                rule_id TEXT NOT NULL REFERENCES replication_rules(id),
                rse_id TEXT NOT NULL REFERENCES rses(id),
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                account TEXT NOT NULL,
                state TEXT NOT NULL,
                length INTEGER,
                bytes INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (rule_id, rse_id, scope, name)
            );
            CREATE INDEX idx_dataset_locks_rule ON dataset_locks(rule_id);
        "#,
        Some(
            r#"
            DROP TABLE dataset_locks;
            DROP TABLE replica_locks;
        "#
            .to_string(),
        ),
    ));

    manager.register(SqlMigration::new(
        20260101000008,
        "create_updated_dids",
        "Re-evaluation feed: pending ATTACH/DETACH/BOTH work items",
        r#"
            CREATE TABLE updated_dids (
                id TEXT PRIMARY KEY,
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                rule_evaluation_action TEXT NOT NULL,
                shard INTEGER NOT NULL,
                claimed_by INTEGER,
                claimed_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX idx_updated_dids_shard ON updated_dids(shard);
            CREATE INDEX idx_updated_dids_did ON updated_dids(scope, name);
        "#,
        Some("DROP TABLE updated_dids;".to_string()),
    ));

    manager.register(SqlMigration::new(
        20260101000009,
        "create_messages",
        "Outbox: at-least-once messages awaiting Hermes delivery",
        r#"
            CREATE TABLE messages (
                id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX idx_messages_created_at ON messages(created_at);
        "#,
        Some("DROP TABLE messages;".to_string()),
    ));

    manager.register(SqlMigration::new(
        20260101000010,
        "create_account_limits",
        "Per-account, per-RSE quota limits and current usage",
        r#"
            CREATE TABLE account_limits (
                account TEXT NOT NULL,
                rse_id TEXT NOT NULL REFERENCES rses(id),
                bytes INTEGER NOT NULL,
                PRIMARY KEY (account, rse_id)
            );
            CREATE TABLE account_usage (
                account TEXT NOT NULL,
                rse_id TEXT NOT NULL REFERENCES rses(id),
                used_bytes INTEGER NOT NULL DEFAULT 0,
                files INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (account, rse_id)
            );
        "#,
        Some(
            r#"
            DROP TABLE account_usage;
            DROP TABLE account_limits;
        "#
            .to_string(),
        ),
    ));

    manager.register(SqlMigration::new(
        20260101000011,
        "create_heartbeats",
        "Daemon worker heartbeats used for hash-sharded assignment",
        r#"
            CREATE TABLE heartbeats (
                executable TEXT NOT NULL,
                hostname TEXT NOT NULL,
                pid INTEGER NOT NULL,
                thread_id INTEGER NOT NULL,
                payload TEXT,
                updated_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (executable, hostname, pid, thread_id)
            );
            CREATE INDEX idx_heartbeats_executable ON heartbeats(executable);
        "#,
        Some("DROP TABLE heartbeats;".to_string()),
    ));

    manager.register(SqlMigration::new(
        20260101000012,
        "create_did_metadata",
        "Free-form per-DID key/value metadata (get_metadata/set_metadata)",
        r#"
            CREATE TABLE did_metadata (
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (scope, name, key)
            );
        "#,
        Some("DROP TABLE did_metadata;".to_string()),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::DatabaseConfig;

    async fn test_pool() -> ConnectionPool {
        ConnectionPool::new(DatabaseConfig { url: "sqlite::memory:".to_string(), ..Default::default() })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn run_pending_applies_and_records_a_migration() {
        let pool = test_pool().await;
        let manager = MigrationManager::new(pool);
        manager.init().await.unwrap();
        manager.register(SqlMigration::new(
            1,
            "test",
            "test migration",
            "CREATE TABLE test (id INTEGER PRIMARY KEY)",
            Some("DROP TABLE test".to_string()),
        ));

        assert_eq!(manager.pending_migrations().len(), 1);
        manager.run_pending().await.unwrap();
        assert_eq!(manager.pending_migrations().len(), 0);

        let status = manager.status();
        assert_eq!(status.applied, 1);
        assert_eq!(status.pending, 0);
    }

    #[tokio::test]
    async fn migrate_down_reverses_a_migration() {
        let pool = test_pool().await;
        let manager = MigrationManager::new(pool.clone());
        manager.init().await.unwrap();
        manager.register(SqlMigration::new(
            1,
            "test",
            "test migration",
            "CREATE TABLE test (id INTEGER PRIMARY KEY)",
            Some("DROP TABLE test".to_string()),
        ));
        manager.run_pending().await.unwrap();

        manager.migrate_down(1).await.unwrap();
        assert_eq!(manager.status().applied, 0);

        let result = sqlx::query("INSERT INTO test (id) VALUES (1)").execute(pool.inner()).await;
        assert!(result.is_err(), "the rolled-back table must no longer exist");
    }

    #[tokio::test]
    async fn init_default_migrations_is_self_consistent() {
        let pool = test_pool().await;
        let manager = MigrationManager::new(pool);
        manager.init().await.unwrap();
        init_default_migrations(&manager);
        manager.run_pending().await.unwrap();
        assert_eq!(manager.pending_migrations().len(), 0);
    }
}

//! # Connection Pool and Row-Lock Discipline
//!
//! Every mutating entry point in this crate opens its own transaction —
//! there is no global/thread-local session — and a good fraction of them
//! (`lock`, `rule`, `did::delete_dids`) need a second property on top of
//! plain atomicity: a batch worker that finds a row already locked by a
//! concurrent writer must back off and retry on the next tick rather than
//! queue behind it, since queueing would serialize the whole fleet of
//! undertaker/rule-engine workers behind a single contended row. This
//! module is built around that requirement: [`ConnectionPool::begin_for_update`]
//! and [`ConnectionPool::map_lock_error`] are the two entry points every
//! row-locking caller goes through, and [`DatabaseConfig::busy_timeout`]
//! is the knob that bounds how long a worker waits before giving up and
//! surfacing [`DatabaseError::WouldBlock`].

use crate::db::{DatabaseError, Result};
use parking_lot::RwLock;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pool and per-connection tuning. The defaults favor a handful of
/// daemon processes sharing one SQLite file over a large web-request
/// fleet: few connections, WAL for reader/writer concurrency, and a
/// bounded busy timeout so lock contention surfaces as a retryable
/// error instead of an indefinite wait.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL, e.g. `"sqlite://rucio.db"` or `"sqlite::memory:"`.
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub connect_timeout: u64,
    pub idle_timeout: u64,
    pub max_lifetime: u64,
    pub statement_cache_capacity: usize,
    pub enable_wal: bool,
    /// Milliseconds SQLite will retry internally before returning
    /// `SQLITE_BUSY` to a caller blocked on a locked row or table.
    pub busy_timeout: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://rucio.db".to_string(),
            min_connections: 5,
            max_connections: 100,
            connect_timeout: 30,
            idle_timeout: 600,
            max_lifetime: 3600,
            statement_cache_capacity: 128,
            enable_wal: true,
            busy_timeout: 5000,
        }
    }
}

/// Point-in-time pool health, refreshed on [`ConnectionPool::health_check`]
/// and carrying counters tied to this crate's own concern — row-lock
/// contention — rather than generic per-query timing.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub pool_size: u32,
    pub idle_connections: usize,
    /// Transactions opened via `begin`/`begin_for_update`.
    pub transactions_started: u64,
    /// Times `map_lock_error`/`begin_for_update` turned a busy/locked
    /// error into `DatabaseError::WouldBlock` — a proxy for how often
    /// workers are backing off instead of racing each other.
    pub lock_contention_events: u64,
    pub last_health_check: Option<Instant>,
    pub is_healthy: bool,
}

/// SQLite connection pool plus the counters in [`PoolStats`].
#[derive(Clone)]
pub struct ConnectionPool {
    pool: SqlitePool,
    stats: Arc<RwLock<PoolStats>>,
}

impl ConnectionPool {
    pub async fn new(config: DatabaseConfig) -> Result<Self> {
        let connect_options = SqliteConnectOptions::new()
            .filename(&config.url.replace("sqlite://", ""))
            .create_if_missing(true)
            .statement_cache_capacity(config.statement_cache_capacity)
            .busy_timeout(Duration::from_millis(config.busy_timeout));

        let pool = SqlitePoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout)))
            .max_lifetime(Some(Duration::from_secs(config.max_lifetime)))
            .connect_with(connect_options)
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))?;

        if config.enable_wal {
            sqlx::query("PRAGMA journal_mode=WAL")
                .execute(&pool)
                .await
                .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))?;
        }
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&pool)
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))?;

        Ok(Self {
            pool,
            stats: Arc::new(RwLock::new(PoolStats { is_healthy: true, ..Default::default() })),
        })
    }

    /// The underlying sqlx pool, for callers building raw queries —
    /// every module outside this one reaches for `inner()` rather than a
    /// generic wrapper here, since almost every mutation in this crate
    /// runs inside an explicit transaction anyway.
    pub fn inner(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a plain transaction, for reads and for mutations that don't
    /// need [`begin_for_update`](Self::begin_for_update)'s contention
    /// signal (e.g. the migration runner).
    pub async fn begin(&self) -> Result<sqlx::Transaction<'_, sqlx::Sqlite>> {
        self.stats.write().transactions_started += 1;
        self.pool.begin().await.map_err(|e| DatabaseError::ConnectionPool(e.to_string()))
    }

    /// Begin a transaction for a caller about to touch a row another
    /// worker might be holding (lock inserts/deletes, DID deletion,
    /// rule application). With `busy_timeout` configured, SQLite retries
    /// internally for that long before giving up; a timeout here means
    /// another connection is still inside its own transaction on the
    /// same table, so it's surfaced as [`DatabaseError::WouldBlock`]
    /// rather than a generic connection error, and counted in
    /// [`PoolStats::lock_contention_events`] so callers can tell
    /// "no work to do" apart from "workers are fighting over rows".
    pub async fn begin_for_update(&self) -> Result<sqlx::Transaction<'_, sqlx::Sqlite>> {
        self.stats.write().transactions_started += 1;
        self.pool.begin().await.map_err(|e| {
            let mapped = Self::classify(&e);
            if matches!(mapped, DatabaseError::WouldBlock) {
                self.stats.write().lock_contention_events += 1;
            }
            mapped
        })
    }

    /// Translate an sqlx error raised while a `begin_for_update`
    /// transaction was open into [`DatabaseError::WouldBlock`] when it
    /// reflects lock contention, otherwise into a plain query error.
    /// Callers use this on every fallible query inside such a
    /// transaction, not just on `begin` itself, since SQLite can also
    /// report `SQLITE_BUSY` on the first statement that actually
    /// touches the contended table.
    pub fn map_lock_error(err: sqlx::Error) -> DatabaseError {
        Self::classify(&err)
    }

    fn classify(err: &sqlx::Error) -> DatabaseError {
        match err {
            sqlx::Error::Database(db_err)
                if db_err.message().contains("busy") || db_err.message().contains("locked") =>
            {
                DatabaseError::WouldBlock
            }
            _ => DatabaseError::QueryExecution(err.to_string()),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.read().clone()
    }

    /// On-demand liveness probe. The daemon binaries call this once at
    /// startup so a broken database URL fails fast with a clear message
    /// instead of surfacing as the first tick's opaque query error.
    pub async fn health_check(&self) -> Result<bool> {
        let start = Instant::now();
        let result = sqlx::query("SELECT 1").fetch_one(&self.pool).await;
        let is_healthy = result.is_ok();

        let mut stats = self.stats.write();
        stats.last_health_check = Some(start);
        stats.is_healthy = is_healthy;
        stats.pool_size = self.pool.size();
        stats.idle_connections = self.pool.num_idle();
        drop(stats);

        result.map(|_| is_healthy).map_err(|e| DatabaseError::ConnectionPool(e.to_string()))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn size(&self) -> u32 {
        self.pool.size()
    }

    pub fn num_idle(&self) -> usize {
        self.pool.num_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> ConnectionPool {
        ConnectionPool::new(DatabaseConfig { url: "sqlite::memory:".to_string(), ..Default::default() })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn new_pool_is_healthy() {
        let pool = test_pool().await;
        assert!(pool.health_check().await.unwrap());
        assert!(pool.stats().is_healthy);
    }

    #[tokio::test]
    async fn begin_and_begin_for_update_both_count_transactions() {
        let pool = test_pool().await;
        let tx1 = pool.begin().await.unwrap();
        tx1.rollback().await.unwrap();
        let tx2 = pool.begin_for_update().await.unwrap();
        tx2.rollback().await.unwrap();

        assert_eq!(pool.stats().transactions_started, 2);
        assert_eq!(pool.stats().lock_contention_events, 0);
    }

    #[test]
    fn map_lock_error_classifies_busy_as_would_block() {
        let busy = sqlx::Error::Database(Box::new(FakeDbError("database is locked".to_string())));
        assert!(matches!(ConnectionPool::map_lock_error(busy), DatabaseError::WouldBlock));

        let other = sqlx::Error::RowNotFound;
        assert!(matches!(ConnectionPool::map_lock_error(other), DatabaseError::QueryExecution(_)));
    }

    #[derive(Debug)]
    struct FakeDbError(String);

    impl std::fmt::Display for FakeDbError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for FakeDbError {}

    impl sqlx::error::DatabaseError for FakeDbError {
        fn message(&self) -> &str {
            &self.0
        }

        fn as_any(&self) -> &(dyn std::any::Any + Send + Sync) {
            self
        }

        fn as_any_mut(&mut self) -> &mut (dyn std::any::Any + Send + Sync) {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }
    }
}

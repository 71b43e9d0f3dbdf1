//! Shared heartbeat/shard-assignment discipline for the two Hermes
//! workers: register `(executable, hostname, pid, thread)` at start,
//! refresh it on every tick, and use the live row count to size the
//! shard each worker claims from the outbox.

use crate::db::ConnectionPool;
use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};

/// What `live()` hands back: the shard this worker currently owns.
#[derive(Debug, Clone, Copy)]
pub struct Assignment {
    pub assign_thread: u32,
    pub nr_threads: u32,
}

/// Registers `(executable, hostname, pid, thread)` at start, refreshes the
/// row on every `live()` call, and removes it on `die()`.
pub struct Heartbeat {
    pool: ConnectionPool,
    executable: String,
    hostname: String,
    pid: u32,
    thread_id: AtomicU32,
}

impl Heartbeat {
    pub fn new(pool: ConnectionPool, executable: impl Into<String>, thread_id: u32) -> Self {
        Self {
            pool,
            executable: executable.into(),
            hostname: hostname_or_unknown(),
            pid: std::process::id(),
            thread_id: AtomicU32::new(thread_id),
        }
    }

    pub async fn live(&self, total_threads: u32) -> Result<Assignment, crate::db::DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let thread_id = self.thread_id.load(Ordering::Relaxed);

        sqlx::query(
            "INSERT INTO heartbeats (executable, hostname, pid, thread_id, updated_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(executable, hostname, pid, thread_id) DO UPDATE SET updated_at = excluded.updated_at",
        )
        .bind(&self.executable)
        .bind(&self.hostname)
        .bind(self.pid as i64)
        .bind(thread_id as i64)
        .bind(&now)
        .bind(&now)
        .execute(self.pool.inner())
        .await?;

        Ok(Assignment {
            assign_thread: thread_id,
            nr_threads: total_threads,
        })
    }

    pub async fn die(&self) -> Result<(), crate::db::DatabaseError> {
        sqlx::query("DELETE FROM heartbeats WHERE executable = ? AND hostname = ? AND pid = ? AND thread_id = ?")
            .bind(&self.executable)
            .bind(&self.hostname)
            .bind(self.pid as i64)
            .bind(self.thread_id.load(Ordering::Relaxed) as i64)
            .execute(self.pool.inner())
            .await?;
        Ok(())
    }
}

fn hostname_or_unknown() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{migrations, DatabaseConfig, MigrationManager};

    async fn test_pool() -> ConnectionPool {
        let pool = ConnectionPool::new(DatabaseConfig { url: "sqlite::memory:".to_string(), ..Default::default() })
            .await
            .unwrap();
        let manager = MigrationManager::new(pool.clone());
        manager.init().await.unwrap();
        migrations::init_default_migrations(&manager);
        manager.run_pending().await.unwrap();
        pool
    }

    #[tokio::test]
    async fn live_registers_then_die_removes() {
        let pool = test_pool().await;
        let heartbeat = Heartbeat::new(pool.clone(), "hermesd", 0);

        let assignment = heartbeat.live(1).await.unwrap();
        assert_eq!(assignment.assign_thread, 0);

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM heartbeats WHERE executable = 'hermesd'")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(count, 1);

        heartbeat.die().await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM heartbeats WHERE executable = 'hermesd'")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn live_is_idempotent_on_repeat_calls() {
        let pool = test_pool().await;
        let heartbeat = Heartbeat::new(pool.clone(), "hermesd", 0);
        heartbeat.live(1).await.unwrap();
        heartbeat.live(1).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM heartbeats WHERE executable = 'hermesd'")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}

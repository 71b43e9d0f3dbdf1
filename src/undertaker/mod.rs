//! # Undertaker
//!
//! Background deletion worker: every tick, scan for expired DIDs on this
//! worker's shard and cascade their deletion. Grounded on the run-loop
//! and heartbeat shape of the teacher's background worker: an
//! `AtomicBool` running flag, counters per deleted-row category, and a
//! snapshot struct analogous to `WorkerHealth`.

use crate::did::DidStore;
use crate::model::DidKey;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Error, Debug)]
pub enum UndertakerError {
    #[error(transparent)]
    Did(#[from] crate::error::DidError),
}

/// Per-category counters the spec's Metrics bullet requires.
#[derive(Debug, Default, Clone)]
pub struct UndertakerCounters {
    pub locks: u64,
    pub rules: u64,
    pub parent_content: u64,
    pub content: u64,
    pub dids: u64,
    pub tombstones: u64,
    pub batches_skipped: u64,
}

#[derive(Debug, Clone)]
pub struct UndertakerSnapshot {
    pub worker_id: String,
    pub is_running: bool,
    pub last_tick: Option<DateTime<Utc>>,
    pub counters: UndertakerCounters,
}

pub struct Undertaker {
    worker_id: String,
    worker_number: u32,
    total_workers: u32,
    bulk: i64,
    delay: Duration,
    dids: Arc<DidStore>,
    is_running: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    locks: AtomicU64,
    rules: AtomicU64,
    parent_content: AtomicU64,
    content: AtomicU64,
    dids_deleted: AtomicU64,
    tombstones: AtomicU64,
    batches_skipped: AtomicU64,
    last_tick: parking_lot::RwLock<Option<DateTime<Utc>>>,
}

impl Undertaker {
    pub fn new(
        worker_number: u32,
        total_workers: u32,
        bulk: i64,
        delay: Duration,
        dids: Arc<DidStore>,
    ) -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            worker_number,
            total_workers,
            bulk,
            delay,
            dids,
            is_running: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
            locks: AtomicU64::new(0),
            rules: AtomicU64::new(0),
            parent_content: AtomicU64::new(0),
            content: AtomicU64::new(0),
            dids_deleted: AtomicU64::new(0),
            tombstones: AtomicU64::new(0),
            batches_skipped: AtomicU64::new(0),
            last_tick: parking_lot::RwLock::new(None),
        }
    }

    pub fn stop_handle(&self) -> (Arc<AtomicBool>, Arc<Notify>) {
        (self.is_running.clone(), self.stop_notify.clone())
    }

    pub fn snapshot(&self) -> UndertakerSnapshot {
        UndertakerSnapshot {
            worker_id: self.worker_id.clone(),
            is_running: self.is_running.load(Ordering::SeqCst),
            last_tick: *self.last_tick.read(),
            counters: UndertakerCounters {
                locks: self.locks.load(Ordering::Relaxed),
                rules: self.rules.load(Ordering::Relaxed),
                parent_content: self.parent_content.load(Ordering::Relaxed),
                content: self.content.load(Ordering::Relaxed),
                dids: self.dids_deleted.load(Ordering::Relaxed),
                tombstones: self.tombstones.load(Ordering::Relaxed),
                batches_skipped: self.batches_skipped.load(Ordering::Relaxed),
            },
        }
    }

    /// Run the tick loop. `once = true` processes a single batch and
    /// returns; otherwise loops until the stop flag is set, observing it
    /// before and after the blocking work (§5 cancellation points) and
    /// sleeping `max(0, delay - elapsed)` between ticks.
    pub async fn run(&self, once: bool) -> Result<(), UndertakerError> {
        self.is_running.store(true, Ordering::SeqCst);
        log::info!("undertaker {} starting (worker {}/{})", self.worker_id, self.worker_number, self.total_workers);

        loop {
            if !self.is_running.load(Ordering::SeqCst) {
                break;
            }

            let tick_started = tokio::time::Instant::now();
            self.tick().await?;
            *self.last_tick.write() = Some(Utc::now());

            if once || !self.is_running.load(Ordering::SeqCst) {
                break;
            }

            let elapsed = tick_started.elapsed();
            let sleep_for = self.delay.saturating_sub(elapsed);
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.stop_notify.notified() => {}
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        log::info!("undertaker {} stopped", self.worker_id);
        Ok(())
    }

    pub fn request_stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    async fn tick(&self) -> Result<(), UndertakerError> {
        let expired = self
            .dids
            .list_expired_dids(self.worker_number, self.total_workers, Some(self.bulk))
            .await?;

        if expired.is_empty() {
            return Ok(());
        }

        match self.delete_batch(&expired).await {
            Ok(()) => {}
            Err(e) => {
                // Failures per batch are logged and skipped, never
                // retried in-line, to prevent poison-message stalls.
                log::warn!("undertaker batch of {} DIDs failed: {e}", expired.len());
                self.batches_skipped.fetch_add(1, Ordering::Relaxed);
            }
        }

        Ok(())
    }

    async fn delete_batch(&self, batch: &[DidKey]) -> Result<(), UndertakerError> {
        let report = self.dids.delete_dids(batch).await?;
        self.locks.fetch_add(report.locks, Ordering::Relaxed);
        self.rules.fetch_add(report.rules, Ordering::Relaxed);
        self.parent_content.fetch_add(report.parent_content, Ordering::Relaxed);
        self.content.fetch_add(report.content, Ordering::Relaxed);
        self.dids_deleted.fetch_add(report.dids, Ordering::Relaxed);
        self.tombstones.fetch_add(report.tombstones, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{migrations, ConnectionPool, DatabaseConfig, MigrationManager};
    use crate::model::DidType;

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
    async fn run_once_deletes_expired_dataset_and_updates_counters() {
        let pool = test_pool().await;
        let dids = Arc::new(DidStore::new(pool.clone()));

        dids.add_did("u", "ds1", DidType::Dataset, "alice", Some(chrono::Duration::seconds(-1))).await.unwrap();

        let undertaker = Undertaker::new(0, 1, 100, Duration::from_secs(60), dids.clone());
        undertaker.run(true).await.unwrap();

        let snapshot = undertaker.snapshot();
        assert_eq!(snapshot.counters.dids, 1);
        assert!(dids.get_did("u", "ds1").await.is_err());
    }

    #[tokio::test]
    async fn run_once_with_no_expired_dids_is_a_no_op() {
        let pool = test_pool().await;
        let dids = Arc::new(DidStore::new(pool));
        let undertaker = Undertaker::new(0, 1, 100, Duration::from_secs(60), dids);
        undertaker.run(true).await.unwrap();

        let snapshot = undertaker.snapshot();
        assert_eq!(snapshot.counters.dids, 0);
        assert_eq!(snapshot.counters.batches_skipped, 0);
    }
}

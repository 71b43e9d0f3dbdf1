//! # Re-evaluation Feed
//!
//! An append-only table of `UpdatedDid` work items written by the DID
//! graph store (attach/detach/set_status) and drained by the rule
//! engine. Grounded on the job-queue shape (append, claim-by-shard,
//! ack/delete) rather than the teacher's event-sourcing module, which is
//! too heavy for a single-reader append-only feed.

use crate::db::ConnectionPool;
use crate::did::{sharding, DidStore};
use crate::error::RuleError;
use crate::lock::LockStore;
use crate::model::RuleEvaluationAction;
use crate::rse::{AccountQuotaProvider, RseAttributeProvider, RseExpressionResolver};
use crate::rule::RuleEngine;
use crate::transfer::TransferSubmitter;
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub type Result<T> = std::result::Result<T, RuleError>;

#[derive(Debug, Clone)]
pub struct ReevalItem {
    pub id: String,
    pub scope: String,
    pub name: String,
    pub action: RuleEvaluationAction,
}

pub struct ReevalFeed {
    pool: ConnectionPool,
}

impl ReevalFeed {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Claims up to `limit` items belonging to `(worker_number,
    /// total_workers)`'s shard, folding repeated entries for the same
    /// `(scope,name)` into one `ReevalItem` per the ATTACH∘DETACH=BOTH
    /// folding rule — idempotent with respect to processing order.
    pub async fn claim(
        &self,
        worker_number: u32,
        total_workers: u32,
        limit: i64,
    ) -> Result<Vec<ReevalItem>> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT id, scope, name, rule_evaluation_action FROM updated_dids WHERE claimed_by IS NULL ORDER BY created_at LIMIT ?",
        )
        .bind(limit * total_workers.max(1) as i64)
        .fetch_all(self.pool.inner())
        .await
        .map_err(|e| RuleError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

        let mut folded: std::collections::HashMap<(String, String), (Vec<String>, RuleEvaluationAction)> =
            std::collections::HashMap::new();

        for (id, scope, name, action_str) in rows {
            if !sharding::belongs_to_worker(&name, worker_number, total_workers) {
                continue;
            }
            let action = match action_str.as_str() {
                "ATTACH" => RuleEvaluationAction::Attach,
                "DETACH" => RuleEvaluationAction::Detach,
                _ => RuleEvaluationAction::Both,
            };
            let entry = folded.entry((scope, name)).or_insert_with(|| (Vec::new(), action));
            entry.0.push(id);
            entry.1 = entry.1.fold(action);
        }

        let mut items: Vec<ReevalItem> = folded
            .into_iter()
            .map(|((scope, name), (ids, action))| ReevalItem {
                id: ids.join(","),
                scope,
                name,
                action,
            })
            .collect();

        items.truncate(limit as usize);

        let claimed_at = Utc::now().to_rfc3339();
        for item in &items {
            for id in item.id.split(',') {
                sqlx::query("UPDATE updated_dids SET claimed_by = ?, claimed_at = ? WHERE id = ?")
                    .bind(worker_number as i64)
                    .bind(&claimed_at)
                    .bind(id)
                    .execute(self.pool.inner())
                    .await
                    .map_err(|e| RuleError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;
            }
        }

        Ok(items)
    }

    /// Acknowledges a processed item by deleting its underlying rows.
    /// At-least-once: a crash between `claim` and `ack` leaves the item
    /// claimed but undeleted; an operator sweep (or a future unclaim
    /// timeout) would be needed to recover it — not part of this spec.
    pub async fn ack(&self, item: &ReevalItem) -> Result<()> {
        for id in item.id.split(',') {
            sqlx::query("DELETE FROM updated_dids WHERE id = ?")
                .bind(id)
                .execute(self.pool.inner())
                .await
                .map_err(|e| RuleError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;
        }
        Ok(())
    }
}

/// Per-tick counters the companion to undertaker's `UndertakerCounters`.
#[derive(Debug, Default, Clone)]
pub struct ReevaluatorCounters {
    pub items_processed: u64,
    pub items_skipped: u64,
}

#[derive(Debug, Clone)]
pub struct ReevaluatorSnapshot {
    pub worker_id: String,
    pub is_running: bool,
    pub last_tick: Option<DateTime<Utc>>,
    pub counters: ReevaluatorCounters,
}

/// Background worker draining the re-evaluation feed: every tick, claims
/// this worker's shard of pending `UpdatedDid` items and applies each
/// through [`RuleEngine::reevaluate`]. Grounded on the undertaker's run
/// loop — same `AtomicBool`/`Notify` stop handle, same
/// `delay.saturating_sub(elapsed)` pacing, same never-retry-in-line
/// failure policy, just applied to the rule engine instead of the DID
/// graph.
pub struct Reevaluator {
    worker_id: String,
    worker_number: u32,
    total_workers: u32,
    bulk: i64,
    delay: Duration,
    feed: ReevalFeed,
    dids: Arc<DidStore>,
    locks: Arc<LockStore>,
    expression: Arc<dyn RseExpressionResolver>,
    attrs: Arc<dyn RseAttributeProvider>,
    quota: Arc<dyn AccountQuotaProvider>,
    transfers: Arc<dyn TransferSubmitter>,
    pool: ConnectionPool,
    is_running: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    items_processed: AtomicU64,
    items_skipped: AtomicU64,
    last_tick: parking_lot::RwLock<Option<DateTime<Utc>>>,
}

impl Reevaluator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_number: u32,
        total_workers: u32,
        bulk: i64,
        delay: Duration,
        pool: ConnectionPool,
        dids: Arc<DidStore>,
        locks: Arc<LockStore>,
        expression: Arc<dyn RseExpressionResolver>,
        attrs: Arc<dyn RseAttributeProvider>,
        quota: Arc<dyn AccountQuotaProvider>,
        transfers: Arc<dyn TransferSubmitter>,
    ) -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            worker_number,
            total_workers,
            bulk,
            delay,
            feed: ReevalFeed::new(pool.clone()),
            dids,
            locks,
            expression,
            attrs,
            quota,
            transfers,
            pool,
            is_running: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
            items_processed: AtomicU64::new(0),
            items_skipped: AtomicU64::new(0),
            last_tick: parking_lot::RwLock::new(None),
        }
    }

    pub fn stop_handle(&self) -> (Arc<AtomicBool>, Arc<Notify>) {
        (self.is_running.clone(), self.stop_notify.clone())
    }

    pub fn snapshot(&self) -> ReevaluatorSnapshot {
        ReevaluatorSnapshot {
            worker_id: self.worker_id.clone(),
            is_running: self.is_running.load(Ordering::SeqCst),
            last_tick: *self.last_tick.read(),
            counters: ReevaluatorCounters {
                items_processed: self.items_processed.load(Ordering::Relaxed),
                items_skipped: self.items_skipped.load(Ordering::Relaxed),
            },
        }
    }

    pub async fn run(&self, once: bool) -> Result<()> {
        self.is_running.store(true, Ordering::SeqCst);
        log::info!("reevaluator {} starting (worker {}/{})", self.worker_id, self.worker_number, self.total_workers);

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
        log::info!("reevaluator {} stopped", self.worker_id);
        Ok(())
    }

    pub fn request_stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    async fn tick(&self) -> Result<()> {
        let items = self.feed.claim(self.worker_number, self.total_workers, self.bulk).await?;
        if items.is_empty() {
            return Ok(());
        }

        let engine = RuleEngine::new(
            self.pool.clone(),
            self.dids.as_ref(),
            self.locks.as_ref(),
            self.expression.as_ref(),
            self.attrs.as_ref(),
            self.quota.as_ref(),
            self.transfers.as_ref(),
        );
        let mut rng = rand::rngs::StdRng::from_entropy();

        for item in &items {
            match engine.reevaluate(item, &mut rng).await {
                Ok(()) => {
                    self.items_processed.fetch_add(1, Ordering::Relaxed);
                    self.feed.ack(item).await?;
                }
                Err(e) => {
                    // One poisoned item must never stall the rest of the
                    // batch; it stays claimed and is picked up again by
                    // an operator sweep (see `ReevalFeed::ack`'s note).
                    log::warn!("reevaluator skipping item {} ({},{}) : {e}", item.id, item.scope, item.name);
                    self.items_skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        Ok(())
    }
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
    async fn claim_folds_attach_and_detach_into_both() {
        let pool = test_pool().await;
        sqlx::query("INSERT INTO updated_dids (id, scope, name, rule_evaluation_action, shard, created_at) VALUES ('a', 'u', 'ds1', 'ATTACH', 0, datetime('now'))")
            .execute(pool.inner())
            .await
            .unwrap();
        sqlx::query("INSERT INTO updated_dids (id, scope, name, rule_evaluation_action, shard, created_at) VALUES ('b', 'u', 'ds1', 'DETACH', 0, datetime('now', '+1 second'))")
            .execute(pool.inner())
            .await
            .unwrap();

        let feed = ReevalFeed::new(pool);
        let items = feed.claim(0, 1, 10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].action, RuleEvaluationAction::Both);
    }

    #[tokio::test]
    async fn ack_removes_claimed_rows() {
        let pool = test_pool().await;
        sqlx::query("INSERT INTO updated_dids (id, scope, name, rule_evaluation_action, shard, created_at) VALUES ('a', 'u', 'ds1', 'ATTACH', 0, datetime('now'))")
            .execute(pool.inner())
            .await
            .unwrap();

        let feed = ReevalFeed::new(pool.clone());
        let items = feed.claim(0, 1, 10).await.unwrap();
        feed.ack(&items[0]).await.unwrap();

        let remaining: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM updated_dids")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(remaining.0, 0);
    }

    #[tokio::test]
    async fn reevaluator_run_once_drains_an_attach_item_and_acks_it() {
        use crate::model::{AttachedDid, DidType};
        use crate::quota::SqlAccountQuota;
        use crate::rse::StaticRseExpressionResolver;
        use crate::transfer::NullTransferSubmitter;

        struct AllowAllAttrs;
        #[async_trait::async_trait]
        impl RseAttributeProvider for AllowAllAttrs {
            async fn attributes(&self, _rse_id: &str) -> std::result::Result<std::collections::HashMap<String, String>, crate::error::SelectorError> {
                Ok(std::collections::HashMap::new())
            }
        }

        let pool = test_pool().await;
        sqlx::query("INSERT INTO rses (id, name, rse_type, created_at) VALUES ('RSE1', 'RSE1', 'DISK', datetime('now'))")
            .execute(pool.inner())
            .await
            .unwrap();

        let dids = Arc::new(DidStore::new(pool.clone()));
        let locks = Arc::new(LockStore::new(pool.clone()));
        let quota = SqlAccountQuota::new(pool.clone());
        quota.set_account_limit("alice", "RSE1", 10_000).await.unwrap();

        dids.add_did("u", "ds1", DidType::Dataset, "alice", None).await.unwrap();
        dids.attach(
            "u",
            "ds1",
            &[AttachedDid { scope: "u".to_string(), name: "f1".to_string(), bytes: Some(50), adler32: None, md5: None }],
            None,
        )
        .await
        .unwrap();

        let expression: Arc<dyn RseExpressionResolver> = Arc::new(StaticRseExpressionResolver::single("RSE1", vec!["RSE1".to_string()]));
        let attrs: Arc<dyn RseAttributeProvider> = Arc::new(AllowAllAttrs);
        let quota: Arc<dyn AccountQuotaProvider> = Arc::new(quota);
        let transfers: Arc<dyn TransferSubmitter> = Arc::new(NullTransferSubmitter);

        let engine = RuleEngine::new(pool.clone(), &dids, &locks, expression.as_ref(), attrs.as_ref(), quota.as_ref(), transfers.as_ref());
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let new_rule = crate::model::NewRule {
            account: "alice".to_string(),
            copies: 1,
            rse_expression: "RSE1".to_string(),
            grouping: crate::model::RuleGrouping::All,
            weight: None,
            lifetime: None,
            locked: false,
            subscription_id: None,
        };
        engine.add_replication_rule(&[("u".to_string(), "ds1".to_string())], new_rule, &mut rng).await.unwrap();

        dids.attach(
            "u",
            "ds1",
            &[AttachedDid { scope: "u".to_string(), name: "f2".to_string(), bytes: Some(50), adler32: None, md5: None }],
            None,
        )
        .await
        .unwrap();
        sqlx::query("INSERT INTO updated_dids (id, scope, name, rule_evaluation_action, shard, created_at) VALUES ('a', 'u', 'f2', 'ATTACH', 0, datetime('now'))")
            .execute(pool.inner())
            .await
            .unwrap();

        let reevaluator =
            Reevaluator::new(0, 1, 10, Duration::from_secs(60), pool.clone(), dids.clone(), locks.clone(), expression, attrs, quota, transfers);
        reevaluator.run(true).await.unwrap();

        let snapshot = reevaluator.snapshot();
        assert_eq!(snapshot.counters.items_processed, 1);
        assert_eq!(snapshot.counters.items_skipped, 0);

        let f2_locks = locks.get_replica_locks("u", "f2").await.unwrap();
        assert_eq!(f2_locks.len(), 1);

        let remaining: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM updated_dids").fetch_one(pool.inner()).await.unwrap();
        assert_eq!(remaining.0, 0);
    }
}

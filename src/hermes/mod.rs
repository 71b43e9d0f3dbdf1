//! # Hermes Messenger
//!
//! Two independent delivery loops — [`broker`] (STOMP) and [`email`]
//! (SMTP) — draining the same `messages` outbox table. Grounded on the
//! heartbeat/run-loop shape already established in `undertaker`, and on
//! the `NotificationDelivery` trait-at-the-seam pattern for isolating the
//! one crate whose exact API this code can't verify by compiling.

pub mod broker;
pub mod email;
pub mod heartbeat;

use crate::db::ConnectionPool;
use crate::did::sharding;
use crate::error::HermesError;
use crate::model::OutboxMessage;
use broker::{publish_one, BrokerClient, PublishOutcome};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Read/delete access to the `messages` outbox, shared by both loops.
pub struct Outbox {
    pool: ConnectionPool,
}

impl Outbox {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Retrieves up to `limit` messages belonging to this worker's shard
    /// (hashed by message id, since the outbox carries no shard column of
    /// its own), oldest first. A row whose `payload` isn't valid JSON is
    /// un-encodable and will never become valid on retry, so it's logged
    /// and deleted in place (poisoned) rather than failing the whole
    /// batch — the next call finds one fewer row and the rest still
    /// deliver.
    pub async fn retrieve(
        &self,
        worker_number: u32,
        total_workers: u32,
        limit: i64,
    ) -> Result<Vec<OutboxMessage>, HermesError> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT id, event_type, payload, created_at FROM messages ORDER BY created_at LIMIT ?",
        )
        .bind(limit * total_workers.max(1) as i64)
        .fetch_all(self.pool.inner())
        .await
        .map_err(|e| HermesError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

        let mut out = Vec::new();
        for (id, event_type, payload, created_at) in rows {
            if !sharding::belongs_to_worker(&id, worker_number, total_workers) {
                continue;
            }

            let payload: serde_json::Value = match serde_json::from_str(&payload) {
                Ok(p) => p,
                Err(e) => {
                    log::error!("outbox message {id} has an un-encodable payload, dropping: {e}");
                    if let Err(delete_err) = sqlx::query("DELETE FROM messages WHERE id = ?")
                        .bind(&id)
                        .execute(self.pool.inner())
                        .await
                    {
                        log::warn!("failed to delete poison message {id}: {delete_err}");
                    }
                    continue;
                }
            };

            let created_at: DateTime<Utc> = chrono::DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| HermesError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?
                .with_timezone(&Utc);
            out.push(OutboxMessage {
                id: uuid::Uuid::parse_str(&id)
                    .map_err(|e| HermesError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?,
                event_type,
                payload,
                created_at,
            });
            if out.len() as i64 >= limit {
                break;
            }
        }
        Ok(out)
    }

    pub async fn delete(&self, id: uuid::Uuid) -> Result<(), HermesError> {
        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool.inner())
            .await
            .map_err(|e| HermesError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct BrokerCounters {
    pub delivered: u64,
    pub poisoned: u64,
    pub transient_failures: u64,
}

/// Drains the outbox against a pool of STOMP brokers, picking a connected
/// one at random per message, the way the original daemon spreads load
/// across equivalent brokers behind a DNS alias.
pub struct BrokerWorker {
    destination: String,
    worker_number: u32,
    total_workers: u32,
    bulk: i64,
    delay: Duration,
    outbox: Outbox,
    clients: Vec<Box<dyn BrokerClient>>,
    is_running: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    delivered: AtomicU64,
    poisoned: AtomicU64,
    transient_failures: AtomicU64,
}

impl BrokerWorker {
    pub fn new(
        destination: impl Into<String>,
        worker_number: u32,
        total_workers: u32,
        bulk: i64,
        delay: Duration,
        outbox: Outbox,
        clients: Vec<Box<dyn BrokerClient>>,
    ) -> Self {
        Self {
            destination: destination.into(),
            worker_number,
            total_workers,
            bulk,
            delay,
            outbox,
            clients,
            is_running: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
            delivered: AtomicU64::new(0),
            poisoned: AtomicU64::new(0),
            transient_failures: AtomicU64::new(0),
        }
    }

    pub fn stop_handle(&self) -> (Arc<AtomicBool>, Arc<Notify>) {
        (self.is_running.clone(), self.stop_notify.clone())
    }

    pub fn counters(&self) -> BrokerCounters {
        BrokerCounters {
            delivered: self.delivered.load(Ordering::Relaxed),
            poisoned: self.poisoned.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
        }
    }

    pub async fn run(&mut self, once: bool) -> Result<(), HermesError> {
        self.is_running.store(true, Ordering::SeqCst);
        for client in &mut self.clients {
            if !client.is_connected() {
                let _ = client.connect().await;
            }
        }

        loop {
            if !self.is_running.load(Ordering::SeqCst) {
                break;
            }

            let tick_started = tokio::time::Instant::now();
            self.tick().await;

            if once || !self.is_running.load(Ordering::SeqCst) {
                break;
            }

            let elapsed = tick_started.elapsed();
            tokio::select! {
                _ = tokio::time::sleep(self.delay.saturating_sub(elapsed)) => {}
                _ = self.stop_notify.notified() => {}
            }
        }

        for client in &mut self.clients {
            client.disconnect().await;
        }
        self.is_running.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn request_stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    async fn tick(&mut self) {
        let messages = match self.outbox.retrieve(self.worker_number, self.total_workers, self.bulk).await {
            Ok(m) => m,
            Err(e) => {
                log::warn!("hermes broker worker failed to retrieve outbox: {e}");
                return;
            }
        };

        for message in messages {
            let connected_indices: Vec<usize> =
                self.clients.iter().enumerate().filter(|(_, c)| c.is_connected()).map(|(i, _)| i).collect();

            let Some(&idx) = connected_indices.choose(&mut rand::thread_rng()) else {
                // No connected broker at all: leave every message for the
                // next tick and try reconnecting then.
                self.transient_failures.fetch_add(1, Ordering::Relaxed);
                for client in &mut self.clients {
                    let _ = client.connect().await;
                }
                return;
            };

            match publish_one(self.clients[idx].as_mut(), &self.destination, &message).await {
                PublishOutcome::Delivered => {
                    if let Err(e) = self.outbox.delete(message.id).await {
                        log::warn!("hermes broker worker delivered but failed to delete message {}: {e}", message.id);
                    }
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                PublishOutcome::Poisoned(reason) => {
                    log::error!("hermes broker worker dropping poison message {}: {reason}", message.id);
                    if let Err(e) = self.outbox.delete(message.id).await {
                        log::warn!("failed to delete poison message {}: {e}", message.id);
                    }
                    self.poisoned.fetch_add(1, Ordering::Relaxed);
                }
                PublishOutcome::Transient(e) => {
                    log::warn!("hermes broker worker leaving message {} for retry: {e}", message.id);
                    self.clients[idx].disconnect().await;
                    self.transient_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

/// Drains the outbox by email. There is no poison path here: a message
/// that fails to parse as a recipient is logged and left, since the
/// producer is expected to fix its payload rather than have the daemon
/// silently discard the notification.
pub struct EmailWorker {
    worker_number: u32,
    total_workers: u32,
    bulk: i64,
    delay: Duration,
    outbox: Outbox,
    sender: email::EmailSender,
    recipient_key: String,
    is_running: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    sent: AtomicU64,
}

impl EmailWorker {
    pub fn new(
        worker_number: u32,
        total_workers: u32,
        bulk: i64,
        delay: Duration,
        outbox: Outbox,
        sender: email::EmailSender,
        recipient_key: impl Into<String>,
    ) -> Self {
        Self {
            worker_number,
            total_workers,
            bulk,
            delay,
            outbox,
            sender,
            recipient_key: recipient_key.into(),
            is_running: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
            sent: AtomicU64::new(0),
        }
    }

    pub fn stop_handle(&self) -> (Arc<AtomicBool>, Arc<Notify>) {
        (self.is_running.clone(), self.stop_notify.clone())
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub async fn run(&mut self, once: bool) -> Result<(), HermesError> {
        self.is_running.store(true, Ordering::SeqCst);
        loop {
            if !self.is_running.load(Ordering::SeqCst) {
                break;
            }
            let tick_started = tokio::time::Instant::now();
            self.tick().await;
            if once || !self.is_running.load(Ordering::SeqCst) {
                break;
            }
            let elapsed = tick_started.elapsed();
            tokio::select! {
                _ = tokio::time::sleep(self.delay.saturating_sub(elapsed)) => {}
                _ = self.stop_notify.notified() => {}
            }
        }
        self.is_running.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn request_stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    async fn tick(&mut self) {
        let messages = match self.outbox.retrieve(self.worker_number, self.total_workers, self.bulk).await {
            Ok(m) => m,
            Err(e) => {
                log::warn!("hermes email worker failed to retrieve outbox: {e}");
                return;
            }
        };

        for message in messages {
            let Some(recipient) = message.payload.get(&self.recipient_key).and_then(|v| v.as_str()) else {
                log::warn!("message {} missing '{}' field, leaving for retry", message.id, self.recipient_key);
                continue;
            };

            match self.sender.send(&message, recipient).await {
                Ok(()) => {
                    if let Err(e) = self.outbox.delete(message.id).await {
                        log::warn!("email sent but failed to delete message {}: {e}", message.id);
                    }
                    self.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    log::warn!("email delivery failed for message {}, leaving for retry: {e}", message.id);
                }
            }
        }
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
    async fn retrieve_drops_poison_row_and_returns_the_rest() {
        let pool = test_pool().await;
        let bad_id = uuid::Uuid::new_v4();
        let good_id = uuid::Uuid::new_v4();
        sqlx::query("INSERT INTO messages (id, event_type, payload, created_at) VALUES (?, 'dataset_ok', 'not json at all', ?)")
            .bind(bad_id.to_string())
            .bind(Utc::now().to_rfc3339())
            .execute(pool.inner())
            .await
            .unwrap();
        sqlx::query("INSERT INTO messages (id, event_type, payload, created_at) VALUES (?, 'dataset_ok', '{\"scope\":\"u\"}', ?)")
            .bind(good_id.to_string())
            .bind((Utc::now() + chrono::Duration::seconds(1)).to_rfc3339())
            .execute(pool.inner())
            .await
            .unwrap();

        let outbox = Outbox::new(pool.clone());
        let messages = outbox.retrieve(0, 1, 10).await.unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].event_type, "dataset_ok");

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(count, 1, "the poison row must be deleted, leaving only the valid message");
    }

    #[tokio::test]
    async fn delete_removes_a_message_by_id() {
        let pool = test_pool().await;
        let id = uuid::Uuid::new_v4();
        sqlx::query("INSERT INTO messages (id, event_type, payload, created_at) VALUES (?, 'dataset_ok', '{}', ?)")
            .bind(id.to_string())
            .bind(Utc::now().to_rfc3339())
            .execute(pool.inner())
            .await
            .unwrap();

        let outbox = Outbox::new(pool.clone());
        outbox.delete(id).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}

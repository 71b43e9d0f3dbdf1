//! Account quota: per-account, per-RSE limits and usage counters.
//!
//! `set_account_limits`/`get_account_limits` are placeholders in the
//! source this crate is grounded on — the spec leaves their semantics
//! underspecified as an open question. This module implements the
//! narrowest reading that the rule engine and selector actually need:
//! a limit is bytes reserved for an account at an RSE, usage is bytes
//! currently consumed, and `quota_left = limit - usage`. See DESIGN.md.

use crate::db::{ConnectionPool, DatabaseError};
use crate::error::SelectorError;
use crate::rse::AccountQuotaProvider;
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct AccountLimit {
    pub account: String,
    pub rse_id: String,
    pub bytes: i64,
}

#[derive(Debug, Clone)]
pub struct AccountUsage {
    pub account: String,
    pub rse_id: String,
    pub used_bytes: i64,
    pub files: i64,
}

pub struct SqlAccountQuota {
    pool: ConnectionPool,
}

impl SqlAccountQuota {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub async fn set_account_limit(
        &self,
        account: &str,
        rse_id: &str,
        bytes: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO account_limits (account, rse_id, bytes) VALUES (?, ?, ?)
             ON CONFLICT(account, rse_id) DO UPDATE SET bytes = excluded.bytes",
        )
        .bind(account)
        .bind(rse_id)
        .bind(bytes)
        .execute(self.pool.inner())
        .await
        .map_err(DatabaseError::from)?;
        Ok(())
    }

    pub async fn get_account_limit(
        &self,
        account: &str,
        rse_id: &str,
    ) -> Result<Option<AccountLimit>, DatabaseError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT bytes FROM account_limits WHERE account = ? AND rse_id = ?")
                .bind(account)
                .bind(rse_id)
                .fetch_optional(self.pool.inner())
                .await?;

        Ok(row.map(|(bytes,)| AccountLimit {
            account: account.to_string(),
            rse_id: rse_id.to_string(),
            bytes,
        }))
    }

    pub async fn get_account_usage(
        &self,
        account: &str,
        rse_id: &str,
    ) -> Result<AccountUsage, DatabaseError> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT used_bytes, files FROM account_usage WHERE account = ? AND rse_id = ?",
        )
        .bind(account)
        .bind(rse_id)
        .fetch_optional(self.pool.inner())
        .await?;

        let (used_bytes, files) = row.unwrap_or((0, 0));
        Ok(AccountUsage {
            account: account.to_string(),
            rse_id: rse_id.to_string(),
            used_bytes,
            files,
        })
    }
}

#[async_trait]
impl AccountQuotaProvider for SqlAccountQuota {
    async fn quota_left(&self, account: &str, rse_id: &str) -> Result<i64, SelectorError> {
        let limit = self
            .get_account_limit(account, rse_id)
            .await
            .map_err(|e| SelectorError::InsufficientAccountLimit {
                account: account.to_string(),
                rse_id: format!("{rse_id} (lookup failed: {e})"),
            })?
            .map(|l| l.bytes)
            .unwrap_or(0);

        let usage = self
            .get_account_usage(account, rse_id)
            .await
            .map_err(|e| SelectorError::InsufficientAccountLimit {
                account: account.to_string(),
                rse_id: format!("{rse_id} (lookup failed: {e})"),
            })?;

        Ok(limit - usage.used_bytes)
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
    async fn quota_left_is_limit_minus_usage() {
        let pool = test_pool().await;
        let quota = SqlAccountQuota::new(pool.clone());
        quota.set_account_limit("alice", "RSE1", 1000).await.unwrap();
        sqlx::query("INSERT INTO account_usage (account, rse_id, used_bytes, files, updated_at) VALUES ('alice', 'RSE1', 300, 3, datetime('now'))")
            .execute(pool.inner())
            .await
            .unwrap();

        assert_eq!(quota.quota_left("alice", "RSE1").await.unwrap(), 700);
    }

    #[tokio::test]
    async fn quota_left_defaults_to_zero_limit_with_no_usage_row() {
        let pool = test_pool().await;
        let quota = SqlAccountQuota::new(pool);
        assert_eq!(quota.quota_left("bob", "RSE2").await.unwrap(), 0);
    }
}

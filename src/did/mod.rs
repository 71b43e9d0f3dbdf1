//! # DID Graph Store
//!
//! Persists files, datasets, and containers and the edges between them.
//! Every mutating entry point opens its own transaction (§5: one
//! serializable transaction per mutating op) against the
//! [`ConnectionPool`](crate::db::ConnectionPool) passed in — no
//! global/thread-local session, per the "global ORM session" design
//! note.

pub mod sharding;

use crate::db::ConnectionPool;
use crate::error::DidError;
use crate::model::{
    AttachedDid, DataIdentifier, DidFilter, DidKey, DidType, RuleEvaluationAction,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, DidError>;

pub struct DidStore {
    pool: ConnectionPool,
}

impl DidStore {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Register a single dataset or container. Files are never registered
    /// this way; they come into existence via `attach(..., rse: Some(_))`.
    pub async fn add_did(
        &self,
        scope: &str,
        name: &str,
        did_type: DidType,
        account: &str,
        lifetime: Option<chrono::Duration>,
    ) -> Result<()> {
        self.add_dids(&[(scope.to_string(), name.to_string(), did_type)], account, lifetime)
            .await
    }

    pub async fn add_dids(
        &self,
        dids: &[(String, String, DidType)],
        account: &str,
        lifetime: Option<chrono::Duration>,
    ) -> Result<()> {
        for (_, _, did_type) in dids {
            if *did_type == DidType::File {
                return Err(DidError::UnsupportedOperation(
                    "only collections (dataset/container) can be registered via add_did; files appear via attach".to_string(),
                ));
            }
        }

        let now = Utc::now();
        let expired_at = lifetime.map(|l| now + l);
        let mut tx = self.pool.begin().await.map_err(DidError::Database)?;

        for (scope, name, did_type) in dids {
            let existing: Option<(i64,)> =
                sqlx::query_as("SELECT 1 FROM dids WHERE scope = ? AND name = ?")
                    .bind(scope)
                    .bind(name)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| DidError::Database(crate::db::pool::ConnectionPool::map_lock_error(e)))?;
            if existing.is_some() {
                return Err(DidError::DataIdentifierAlreadyExists {
                    scope: scope.clone(),
                    name: name.clone(),
                });
            }

            sqlx::query(
                "INSERT INTO dids (scope, name, did_type, account, is_open, is_new, hidden, obsolete, expired_at, created_at, updated_at)
                 VALUES (?, ?, ?, ?, 1, 1, 0, 0, ?, ?, ?)",
            )
            .bind(scope)
            .bind(name)
            .bind(did_type.as_str())
            .bind(account)
            .bind(expired_at.map(|d| d.to_rfc3339()))
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db_err) if db_err.message().contains("FOREIGN KEY") => {
                    DidError::ScopeNotFound(scope.clone())
                }
                _ => DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())),
            })?;
        }

        tx.commit().await.map_err(|e| DidError::Database(crate::db::DatabaseError::ConnectionPool(e.to_string())))?;
        Ok(())
    }

    /// Attach `children` under `(scope,name)`. When `rse` is given and the
    /// parent is a DATASET, each child that doesn't already exist as a DID
    /// is created as a FILE and a replica is inserted at `rse` in the same
    /// transaction; existing files are simply linked. For a CONTAINER
    /// parent, I1/I2 are enforced by reading every child's type in one
    /// batched query. Emits one `UpdatedDid{Attach}` on success.
    pub async fn attach(
        &self,
        scope: &str,
        name: &str,
        children: &[AttachedDid],
        rse: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(DidError::Database)?;

        let parent: Option<(String, i64)> =
            sqlx::query_as("SELECT did_type, is_open FROM dids WHERE scope = ? AND name = ?")
                .bind(scope)
                .bind(name)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

        let (parent_type_str, is_open) = parent.ok_or_else(|| DidError::DataIdentifierNotFound {
            scope: scope.to_string(),
            name: name.to_string(),
        })?;
        if is_open == 0 {
            return Err(DidError::UnsupportedOperation(format!(
                "cannot attach to closed DID {scope}:{name}"
            )));
        }
        let parent_type: DidType = parent_type_str.parse()?;
        if parent_type == DidType::File {
            return Err(DidError::UnsupportedOperation(
                "cannot attach children to a FILE".to_string(),
            ));
        }

        match parent_type {
            DidType::Dataset => {
                self.attach_files_to_dataset(&mut tx, scope, name, children, rse, now)
                    .await?;
            }
            DidType::Container => {
                self.attach_collections_to_container(&mut tx, scope, name, children, now)
                    .await?;
            }
            DidType::File => unreachable!(),
        }

        self.emit_updated_did(&mut tx, scope, name, RuleEvaluationAction::Attach, now)
            .await?;

        tx.commit().await.map_err(|e| DidError::Database(crate::db::DatabaseError::ConnectionPool(e.to_string())))?;
        Ok(())
    }

    async fn attach_files_to_dataset(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        scope: &str,
        name: &str,
        children: &[AttachedDid],
        rse: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for child in children {
            let existing: Option<(String,)> =
                sqlx::query_as("SELECT did_type FROM dids WHERE scope = ? AND name = ?")
                    .bind(&child.scope)
                    .bind(&child.name)
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

            if existing.is_none() {
                sqlx::query(
                    "INSERT INTO dids (scope, name, did_type, account, bytes, is_open, is_new, hidden, obsolete, created_at, updated_at)
                     VALUES (?, ?, 'FILE', (SELECT account FROM dids WHERE scope = ? AND name = ?), ?, 0, 1, 0, 0, ?, ?)",
                )
                .bind(&child.scope)
                .bind(&child.name)
                .bind(scope)
                .bind(name)
                .bind(child.bytes)
                .bind(now.to_rfc3339())
                .bind(now.to_rfc3339())
                .execute(&mut **tx)
                .await
                .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;
            }

            let edge_exists: Option<(i64,)> = sqlx::query_as(
                "SELECT 1 FROM did_associations WHERE parent_scope = ? AND parent_name = ? AND child_scope = ? AND child_name = ?",
            )
            .bind(scope)
            .bind(name)
            .bind(&child.scope)
            .bind(&child.name)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;
            if edge_exists.is_some() {
                return Err(DidError::FileAlreadyExists {
                    scope: child.scope.clone(),
                    name: child.name.clone(),
                });
            }

            sqlx::query(
                "INSERT INTO did_associations (parent_scope, parent_name, child_scope, child_name, did_type, child_type, bytes, created_at)
                 VALUES (?, ?, ?, ?, 'DATASET', 'FILE', ?, ?)",
            )
            .bind(scope)
            .bind(name)
            .bind(&child.scope)
            .bind(&child.name)
            .bind(child.bytes)
            .bind(now.to_rfc3339())
            .execute(&mut **tx)
            .await
            .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

            if let Some(rse_id) = rse {
                sqlx::query(
                    "INSERT INTO rse_file_associations (rse_id, scope, name, state, bytes, lock_cnt, tombstone, created_at, updated_at)
                     VALUES (?, ?, ?, 'AVAILABLE', ?, 0, ?, ?, ?)",
                )
                .bind(rse_id)
                .bind(&child.scope)
                .bind(&child.name)
                .bind(child.bytes)
                .bind(now.to_rfc3339())
                .bind(now.to_rfc3339())
                .bind(now.to_rfc3339())
                .execute(&mut **tx)
                .await
                .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;
            }
        }
        Ok(())
    }

    async fn attach_collections_to_container(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        scope: &str,
        name: &str,
        children: &[AttachedDid],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut child_type: Option<DidType> = None;
        for child in children {
            let row: (String,) =
                sqlx::query_as("SELECT did_type FROM dids WHERE scope = ? AND name = ?")
                    .bind(&child.scope)
                    .bind(&child.name)
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?
                    .ok_or_else(|| DidError::DataIdentifierNotFound {
                        scope: child.scope.clone(),
                        name: child.name.clone(),
                    })?;
            let this_type: DidType = row.0.parse()?;
            if this_type == DidType::File {
                return Err(DidError::UnsupportedOperation(
                    "a container's children must all be CONTAINER or all DATASET".to_string(),
                ));
            }
            match child_type {
                None => child_type = Some(this_type),
                Some(t) if t != this_type => {
                    return Err(DidError::UnsupportedOperation(
                        "mixed collection types in a single attach are rejected".to_string(),
                    ))
                }
                _ => {}
            }

            sqlx::query(
                "INSERT INTO did_associations (parent_scope, parent_name, child_scope, child_name, did_type, child_type, created_at)
                 VALUES (?, ?, ?, ?, 'CONTAINER', ?, ?)",
            )
            .bind(scope)
            .bind(name)
            .bind(&child.scope)
            .bind(&child.name)
            .bind(this_type.as_str())
            .bind(now.to_rfc3339())
            .execute(&mut **tx)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE") => {
                    DidError::Duplicate(format!("{}:{} is already a child", child.scope, child.name))
                }
                _ => DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())),
            })?;
        }
        Ok(())
    }

    /// Row-locks the parent, verifies each child is an existing edge,
    /// forbids self-detach, removes the edges, and emits
    /// `UpdatedDid{Detach}`.
    pub async fn detach(&self, scope: &str, name: &str, children: &[DidKey]) -> Result<()> {
        let mut tx = self.pool.begin_for_update().await.map_err(DidError::Database)?;

        let parent: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM dids WHERE scope = ? AND name = ?")
            .bind(scope)
            .bind(name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| DidError::Database(crate::db::pool::ConnectionPool::map_lock_error(e)))?;
        parent.ok_or_else(|| DidError::DataIdentifierNotFound {
            scope: scope.to_string(),
            name: name.to_string(),
        })?;

        for child in children {
            if child.scope == scope && child.name == name {
                return Err(DidError::UnsupportedOperation("self-detach is forbidden".to_string()));
            }

            let deleted = sqlx::query(
                "DELETE FROM did_associations WHERE parent_scope = ? AND parent_name = ? AND child_scope = ? AND child_name = ?",
            )
            .bind(scope)
            .bind(name)
            .bind(&child.scope)
            .bind(&child.name)
            .execute(&mut *tx)
            .await
            .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

            if deleted.rows_affected() == 0 {
                return Err(DidError::DataIdentifierNotFound {
                    scope: child.scope.clone(),
                    name: child.name.clone(),
                });
            }
        }

        self.emit_updated_did(&mut tx, scope, name, RuleEvaluationAction::Detach, Utc::now())
            .await?;

        tx.commit().await.map_err(|e| DidError::Database(crate::db::DatabaseError::ConnectionPool(e.to_string())))?;
        Ok(())
    }

    /// Cascades deletion for a batch of expired DIDs, in the exact order
    /// the data model requires: locks by rule_id, dataset locks, rules,
    /// parent-side edges, child-side edges, the DID rows, then every
    /// affected replica's `lock_cnt`/`tombstone`. Replica updates use
    /// `begin_for_update` so concurrent deleters fail fast instead of
    /// deadlocking.
    pub async fn delete_dids(&self, dids: &[DidKey]) -> Result<DeleteDidsReport> {
        if dids.is_empty() {
            return Ok(DeleteDidsReport::default());
        }

        let mut report = DeleteDidsReport::default();
        let mut tx = self.pool.begin_for_update().await.map_err(DidError::Database)?;

        for did in dids {
            let rule_ids: Vec<(String,)> =
                sqlx::query_as("SELECT id FROM replication_rules WHERE scope = ? AND name = ?")
                    .bind(&did.scope)
                    .bind(&did.name)
                    .fetch_all(&mut *tx)
                    .await
                    .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

            for (rule_id,) in &rule_ids {
                let touched: Vec<(String, String)> =
                    sqlx::query_as("SELECT rse_id, scope FROM replica_locks WHERE rule_id = ?")
                        .bind(rule_id)
                        .fetch_all(&mut *tx)
                        .await
                        .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

                let deleted_locks = sqlx::query("DELETE FROM replica_locks WHERE rule_id = ?")
                    .bind(rule_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;
                report.locks += deleted_locks.rows_affected();

                let deleted_ds_locks = sqlx::query("DELETE FROM dataset_locks WHERE rule_id = ?")
                    .bind(rule_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;
                report.locks += deleted_ds_locks.rows_affected();

                for (rse_id, replica_scope) in touched {
                    let result = sqlx::query(
                        "UPDATE rse_file_associations SET lock_cnt = lock_cnt - 1,
                         tombstone = CASE WHEN lock_cnt - 1 <= 0 THEN ? ELSE NULL END,
                         updated_at = ?
                         WHERE rse_id = ? AND scope = ? AND name = ?",
                    )
                    .bind(Utc::now().to_rfc3339())
                    .bind(Utc::now().to_rfc3339())
                    .bind(&rse_id)
                    .bind(&replica_scope)
                    .bind(&did.name)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| DidError::Database(crate::db::pool::ConnectionPool::map_lock_error(e)))?;
                    report.tombstones += result.rows_affected();
                }
            }

            let deleted_rules = sqlx::query("DELETE FROM replication_rules WHERE scope = ? AND name = ?")
                .bind(&did.scope)
                .bind(&did.name)
                .execute(&mut *tx)
                .await
                .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;
            report.rules += deleted_rules.rows_affected();

            let deleted_parent_edges = sqlx::query(
                "DELETE FROM did_associations WHERE parent_scope = ? AND parent_name = ?",
            )
            .bind(&did.scope)
            .bind(&did.name)
            .execute(&mut *tx)
            .await
            .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;
            report.parent_content += deleted_parent_edges.rows_affected();

            let deleted_child_edges = sqlx::query(
                "DELETE FROM did_associations WHERE child_scope = ? AND child_name = ?",
            )
            .bind(&did.scope)
            .bind(&did.name)
            .execute(&mut *tx)
            .await
            .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;
            report.content += deleted_child_edges.rows_affected();

            let deleted_did = sqlx::query("DELETE FROM dids WHERE scope = ? AND name = ?")
                .bind(&did.scope)
                .bind(&did.name)
                .execute(&mut *tx)
                .await
                .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;
            report.dids += deleted_did.rows_affected();
        }

        if report.dids == 0 {
            return Err(DidError::DataIdentifierNotFound {
                scope: dids[0].scope.clone(),
                name: dids[0].name.clone(),
            });
        }

        tx.commit().await.map_err(|e| DidError::Database(crate::db::DatabaseError::ConnectionPool(e.to_string())))?;
        Ok(report)
    }

    pub async fn get_did(&self, scope: &str, name: &str) -> Result<DataIdentifier> {
        let row = sqlx::query_as::<_, DidRow>("SELECT * FROM dids WHERE scope = ? AND name = ?")
            .bind(scope)
            .bind(name)
            .fetch_optional(self.pool.inner())
            .await
            .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?
            .ok_or_else(|| DidError::DataIdentifierNotFound {
                scope: scope.to_string(),
                name: name.to_string(),
            })?;
        row.try_into()
    }

    /// Computes and freezes `length, bytes` as `COUNT(*), SUM(bytes)` over
    /// current edges, then fires dataset-OK messages for every rule rooted
    /// at this DID whose locks are all OK.
    pub async fn set_status(&self, scope: &str, name: &str, open: bool) -> Result<()> {
        let mut tx = self.pool.begin_for_update().await.map_err(DidError::Database)?;

        if !open {
            let (length, bytes): (i64, Option<i64>) = sqlx::query_as(
                "SELECT COUNT(*), SUM(bytes) FROM did_associations WHERE parent_scope = ? AND parent_name = ?",
            )
            .bind(scope)
            .bind(name)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

            sqlx::query("UPDATE dids SET is_open = 0, length = ?, bytes = ?, updated_at = ? WHERE scope = ? AND name = ?")
                .bind(length)
                .bind(bytes)
                .bind(Utc::now().to_rfc3339())
                .bind(scope)
                .bind(name)
                .execute(&mut *tx)
                .await
                .map_err(|e| DidError::Database(crate::db::pool::ConnectionPool::map_lock_error(e)))?;

            let ok_rules: Vec<(String,)> = sqlx::query_as(
                "SELECT id FROM replication_rules r WHERE r.scope = ? AND r.name = ?
                 AND NOT EXISTS (SELECT 1 FROM replica_locks l WHERE l.rule_id = r.id AND l.state != 'OK')",
            )
            .bind(scope)
            .bind(name)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

            for (rule_id,) in ok_rules {
                let payload = serde_json::json!({"rule_id": rule_id, "scope": scope, "name": name});
                sqlx::query(
                    "INSERT INTO messages (id, event_type, payload, created_at) VALUES (?, 'DATASET_OK', ?, ?)",
                )
                .bind(Uuid::new_v4().to_string())
                .bind(payload.to_string())
                .bind(Utc::now().to_rfc3339())
                .execute(&mut *tx)
                .await
                .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;
            }
        } else {
            sqlx::query("UPDATE dids SET is_open = 1, updated_at = ? WHERE scope = ? AND name = ?")
                .bind(Utc::now().to_rfc3339())
                .bind(scope)
                .bind(name)
                .execute(&mut *tx)
                .await
                .map_err(|e| DidError::Database(crate::db::pool::ConnectionPool::map_lock_error(e)))?;
        }

        self.emit_updated_did(&mut tx, scope, name, RuleEvaluationAction::Both, Utc::now())
            .await?;

        tx.commit().await.map_err(|e| DidError::Database(crate::db::DatabaseError::ConnectionPool(e.to_string())))?;
        Ok(())
    }

    /// Walks the DID DAG with an explicit stack (never recursion) and
    /// yields files as it finds them, optionally attaching each one's
    /// `guid`.
    pub async fn list_files(&self, scope: &str, name: &str, include_guid: bool) -> Result<Vec<DataIdentifier>> {
        let mut stack = vec![(scope.to_string(), name.to_string())];
        let mut files = Vec::new();

        while let Some((cur_scope, cur_name)) = stack.pop() {
            let children: Vec<(String, String, String)> = sqlx::query_as(
                "SELECT child_scope, child_name, child_type FROM did_associations WHERE parent_scope = ? AND parent_name = ?",
            )
            .bind(&cur_scope)
            .bind(&cur_name)
            .fetch_all(self.pool.inner())
            .await
            .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

            for (child_scope, child_name, child_type) in children {
                if child_type == "FILE" {
                    let mut file = self.get_did(&child_scope, &child_name).await?;
                    if !include_guid {
                        file.guid = None;
                    }
                    files.push(file);
                } else {
                    stack.push((child_scope, child_name));
                }
            }
        }

        Ok(files)
    }

    pub async fn list_content(&self, scope: &str, name: &str) -> Result<Vec<DidKey>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT child_scope, child_name FROM did_associations WHERE parent_scope = ? AND parent_name = ?",
        )
        .bind(scope)
        .bind(name)
        .fetch_all(self.pool.inner())
        .await
        .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

        Ok(rows.into_iter().map(|(s, n)| DidKey::new(s, n)).collect())
    }

    pub async fn list_parent_dids(&self, scope: &str, name: &str) -> Result<Vec<DidKey>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT parent_scope, parent_name FROM did_associations WHERE child_scope = ? AND child_name = ?",
        )
        .bind(scope)
        .bind(name)
        .fetch_all(self.pool.inner())
        .await
        .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

        Ok(rows.into_iter().map(|(s, n)| DidKey::new(s, n)).collect())
    }

    /// Datasets reachable from a container, walked with an explicit stack.
    pub async fn list_child_datasets(&self, scope: &str, name: &str) -> Result<Vec<DidKey>> {
        let mut stack = vec![(scope.to_string(), name.to_string())];
        let mut datasets = Vec::new();

        while let Some((cur_scope, cur_name)) = stack.pop() {
            let children: Vec<(String, String, String)> = sqlx::query_as(
                "SELECT child_scope, child_name, child_type FROM did_associations WHERE parent_scope = ? AND parent_name = ?",
            )
            .bind(&cur_scope)
            .bind(&cur_name)
            .fetch_all(self.pool.inner())
            .await
            .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

            for (child_scope, child_name, child_type) in children {
                if child_type == "DATASET" {
                    datasets.push(DidKey::new(child_scope, child_name));
                } else if child_type == "CONTAINER" {
                    stack.push((child_scope, child_name));
                }
            }
        }

        Ok(datasets)
    }

    pub async fn scope_list(&self, scope: &str) -> Result<Vec<DidKey>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT scope, name FROM dids WHERE scope = ?")
            .bind(scope)
            .fetch_all(self.pool.inner())
            .await
            .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

        Ok(rows.into_iter().map(|(s, n)| DidKey::new(s, n)).collect())
    }

    pub async fn list_new_dids(&self, did_type: Option<DidType>, limit: Option<i64>) -> Result<Vec<DidKey>> {
        let rows: Vec<(String, String)> = match did_type {
            Some(t) => sqlx::query_as("SELECT scope, name FROM dids WHERE is_new = 1 AND did_type = ? LIMIT ?")
                .bind(t.as_str())
                .bind(limit.unwrap_or(i64::MAX))
                .fetch_all(self.pool.inner())
                .await
                .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?,
            None => sqlx::query_as("SELECT scope, name FROM dids WHERE is_new = 1 LIMIT ?")
                .bind(limit.unwrap_or(i64::MAX))
                .fetch_all(self.pool.inner())
                .await
                .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?,
        };

        Ok(rows.into_iter().map(|(s, n)| DidKey::new(s, n)).collect())
    }

    pub async fn set_new_dids(&self, dids: &[DidKey], new: bool) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(DidError::Database)?;
        for did in dids {
            sqlx::query("UPDATE dids SET is_new = ? WHERE scope = ? AND name = ?")
                .bind(new as i64)
                .bind(&did.scope)
                .bind(&did.name)
                .execute(&mut *tx)
                .await
                .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;
        }
        tx.commit().await.map_err(|e| DidError::Database(crate::db::DatabaseError::ConnectionPool(e.to_string())))?;
        Ok(())
    }

    /// Sharded scan: returns `(scope,name)` pairs with `expired_at` in the
    /// past whose `fnv1a(name) mod total_workers == worker_number`.
    pub async fn list_expired_dids(
        &self,
        worker_number: u32,
        total_workers: u32,
        limit: Option<i64>,
    ) -> Result<Vec<DidKey>> {
        let now = Utc::now().to_rfc3339();
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT scope, name FROM dids WHERE expired_at IS NOT NULL AND expired_at < ? ORDER BY expired_at",
        )
        .bind(now)
        .fetch_all(self.pool.inner())
        .await
        .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

        let mut out: Vec<DidKey> = rows
            .into_iter()
            .filter(|(_, name)| sharding::belongs_to_worker(name, worker_number, total_workers))
            .map(|(s, n)| DidKey::new(s, n))
            .collect();

        if let Some(limit) = limit {
            out.truncate(limit as usize);
        }
        Ok(out)
    }

    /// `*` in `filter.name` translates to SQL `%`; exact match otherwise.
    pub async fn list_dids(&self, scope: &str, filter: &DidFilter) -> Result<Vec<DidKey>> {
        let pattern = filter.name.as_deref().map(|n| n.replace('*', "%"));
        let like_mode = pattern.as_deref().is_some_and(|p| p.contains('%'));

        let rows: Vec<(String, String)> = if let Some(pattern) = &pattern {
            if like_mode {
                sqlx::query_as("SELECT scope, name FROM dids WHERE scope = ? AND name LIKE ? LIMIT ? OFFSET ?")
                    .bind(scope)
                    .bind(pattern)
                    .bind(filter.limit.unwrap_or(i64::MAX))
                    .bind(filter.offset.unwrap_or(0))
                    .fetch_all(self.pool.inner())
                    .await
            } else {
                sqlx::query_as("SELECT scope, name FROM dids WHERE scope = ? AND name = ? LIMIT ? OFFSET ?")
                    .bind(scope)
                    .bind(pattern)
                    .bind(filter.limit.unwrap_or(i64::MAX))
                    .bind(filter.offset.unwrap_or(0))
                    .fetch_all(self.pool.inner())
                    .await
            }
        } else {
            sqlx::query_as("SELECT scope, name FROM dids WHERE scope = ? LIMIT ? OFFSET ?")
                .bind(scope)
                .bind(filter.limit.unwrap_or(i64::MAX))
                .bind(filter.offset.unwrap_or(0))
                .fetch_all(self.pool.inner())
                .await
        }
        .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

        Ok(rows.into_iter().map(|(s, n)| DidKey::new(s, n)).collect())
    }

    /// Freeform per-DID metadata, stored outside the fixed `dids` columns.
    /// `key = "lifetime"` is special-cased onto `expired_at`, mirroring how
    /// the original core treats it as a derived attribute rather than a
    /// stored key; every other key reads/writes the `did_metadata` table.
    pub async fn get_metadata(&self, scope: &str, name: &str, key: &str) -> Result<String> {
        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM dids WHERE scope = ? AND name = ?")
            .bind(scope)
            .bind(name)
            .fetch_optional(self.pool.inner())
            .await
            .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;
        if exists.is_none() {
            return Err(DidError::DataIdentifierNotFound { scope: scope.to_string(), name: name.to_string() });
        }

        if key == "lifetime" {
            let expired_at: Option<String> = sqlx::query_as::<_, (Option<String>,)>("SELECT expired_at FROM dids WHERE scope = ? AND name = ?")
                .bind(scope)
                .bind(name)
                .fetch_one(self.pool.inner())
                .await
                .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?
                .0;
            return expired_at.ok_or_else(|| DidError::KeyNotFound(key.to_string()));
        }

        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM did_metadata WHERE scope = ? AND name = ? AND key = ?")
                .bind(scope)
                .bind(name)
                .bind(key)
                .fetch_optional(self.pool.inner())
                .await
                .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

        row.map(|(v,)| v).ok_or_else(|| DidError::KeyNotFound(key.to_string()))
    }

    pub async fn set_metadata(&self, scope: &str, name: &str, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            return Err(DidError::InvalidMetadata("key must not be empty".to_string()));
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(DidError::Database)?;

        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM dids WHERE scope = ? AND name = ?")
            .bind(scope)
            .bind(name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;
        if exists.is_none() {
            return Err(DidError::DataIdentifierNotFound { scope: scope.to_string(), name: name.to_string() });
        }

        if key == "lifetime" {
            let seconds: i64 = value
                .parse()
                .map_err(|_| DidError::InvalidValueForKey { key: key.to_string(), value: value.to_string() })?;
            let expired_at = now + chrono::Duration::seconds(seconds);
            sqlx::query("UPDATE dids SET expired_at = ?, updated_at = ? WHERE scope = ? AND name = ?")
                .bind(expired_at.to_rfc3339())
                .bind(now.to_rfc3339())
                .bind(scope)
                .bind(name)
                .execute(&mut *tx)
                .await
                .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;
        } else {
            sqlx::query(
                "INSERT INTO did_metadata (scope, name, key, value, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(scope, name, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            )
            .bind(scope)
            .bind(name)
            .bind(key)
            .bind(value)
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;
        }

        tx.commit().await.map_err(|e| DidError::Database(crate::db::DatabaseError::ConnectionPool(e.to_string())))?;
        Ok(())
    }

    async fn emit_updated_did(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        scope: &str,
        name: &str,
        action: RuleEvaluationAction,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let action_str = match action {
            RuleEvaluationAction::Attach => "ATTACH",
            RuleEvaluationAction::Detach => "DETACH",
            RuleEvaluationAction::Both => "BOTH",
        };
        sqlx::query(
            "INSERT INTO updated_dids (id, scope, name, rule_evaluation_action, shard, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(scope)
        .bind(name)
        .bind(action_str)
        .bind(sharding::shard_index(name))
        .bind(now.to_rfc3339())
        .execute(&mut **tx)
        .await
        .map_err(|e| DidError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct DeleteDidsReport {
    pub locks: u64,
    pub rules: u64,
    pub parent_content: u64,
    pub content: u64,
    pub dids: u64,
    pub tombstones: u64,
}

#[derive(sqlx::FromRow)]
struct DidRow {
    scope: String,
    name: String,
    did_type: String,
    account: String,
    bytes: Option<i64>,
    length: Option<i64>,
    guid: Option<String>,
    is_open: i64,
    is_new: i64,
    hidden: i64,
    obsolete: i64,
    expired_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<DidRow> for DataIdentifier {
    type Error = DidError;

    fn try_from(row: DidRow) -> Result<Self> {
        Ok(DataIdentifier {
            scope: row.scope,
            name: row.name,
            did_type: row.did_type.parse()?,
            account: row.account,
            bytes: row.bytes,
            length: row.length,
            adler32: None,
            md5: None,
            guid: row.guid,
            is_open: row.is_open != 0,
            is_new: row.is_new != 0,
            hidden: row.hidden != 0,
            obsolete: row.obsolete != 0,
            expired_at: row
                .expired_at
                .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
                .transpose()
                .map_err(|e| DidError::InvalidMetadata(e.to_string()))?,
            created_at: DateTime::parse_from_rfc3339(&row.created_at)
                .map_err(|e| DidError::InvalidMetadata(e.to_string()))?
                .with_timezone(&Utc),
            updated_at: DateTime::parse_from_rfc3339(&row.updated_at)
                .map_err(|e| DidError::InvalidMetadata(e.to_string()))?
                .with_timezone(&Utc),
        })
    }
}

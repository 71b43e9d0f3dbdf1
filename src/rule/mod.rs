//! # Rule Engine
//!
//! Creates and evaluates replication rules: resolve an RSE expression,
//! run the selector, materialize locks and transfer orders in one
//! transaction, and submit transfers after commit (best-effort, §5
//! ordering guarantee).

use crate::did::DidStore;
use crate::error::{DidError, RuleError};
use crate::lock::LockStore;
use crate::model::{DataIdentifier, DidType, LockState, NewRule, ReplicationRule, RuleEvaluationAction, RuleGrouping, RuleState};
use crate::reeval::ReevalItem;
use crate::rse::{AccountQuotaProvider, RseAttributeProvider, RseExpressionResolver, RseSelector};
use crate::transfer::TransferSubmitter;
use chrono::Utc;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, RuleError>;

/// One file's existing placement, fetched in one join per dataset so the
/// apply algorithm never issues a per-file query for it.
#[derive(Debug, Clone)]
pub struct FileWithLocks {
    pub scope: String,
    pub name: String,
    pub bytes: i64,
    pub existing_locks: Vec<(String, LockState)>,
    /// The dataset this file was reached through, if any — `None` when
    /// the rule's root is the file itself, in which case there is no
    /// dataset for `apply_unified` to record a `DatasetLock` against.
    pub dataset: Option<(String, String)>,
}

pub struct RuleEngine<'a> {
    pool: crate::db::ConnectionPool,
    dids: &'a DidStore,
    locks: &'a LockStore,
    expression: &'a dyn RseExpressionResolver,
    attrs: &'a dyn RseAttributeProvider,
    quota: &'a dyn AccountQuotaProvider,
    transfers: &'a dyn TransferSubmitter,
}

impl<'a> RuleEngine<'a> {
    pub fn new(
        pool: crate::db::ConnectionPool,
        dids: &'a DidStore,
        locks: &'a LockStore,
        expression: &'a dyn RseExpressionResolver,
        attrs: &'a dyn RseAttributeProvider,
        quota: &'a dyn AccountQuotaProvider,
        transfers: &'a dyn TransferSubmitter,
    ) -> Self {
        Self { pool, dids, locks, expression, attrs, quota, transfers }
    }

    /// Resolves the RSE expression, builds a selector, persists one rule
    /// per input DID, applies it, and submits transfer orders after
    /// commit. A shortfall in either eligible sites or quota fails the
    /// whole call before anything is persisted.
    pub async fn add_replication_rule(
        &self,
        dids: &[(String, String)],
        new_rule: NewRule,
        rng: &mut dyn rand::RngCore,
    ) -> Result<Vec<Uuid>> {
        let rse_ids = self
            .expression
            .resolve(&new_rule.rse_expression)
            .await
            .map_err(RuleError::InvalidReplicationRule)?;

        let mut selector = RseSelector::new(
            &new_rule.account,
            &rse_ids,
            new_rule.weight.as_deref(),
            new_rule.copies,
            self.attrs,
            self.quota,
        )
        .await?;

        let mut rule_ids = Vec::with_capacity(dids.len());
        let mut transfers_to_create: Vec<(String, String, String)> = Vec::new();

        for (scope, name) in dids {
            let rule_id = Uuid::new_v4();
            let now = Utc::now();
            let rule = ReplicationRule {
                id: rule_id,
                account: new_rule.account.clone(),
                scope: scope.clone(),
                name: name.clone(),
                copies: new_rule.copies,
                rse_expression: new_rule.rse_expression.clone(),
                grouping: new_rule.grouping,
                weight: new_rule.weight.clone(),
                expires_at: new_rule.lifetime.map(|l| now + l),
                locked: new_rule.locked,
                subscription_id: new_rule.subscription_id.clone(),
                state: RuleState::Replicating,
                comment: None,
                created_at: now,
                updated_at: now,
            };
            self.persist_rule(&rule).await?;
            rule_ids.push(rule_id);

            let transfers = self.apply_rule(&rule, &mut selector, rng).await?;
            transfers_to_create.extend(transfers);
        }

        for (scope, name, rse_id) in transfers_to_create {
            self.transfers
                .submit_transfer(&scope, &name, &rse_id, &serde_json::Value::Null)
                .await;
        }

        Ok(rule_ids)
    }

    async fn persist_rule(&self, rule: &ReplicationRule) -> Result<()> {
        sqlx::query(
            "INSERT INTO replication_rules (id, scope, name, account, rse_expression, copies, grouping, weight, state, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(rule.id.to_string())
        .bind(&rule.scope)
        .bind(&rule.name)
        .bind(&rule.account)
        .bind(&rule.rse_expression)
        .bind(rule.copies as i64)
        .bind(rule.grouping.as_str())
        .bind(&rule.weight)
        .bind(rule.state.as_str())
        .bind(rule.created_at.to_rfc3339())
        .bind(rule.updated_at.to_rfc3339())
        .execute(self.pool.inner())
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE") => {
                RuleError::InvalidReplicationRule(format!("rule {} already exists", rule.id))
            }
            _ => RuleError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())),
        })?;
        Ok(())
    }

    /// Classifies the rule's root DID and materializes locks/hints/transfers
    /// per its grouping. Existing locks are always reused rather than
    /// re-created, whatever their state.
    async fn apply_rule(
        &self,
        rule: &ReplicationRule,
        selector: &mut RseSelector,
        rng: &mut dyn rand::RngCore,
    ) -> Result<Vec<(String, String, String)>> {
        self.apply_to(rule, &rule.scope.clone(), &rule.name.clone(), selector, rng).await
    }

    /// Shared by `apply_rule` (root = the rule's own DID) and the
    /// reevaluator's ATTACH handling (root = the subtree that was just
    /// attached): classifies `(scope,name)` and materializes
    /// locks/hints/transfers for it per `rule`'s grouping. Because
    /// `add_replica_lock` always reuses an existing lock rather than
    /// re-creating it, calling this on a subtree smaller than the whole
    /// rule is naturally incremental — already-locked files are no-ops.
    async fn apply_to(
        &self,
        rule: &ReplicationRule,
        scope: &str,
        name: &str,
        selector: &mut RseSelector,
        rng: &mut dyn rand::RngCore,
    ) -> Result<Vec<(String, String, String)>> {
        let root = self.dids.get_did(scope, name).await.map_err(RuleError::Did)?;

        let files = match root.did_type {
            DidType::File => vec![FileWithLocks {
                scope: root.scope.clone(),
                name: root.name.clone(),
                bytes: root.bytes.unwrap_or(0),
                existing_locks: self.existing_locks(&root.scope, &root.name).await?,
                dataset: None,
            }],
            DidType::Dataset => self.dataset_files(&root.scope, &root.name).await?,
            DidType::Container => {
                let mut files = Vec::new();
                for dataset in self.dids.list_child_datasets(&root.scope, &root.name).await.map_err(RuleError::Did)? {
                    files.extend(self.dataset_files(&dataset.scope, &dataset.name).await?);
                }
                files
            }
        };

        match rule.grouping {
            RuleGrouping::None => self.apply_none(rule, &files, selector, rng).await,
            RuleGrouping::All => self.apply_unified(rule, &files, selector, rng).await,
            RuleGrouping::Dataset => {
                // Independently per dataset within the root's closure.
                let mut transfers = Vec::new();
                if root.did_type == DidType::Dataset {
                    transfers.extend(self.apply_unified(rule, &files, selector, rng).await?);
                } else {
                    for dataset in self.dids.list_child_datasets(&root.scope, &root.name).await.map_err(RuleError::Did)? {
                        let dataset_files = self.dataset_files(&dataset.scope, &dataset.name).await?;
                        transfers.extend(self.apply_unified(rule, &dataset_files, selector, rng).await?);
                    }
                }
                Ok(transfers)
            }
        }
    }

    async fn apply_none(
        &self,
        rule: &ReplicationRule,
        files: &[FileWithLocks],
        selector: &mut RseSelector,
        rng: &mut dyn rand::RngCore,
    ) -> Result<Vec<(String, String, String)>> {
        let mut transfers = Vec::new();
        for file in files {
            let preferred: Vec<String> = file.existing_locks.iter().map(|(rse, _)| rse.clone()).collect();
            let picked = selector.select_rse(file.bytes, &preferred, &[], rng)?;

            for rse_id in picked {
                if let Some((_, state)) = file.existing_locks.iter().find(|(rse, _)| rse == &rse_id) {
                    self.locks
                        .add_replica_lock(rule.id, &rse_id, &file.scope, &file.name, &rule.account, *state, Some(file.bytes))
                        .await
                        .map_err(RuleError::Lock)?;
                } else {
                    self.locks
                        .add_replica_lock(rule.id, &rse_id, &file.scope, &file.name, &rule.account, LockState::Waiting, Some(file.bytes))
                        .await
                        .map_err(RuleError::Lock)?;
                    transfers.push((file.scope.clone(), file.name.clone(), rse_id));
                }
            }
        }
        Ok(transfers)
    }

    /// Shared by ALL (whole rule) and DATASET (one dataset's files):
    /// compute per-RSE coverage, pass descending-coverage RSEs as
    /// `preferred`, apply the chosen RSEs uniformly to every file.
    async fn apply_unified(
        &self,
        rule: &ReplicationRule,
        files: &[FileWithLocks],
        selector: &mut RseSelector,
        rng: &mut dyn rand::RngCore,
    ) -> Result<Vec<(String, String, String)>> {
        let total_size: i64 = files.iter().map(|f| f.bytes).sum();

        let mut coverage: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
        for file in files {
            for (rse_id, _) in &file.existing_locks {
                *coverage.entry(rse_id.clone()).or_insert(0) += file.bytes;
            }
        }
        let mut preferred: Vec<String> = coverage.keys().cloned().collect();
        preferred.sort_by_key(|rse_id| std::cmp::Reverse(coverage[rse_id]));

        let picked = selector.select_rse(total_size, &preferred, &[], rng)?;

        let mut transfers = Vec::new();
        for file in files {
            for rse_id in &picked {
                if let Some((_, state)) = file.existing_locks.iter().find(|(r, _)| r == rse_id) {
                    self.locks
                        .add_replica_lock(rule.id, rse_id, &file.scope, &file.name, &rule.account, *state, Some(file.bytes))
                        .await
                        .map_err(RuleError::Lock)?;
                } else {
                    self.locks
                        .add_replica_lock(rule.id, rse_id, &file.scope, &file.name, &rule.account, LockState::Waiting, Some(file.bytes))
                        .await
                        .map_err(RuleError::Lock)?;
                    transfers.push((file.scope.clone(), file.name.clone(), rse_id.clone()));
                }
            }
        }

        for rse_id in &picked {
            sqlx::query(
                "INSERT INTO rule_hints (rule_id, scope, name, rse_id) VALUES (?, ?, ?, ?)
                 ON CONFLICT(rule_id, scope, name, rse_id) DO NOTHING",
            )
            .bind(rule.id.to_string())
            .bind(&rule.scope)
            .bind(&rule.name)
            .bind(rse_id)
            .execute(self.pool.inner())
            .await
            .map_err(|e| RuleError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;
        }

        self.create_dataset_locks(rule, files, &picked).await?;

        Ok(transfers)
    }

    /// One `DatasetLock` per (dataset, picked RSE): `length`/`bytes` are
    /// the dataset's own file count/size, and `state` is `OK` only when
    /// every file in the dataset already had an `OK` lock at that RSE —
    /// otherwise a transfer for at least one file is still outstanding.
    /// Files reached without going through a dataset (a FILE-type rule
    /// root) carry no `dataset` and are skipped; `apply_none` never calls
    /// this at all, since NONE grouping has no dataset-level bookkeeping.
    async fn create_dataset_locks(
        &self,
        rule: &ReplicationRule,
        files: &[FileWithLocks],
        picked: &[String],
    ) -> Result<()> {
        let mut by_dataset: std::collections::BTreeMap<(String, String), Vec<&FileWithLocks>> =
            std::collections::BTreeMap::new();
        for file in files {
            if let Some(dataset) = &file.dataset {
                by_dataset.entry(dataset.clone()).or_default().push(file);
            }
        }

        let now = Utc::now().to_rfc3339();
        for ((ds_scope, ds_name), ds_files) in &by_dataset {
            let length = ds_files.len() as i64;
            let bytes: i64 = ds_files.iter().map(|f| f.bytes).sum();

            for rse_id in picked {
                let all_ok = ds_files
                    .iter()
                    .all(|f| f.existing_locks.iter().any(|(r, s)| r == rse_id && *s == LockState::Ok));
                let state = if all_ok { LockState::Ok } else { LockState::Waiting };

                sqlx::query(
                    "INSERT INTO dataset_locks (rule_id, rse_id, scope, name, account, state, length, bytes, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(rule_id, rse_id, scope, name) DO UPDATE SET
                         state = excluded.state, length = excluded.length, bytes = excluded.bytes, updated_at = excluded.updated_at",
                )
                .bind(rule.id.to_string())
                .bind(rse_id)
                .bind(ds_scope)
                .bind(ds_name)
                .bind(&rule.account)
                .bind(state.as_str())
                .bind(length)
                .bind(bytes)
                .bind(&now)
                .bind(&now)
                .execute(self.pool.inner())
                .await
                .map_err(|e| RuleError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;
            }
        }
        Ok(())
    }

    async fn existing_locks(&self, scope: &str, name: &str) -> Result<Vec<(String, LockState)>> {
        Ok(self
            .locks
            .get_replica_locks(scope, name)
            .await
            .map_err(RuleError::Lock)?
            .into_iter()
            .map(|l| (l.rse_id, l.state))
            .collect())
    }

    async fn dataset_files(&self, scope: &str, name: &str) -> Result<Vec<FileWithLocks>> {
        let files = self.dids.list_files(scope, name, false).await.map_err(RuleError::Did)?;
        let mut out = Vec::with_capacity(files.len());
        for file in files {
            let existing_locks = self.existing_locks(&file.scope, &file.name).await?;
            out.push(FileWithLocks {
                scope: file.scope,
                name: file.name,
                bytes: file.bytes.unwrap_or(0),
                existing_locks,
                dataset: Some((scope.to_string(), name.to_string())),
            });
        }
        Ok(out)
    }

    pub async fn get_replication_rule(&self, id: Uuid) -> Result<ReplicationRule> {
        let row: Option<RuleRow> = sqlx::query_as(
            "SELECT id, account, scope, name, copies, rse_expression, grouping, weight, state, locked, subscription_id, comment, created_at, updated_at
             FROM replication_rules WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.pool.inner())
        .await
        .map_err(|e| RuleError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

        row.ok_or_else(|| RuleError::ReplicationRuleNotFound(id.to_string()))?.try_into()
    }

    pub async fn list_replication_rules(&self, scope: &str, name: &str) -> Result<Vec<ReplicationRule>> {
        let rows: Vec<RuleRow> = sqlx::query_as(
            "SELECT id, account, scope, name, copies, rse_expression, grouping, weight, state, locked, subscription_id, comment, created_at, updated_at
             FROM replication_rules WHERE scope = ? AND name = ?",
        )
        .bind(scope)
        .bind(name)
        .fetch_all(self.pool.inner())
        .await
        .map_err(|e| RuleError::Database(crate::db::DatabaseError::QueryExecution(e.to_string())))?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Applies one drained `ReevalItem` (§4.F): ATTACH extends every rule
    /// whose root transitively contains the DID onto the newly attached
    /// subtree; DETACH reconciles every such rule's locks against what's
    /// still reachable from its root, deleting the rest; BOTH does the
    /// detach reconciliation first, then the attach extension, so a file
    /// that was detached from one dataset and attached to another in the
    /// same window ends up placed under its new parent, not its old one.
    /// A DID that no longer exists by the time this item is claimed (the
    /// undertaker erased it first) is treated as nothing left to evaluate.
    pub async fn reevaluate(&self, item: &ReevalItem, rng: &mut dyn rand::RngCore) -> Result<()> {
        let rules = self.rules_containing(&item.scope, &item.name).await?;
        if rules.is_empty() {
            return Ok(());
        }

        match item.action {
            RuleEvaluationAction::Attach => self.reevaluate_attach(&rules, &item.scope, &item.name, rng).await,
            RuleEvaluationAction::Detach => self.reevaluate_detach(&rules).await,
            RuleEvaluationAction::Both => {
                self.reevaluate_detach(&rules).await?;
                self.reevaluate_attach(&rules, &item.scope, &item.name, rng).await
            }
        }
    }

    /// Walks `(scope,name)` and its ancestors (via `list_parent_dids`),
    /// collecting every rule rooted at a node visited along the way. A
    /// rule rooted at the DID itself is included too, covering the case
    /// where the reevaluated DID is itself a dataset or container.
    async fn rules_containing(&self, scope: &str, name: &str) -> Result<Vec<ReplicationRule>> {
        let mut rules = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![(scope.to_string(), name.to_string())];

        while let Some((cur_scope, cur_name)) = stack.pop() {
            if !seen.insert((cur_scope.clone(), cur_name.clone())) {
                continue;
            }
            rules.extend(self.list_replication_rules(&cur_scope, &cur_name).await?);
            for parent in self.dids.list_parent_dids(&cur_scope, &cur_name).await.map_err(RuleError::Did)? {
                stack.push((parent.scope, parent.name));
            }
        }
        Ok(rules)
    }

    async fn reevaluate_attach(&self, rules: &[ReplicationRule], scope: &str, name: &str, rng: &mut dyn rand::RngCore) -> Result<()> {
        for rule in rules {
            let rse_ids = self.expression.resolve(&rule.rse_expression).await.map_err(RuleError::InvalidReplicationRule)?;
            let mut selector =
                RseSelector::new(&rule.account, &rse_ids, rule.weight.as_deref(), rule.copies, self.attrs, self.quota).await?;

            let transfers = match self.apply_to(rule, scope, name, &mut selector, rng).await {
                Ok(transfers) => transfers,
                Err(RuleError::Did(DidError::DataIdentifierNotFound { .. })) => continue,
                Err(e) => return Err(e),
            };

            for (s, n, rse_id) in transfers {
                self.transfers.submit_transfer(&s, &n, &rse_id, &serde_json::Value::Null).await;
            }
        }
        Ok(())
    }

    /// For each rule, recomputes the set of files still reachable from
    /// its root and deletes any lock whose `(scope,name)` fell out of
    /// that set — the file was detached from the rule's tree somewhere.
    async fn reevaluate_detach(&self, rules: &[ReplicationRule]) -> Result<()> {
        for rule in rules {
            let root = match self.dids.get_did(&rule.scope, &rule.name).await {
                Ok(root) => root,
                Err(DidError::DataIdentifierNotFound { .. }) => continue,
                Err(e) => return Err(RuleError::Did(e)),
            };
            let reachable = self.reachable_files(&root).await?;

            for (rse_id, lock_scope, lock_name) in self.locks.list_locks_for_rule(rule.id).await.map_err(RuleError::Lock)? {
                if !reachable.contains(&(lock_scope.clone(), lock_name.clone())) {
                    self.locks.delete_lock(rule.id, &rse_id, &lock_scope, &lock_name).await.map_err(RuleError::Lock)?;
                }
            }
        }
        Ok(())
    }

    async fn reachable_files(&self, root: &DataIdentifier) -> Result<std::collections::HashSet<(String, String)>> {
        let mut out = std::collections::HashSet::new();
        match root.did_type {
            DidType::File => {
                out.insert((root.scope.clone(), root.name.clone()));
            }
            DidType::Dataset => {
                for file in self.dids.list_files(&root.scope, &root.name, false).await.map_err(RuleError::Did)? {
                    out.insert((file.scope, file.name));
                }
            }
            DidType::Container => {
                for dataset in self.dids.list_child_datasets(&root.scope, &root.name).await.map_err(RuleError::Did)? {
                    for file in self.dids.list_files(&dataset.scope, &dataset.name, false).await.map_err(RuleError::Did)? {
                        out.insert((file.scope, file.name));
                    }
                }
            }
        }
        Ok(out)
    }
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    id: String,
    account: String,
    scope: String,
    name: String,
    copies: i64,
    rse_expression: String,
    grouping: String,
    weight: Option<String>,
    state: String,
    locked: i64,
    subscription_id: Option<String>,
    comment: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<RuleRow> for ReplicationRule {
    type Error = RuleError;

    fn try_from(row: RuleRow) -> Result<Self> {
        let grouping = match row.grouping.as_str() {
            "NONE" => RuleGrouping::None,
            "DATASET" => RuleGrouping::Dataset,
            "ALL" => RuleGrouping::All,
            other => return Err(RuleError::InvalidReplicationRule(format!("unknown grouping: {other}"))),
        };
        let state = match row.state.as_str() {
            "REPLICATING" => RuleState::Replicating,
            "OK" => RuleState::Ok,
            "STUCK" => RuleState::Stuck,
            other => return Err(RuleError::InvalidReplicationRule(format!("unknown rule state: {other}"))),
        };
        Ok(ReplicationRule {
            id: Uuid::parse_str(&row.id).map_err(|e| RuleError::InvalidReplicationRule(e.to_string()))?,
            account: row.account,
            scope: row.scope,
            name: row.name,
            copies: row.copies as u32,
            rse_expression: row.rse_expression,
            grouping,
            weight: row.weight,
            expires_at: None,
            locked: row.locked != 0,
            subscription_id: row.subscription_id,
            state,
            comment: row.comment,
            created_at: chrono::DateTime::parse_from_rfc3339(&row.created_at)
                .map_err(|e| RuleError::InvalidReplicationRule(e.to_string()))?
                .with_timezone(&Utc),
            updated_at: chrono::DateTime::parse_from_rfc3339(&row.updated_at)
                .map_err(|e| RuleError::InvalidReplicationRule(e.to_string()))?
                .with_timezone(&Utc),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{migrations, DatabaseConfig, MigrationManager};
    use crate::model::{AttachedDid, DidType};
    use crate::quota::SqlAccountQuota;
    use crate::rse::StaticRseExpressionResolver;
    use crate::transfer::RecordingTransferSubmitter;
    use rand::SeedableRng;

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

    struct AllowAllAttrs;
    #[async_trait::async_trait]
    impl RseAttributeProvider for AllowAllAttrs {
        async fn attributes(&self, _rse_id: &str) -> std::result::Result<std::collections::HashMap<String, String>, crate::error::SelectorError> {
            Ok(std::collections::HashMap::new())
        }
    }

    async fn seed_rse(pool: &ConnectionPool, rse_id: &str) {
        sqlx::query("INSERT INTO rses (id, name, rse_type, created_at) VALUES (?, ?, 'DISK', datetime('now'))")
            .bind(rse_id)
            .bind(rse_id)
            .execute(pool.inner())
            .await
            .unwrap();
    }

    async fn seed_quota(quota: &SqlAccountQuota, account: &str, rse_id: &str, bytes: i64) {
        quota.set_account_limit(account, rse_id, bytes).await.unwrap();
    }

    #[tokio::test]
    async fn all_grouping_reuses_existing_replica_and_submits_no_transfer() {
        let pool = test_pool().await;
        seed_rse(&pool, "RSE1").await;

        let dids = DidStore::new(pool.clone());
        let locks = LockStore::new(pool.clone());
        let quota = SqlAccountQuota::new(pool.clone());
        seed_quota(&quota, "alice", "RSE1", 10_000).await;

        dids.add_did("u", "ds1", DidType::Dataset, "alice", None).await.unwrap();
        dids.attach(
            "u",
            "ds1",
            &[AttachedDid { scope: "u".to_string(), name: "f1".to_string(), bytes: Some(100), adler32: None, md5: None }],
            None,
        )
        .await
        .unwrap();

        // Pre-existing lock/replica at RSE1: the rule should reuse it.
        locks
            .add_replica_lock(Uuid::new_v4(), "RSE1", "u", "f1", "alice", LockState::Ok, Some(100))
            .await
            .unwrap();

        let expression = StaticRseExpressionResolver::single("RSE1", vec!["RSE1".to_string()]);
        let attrs = AllowAllAttrs;
        let transfers = RecordingTransferSubmitter::default();

        let engine = RuleEngine::new(pool.clone(), &dids, &locks, &expression, &attrs, &quota, &transfers);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        let new_rule = NewRule {
            account: "alice".to_string(),
            copies: 1,
            rse_expression: "RSE1".to_string(),
            grouping: RuleGrouping::All,
            weight: None,
            lifetime: None,
            locked: false,
            subscription_id: None,
        };

        let rule_ids = engine.add_replication_rule(&[("u".to_string(), "ds1".to_string())], new_rule, &mut rng).await.unwrap();
        assert_eq!(rule_ids.len(), 1);
        assert!(transfers.calls.lock().is_empty(), "existing replica must not trigger a new transfer");
    }

    #[tokio::test]
    async fn none_grouping_submits_one_transfer_for_a_new_file() {
        let pool = test_pool().await;
        seed_rse(&pool, "RSE1").await;

        let dids = DidStore::new(pool.clone());
        let locks = LockStore::new(pool.clone());
        let quota = SqlAccountQuota::new(pool.clone());
        seed_quota(&quota, "alice", "RSE1", 10_000).await;

        dids.add_did("u", "ds1", DidType::Dataset, "alice", None).await.unwrap();
        dids.attach(
            "u",
            "ds1",
            &[AttachedDid { scope: "u".to_string(), name: "f1".to_string(), bytes: Some(50), adler32: None, md5: None }],
            None,
        )
        .await
        .unwrap();

        let expression = StaticRseExpressionResolver::single("RSE1", vec!["RSE1".to_string()]);
        let attrs = AllowAllAttrs;
        let transfers = RecordingTransferSubmitter::default();

        let engine = RuleEngine::new(pool.clone(), &dids, &locks, &expression, &attrs, &quota, &transfers);
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);

        let new_rule = NewRule {
            account: "alice".to_string(),
            copies: 1,
            rse_expression: "RSE1".to_string(),
            grouping: RuleGrouping::None,
            weight: None,
            lifetime: None,
            locked: false,
            subscription_id: None,
        };

        engine.add_replication_rule(&[("u".to_string(), "ds1".to_string())], new_rule, &mut rng).await.unwrap();
        assert_eq!(transfers.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn all_grouping_creates_a_dataset_lock() {
        let pool = test_pool().await;
        seed_rse(&pool, "RSE1").await;

        let dids = DidStore::new(pool.clone());
        let locks = LockStore::new(pool.clone());
        let quota = SqlAccountQuota::new(pool.clone());
        seed_quota(&quota, "alice", "RSE1", 10_000).await;

        dids.add_did("u", "ds1", DidType::Dataset, "alice", None).await.unwrap();
        dids.attach(
            "u",
            "ds1",
            &[AttachedDid { scope: "u".to_string(), name: "f1".to_string(), bytes: Some(50), adler32: None, md5: None }],
            None,
        )
        .await
        .unwrap();

        let expression = StaticRseExpressionResolver::single("RSE1", vec!["RSE1".to_string()]);
        let attrs = AllowAllAttrs;
        let transfers = RecordingTransferSubmitter::default();

        let engine = RuleEngine::new(pool.clone(), &dids, &locks, &expression, &attrs, &quota, &transfers);
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);

        let new_rule = NewRule {
            account: "alice".to_string(),
            copies: 1,
            rse_expression: "RSE1".to_string(),
            grouping: RuleGrouping::All,
            weight: None,
            lifetime: None,
            locked: false,
            subscription_id: None,
        };

        let rule_ids = engine.add_replication_rule(&[("u".to_string(), "ds1".to_string())], new_rule, &mut rng).await.unwrap();

        let (state, length, bytes): (String, i64, i64) = sqlx::query_as(
            "SELECT state, length, bytes FROM dataset_locks WHERE rule_id = ? AND rse_id = 'RSE1' AND scope = 'u' AND name = 'ds1'",
        )
        .bind(rule_ids[0].to_string())
        .fetch_one(pool.inner())
        .await
        .unwrap();
        assert_eq!(state, "WAITING");
        assert_eq!(length, 1);
        assert_eq!(bytes, 50);
    }

    #[tokio::test]
    async fn reevaluate_attach_extends_the_rule_to_a_newly_attached_file() {
        let pool = test_pool().await;
        seed_rse(&pool, "RSE1").await;

        let dids = DidStore::new(pool.clone());
        let locks = LockStore::new(pool.clone());
        let quota = SqlAccountQuota::new(pool.clone());
        seed_quota(&quota, "alice", "RSE1", 10_000).await;

        dids.add_did("u", "ds1", DidType::Dataset, "alice", None).await.unwrap();
        dids.attach(
            "u",
            "ds1",
            &[AttachedDid { scope: "u".to_string(), name: "f1".to_string(), bytes: Some(50), adler32: None, md5: None }],
            None,
        )
        .await
        .unwrap();

        let expression = StaticRseExpressionResolver::single("RSE1", vec!["RSE1".to_string()]);
        let attrs = AllowAllAttrs;
        let transfers = RecordingTransferSubmitter::default();
        let engine = RuleEngine::new(pool.clone(), &dids, &locks, &expression, &attrs, &quota, &transfers);
        let mut rng = rand::rngs::StdRng::seed_from_u64(5);

        let new_rule = NewRule {
            account: "alice".to_string(),
            copies: 1,
            rse_expression: "RSE1".to_string(),
            grouping: RuleGrouping::All,
            weight: None,
            lifetime: None,
            locked: false,
            subscription_id: None,
        };
        engine.add_replication_rule(&[("u".to_string(), "ds1".to_string())], new_rule, &mut rng).await.unwrap();

        // A second file lands in the dataset after the rule already exists.
        dids.attach(
            "u",
            "ds1",
            &[AttachedDid { scope: "u".to_string(), name: "f2".to_string(), bytes: Some(50), adler32: None, md5: None }],
            None,
        )
        .await
        .unwrap();

        let item = crate::reeval::ReevalItem {
            id: "x".to_string(),
            scope: "u".to_string(),
            name: "f2".to_string(),
            action: RuleEvaluationAction::Attach,
        };
        engine.reevaluate(&item, &mut rng).await.unwrap();

        let f2_locks = locks.get_replica_locks("u", "f2").await.unwrap();
        assert_eq!(f2_locks.len(), 1);
        assert_eq!(f2_locks[0].rse_id, "RSE1");
    }

    #[tokio::test]
    async fn reevaluate_detach_removes_the_lock_for_a_file_no_longer_in_the_dataset() {
        let pool = test_pool().await;
        seed_rse(&pool, "RSE1").await;

        let dids = DidStore::new(pool.clone());
        let locks = LockStore::new(pool.clone());
        let quota = SqlAccountQuota::new(pool.clone());
        seed_quota(&quota, "alice", "RSE1", 10_000).await;

        dids.add_did("u", "ds1", DidType::Dataset, "alice", None).await.unwrap();
        dids.attach(
            "u",
            "ds1",
            &[AttachedDid { scope: "u".to_string(), name: "f1".to_string(), bytes: Some(50), adler32: None, md5: None }],
            None,
        )
        .await
        .unwrap();

        let expression = StaticRseExpressionResolver::single("RSE1", vec!["RSE1".to_string()]);
        let attrs = AllowAllAttrs;
        let transfers = RecordingTransferSubmitter::default();
        let engine = RuleEngine::new(pool.clone(), &dids, &locks, &expression, &attrs, &quota, &transfers);
        let mut rng = rand::rngs::StdRng::seed_from_u64(9);

        let new_rule = NewRule {
            account: "alice".to_string(),
            copies: 1,
            rse_expression: "RSE1".to_string(),
            grouping: RuleGrouping::All,
            weight: None,
            lifetime: None,
            locked: false,
            subscription_id: None,
        };
        engine.add_replication_rule(&[("u".to_string(), "ds1".to_string())], new_rule, &mut rng).await.unwrap();
        assert_eq!(locks.get_replica_locks("u", "f1").await.unwrap().len(), 1);

        dids.detach("u", "ds1", &[crate::model::DidKey::new("u", "f1")]).await.unwrap();

        let item = crate::reeval::ReevalItem {
            id: "x".to_string(),
            scope: "u".to_string(),
            name: "f1".to_string(),
            action: RuleEvaluationAction::Detach,
        };
        engine.reevaluate(&item, &mut rng).await.unwrap();

        assert!(locks.get_replica_locks("u", "f1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reevaluate_on_a_deleted_did_is_a_noop_not_an_error() {
        let pool = test_pool().await;
        let dids = DidStore::new(pool.clone());
        let locks = LockStore::new(pool.clone());
        let quota = SqlAccountQuota::new(pool.clone());
        let expression = StaticRseExpressionResolver::single("RSE1", vec!["RSE1".to_string()]);
        let attrs = AllowAllAttrs;
        let transfers = RecordingTransferSubmitter::default();
        let engine = RuleEngine::new(pool.clone(), &dids, &locks, &expression, &attrs, &quota, &transfers);
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);

        let item = crate::reeval::ReevalItem {
            id: "x".to_string(),
            scope: "u".to_string(),
            name: "ghost".to_string(),
            action: RuleEvaluationAction::Both,
        };
        engine.reevaluate(&item, &mut rng).await.unwrap();
    }
}

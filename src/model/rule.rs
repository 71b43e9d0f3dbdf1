//! Replication rules: the declarative placement demand the engine applies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleGrouping {
    /// Every file placed independently.
    None,
    /// Placement unified per dataset within the rule's root.
    Dataset,
    /// Placement unified across the whole rule.
    All,
}

impl RuleGrouping {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleGrouping::None => "NONE",
            RuleGrouping::Dataset => "DATASET",
            RuleGrouping::All => "ALL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleState {
    /// At least one lock has not reached `OK`.
    Replicating,
    /// Every lock under this rule is `OK`.
    Ok,
    /// At least one lock is permanently `STUCK` with no other locks waiting.
    Stuck,
}

impl RuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleState::Replicating => "REPLICATING",
            RuleState::Ok => "OK",
            RuleState::Stuck => "STUCK",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationRule {
    pub id: Uuid,
    pub account: String,
    pub scope: String,
    pub name: String,
    pub copies: u32,
    pub rse_expression: String,
    pub grouping: RuleGrouping,
    /// Attribute name used for weighted selection; `None` means every
    /// eligible RSE has weight 1.
    pub weight: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub locked: bool,
    pub subscription_id: Option<String>,
    pub state: RuleState,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters accepted by `add_replication_rule`.
#[derive(Debug, Clone)]
pub struct NewRule {
    pub account: String,
    pub copies: u32,
    pub rse_expression: String,
    pub grouping: RuleGrouping,
    pub weight: Option<String>,
    pub lifetime: Option<chrono::Duration>,
    pub locked: bool,
    pub subscription_id: Option<String>,
}

/// Bookkeeping row recording which RSE a dataset/container was already
/// placed on, written by `ALL`/`DATASET` grouping and consulted during
/// incremental reevaluation so it doesn't have to rediscover coverage
/// from the lock table on every tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleHint {
    pub rule_id: Uuid,
    pub scope: String,
    pub name: String,
    pub rse_id: String,
}

//! Per-(replica, rule) locks and their dataset-level analogue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    /// An outstanding or re-submittable transfer order exists for this
    /// lock's `rse_id` (I8).
    Waiting,
    /// The transfer subsystem reported success.
    Ok,
    /// Permanent transfer failure; reversible only via rule re-evaluation.
    Stuck,
}

impl LockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Waiting => "WAITING",
            LockState::Ok => "OK",
            LockState::Stuck => "STUCK",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaLock {
    pub rule_id: Uuid,
    pub rse_id: String,
    pub scope: String,
    pub name: String,
    pub account: String,
    pub state: LockState,
    pub bytes: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetLock {
    pub rule_id: Uuid,
    pub rse_id: String,
    pub scope: String,
    pub name: String,
    pub account: String,
    pub state: LockState,
    pub length: Option<i64>,
    pub bytes: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

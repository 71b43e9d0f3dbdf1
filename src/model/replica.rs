//! Physical replicas of files at storage endpoints (RSEs).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An RSE's availability flags; an unavailable RSE is excluded from
/// selection regardless of quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RseAvailability {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
}

impl Default for RseAvailability {
    fn default() -> Self {
        Self {
            read: true,
            write: true,
            delete: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rse {
    pub id: String,
    pub name: String,
    pub deterministic: bool,
    pub staging_area: bool,
    pub availability: RseAvailability,
}

/// A copy of `(scope, name)` present at `rse_id`.
///
/// Invariants maintained by the Lock Layer, never by direct SQL elsewhere
/// in this crate: `lock_cnt == |locks referencing this replica|` (I6);
/// `tombstone.is_some() iff lock_cnt == 0` (I7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replica {
    pub rse_id: String,
    pub scope: String,
    pub name: String,
    pub state: ReplicaState,
    pub bytes: Option<i64>,
    pub lock_cnt: i64,
    pub tombstone: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Replica {
    /// True when (I7) is satisfied for the in-memory value: a zero lock
    /// count must carry a tombstone and vice versa.
    pub fn tombstone_invariant_holds(&self) -> bool {
        (self.lock_cnt == 0) == self.tombstone.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaState {
    Available,
    Copying,
    Unavailable,
}

impl ReplicaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaState::Available => "AVAILABLE",
            ReplicaState::Copying => "COPYING",
            ReplicaState::Unavailable => "UNAVAILABLE",
        }
    }
}

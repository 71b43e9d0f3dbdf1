//! Data identifiers and the edges of the DID graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of object a DID names.
///
/// `did.type == "file"` string comparisons appear in places this crate
/// is grounded on; this enum is the single authoritative representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DidType {
    File,
    Dataset,
    Container,
}

impl DidType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DidType::File => "FILE",
            DidType::Dataset => "DATASET",
            DidType::Container => "CONTAINER",
        }
    }
}

impl std::str::FromStr for DidType {
    type Err = crate::error::DidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FILE" => Ok(DidType::File),
            "DATASET" => Ok(DidType::Dataset),
            "CONTAINER" => Ok(DidType::Container),
            other => Err(crate::error::DidError::InvalidValueForKey {
                key: "type".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// `(scope, name)` — the two-component key that globally identifies a DID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DidKey {
    pub scope: String,
    pub name: String,
}

impl DidKey {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for DidKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope, self.name)
    }
}

/// A file, dataset, or container tracked by the graph store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataIdentifier {
    pub scope: String,
    pub name: String,
    pub did_type: DidType,
    pub account: String,
    pub bytes: Option<i64>,
    pub length: Option<i64>,
    pub adler32: Option<String>,
    pub md5: Option<String>,
    /// Only meaningful for `DidType::File`; surfaced by `list_files` when
    /// called with `include_guid: true`.
    pub guid: Option<String>,
    pub is_open: bool,
    pub is_new: bool,
    pub hidden: bool,
    pub obsolete: bool,
    pub expired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DataIdentifier {
    pub fn key(&self) -> DidKey {
        DidKey::new(self.scope.clone(), self.name.clone())
    }
}

/// A child spec passed to `attach` — enough to create a file replica
/// atomically (`bytes`/`adler32`/`md5`) or reference an existing child DID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachedDid {
    pub scope: String,
    pub name: String,
    pub bytes: Option<i64>,
    pub adler32: Option<String>,
    pub md5: Option<String>,
}

/// A directed edge `(scope,name) -> (child_scope,child_name)` in the DID
/// DAG, with the endpoint types denormalized for cheap invariant checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DidAssociation {
    pub parent_scope: String,
    pub parent_name: String,
    pub child_scope: String,
    pub child_name: String,
    pub did_type: DidType,
    pub child_type: DidType,
    pub bytes: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Work item emitted by the graph store on every attach/detach/set_status
/// that can affect rule placement, drained by the rule engine (4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleEvaluationAction {
    Attach,
    Detach,
    /// The fold of an ATTACH and a DETACH against the same DID observed in
    /// the same reevaluation window; see the folding note in DESIGN.md.
    Both,
}

impl RuleEvaluationAction {
    /// ATTACH∘DETACH = BOTH; folding any action with itself is a no-op;
    /// BOTH absorbs everything.
    pub fn fold(self, other: RuleEvaluationAction) -> RuleEvaluationAction {
        use RuleEvaluationAction::*;
        match (self, other) {
            (Both, _) | (_, Both) => Both,
            (Attach, Attach) => Attach,
            (Detach, Detach) => Detach,
            (Attach, Detach) | (Detach, Attach) => Both,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatedDid {
    pub id: String,
    pub scope: String,
    pub name: String,
    pub rule_evaluation_action: RuleEvaluationAction,
    pub shard: i64,
    pub created_at: DateTime<Utc>,
}

/// Filter set accepted by `list_dids`; `*` in `name` is translated to SQL
/// `%` the way the original wildcard search does, exact match otherwise.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DidFilter {
    pub name: Option<String>,
    pub did_type: Option<DidType>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_attach_then_detach_is_both() {
        assert_eq!(
            RuleEvaluationAction::Attach.fold(RuleEvaluationAction::Detach),
            RuleEvaluationAction::Both
        );
    }

    #[test]
    fn fold_repeated_attach_stays_attach() {
        assert_eq!(
            RuleEvaluationAction::Attach.fold(RuleEvaluationAction::Attach),
            RuleEvaluationAction::Attach
        );
    }

    #[test]
    fn fold_is_absorbing_once_both() {
        assert_eq!(
            RuleEvaluationAction::Both.fold(RuleEvaluationAction::Attach),
            RuleEvaluationAction::Both
        );
    }

    #[test]
    fn did_type_round_trips_through_str() {
        for t in [DidType::File, DidType::Dataset, DidType::Container] {
            let parsed: DidType = t.as_str().parse().unwrap();
            assert_eq!(parsed.as_str(), t.as_str());
        }
    }
}

//! # Error Taxonomy
//!
//! One `thiserror` enum per component (mirroring `db::DatabaseError`),
//! aggregated into [`RucioError`] at the crate boundary. Business errors
//! (`DataIdentifierNotFound`, `InsufficientTargetRSEs`, ...) are returned
//! by core functions and never retried; infra errors (`Database`,
//! broker/SMTP disconnects) are retried with bounded backoff only inside
//! the daemon loops, never inside the transactional core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DidError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid value for key '{key}': {value}")]
    InvalidValueForKey { key: String, value: String },

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("unsupported status: {0}")]
    UnsupportedStatus(String),

    #[error("data identifier not found: {scope}:{name}")]
    DataIdentifierNotFound { scope: String, name: String },

    #[error("scope not found: {0}")]
    ScopeNotFound(String),

    #[error("data identifier already exists: {scope}:{name}")]
    DataIdentifierAlreadyExists { scope: String, name: String },

    #[error("file already exists: {scope}:{name}")]
    FileAlreadyExists { scope: String, name: String },

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error(transparent)]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum SelectorError {
    #[error("invalid rule weight: {0}")]
    InvalidRuleWeight(String),

    #[error("insufficient target RSEs: needed {needed}, eligible {eligible}")]
    InsufficientTargetRSEs { needed: u32, eligible: usize },

    #[error("insufficient account limit for account '{account}' at RSE '{rse_id}'")]
    InsufficientAccountLimit { account: String, rse_id: String },

    #[error(transparent)]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("replication rule not found: {0}")]
    ReplicationRuleNotFound(String),

    #[error("invalid replication rule: {0}")]
    InvalidReplicationRule(String),

    #[error("insufficient quota: {0}")]
    InsufficientQuota(String),

    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error(transparent)]
    Did(#[from] DidError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error(transparent)]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum HermesError {
    #[error("broker not connected: {0}")]
    NotConnected(String),

    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SMTP delivery failed: {0}")]
    Smtp(String),

    #[error("DNS resolution failed: {0}")]
    DnsResolution(String),

    #[error(transparent)]
    Database(#[from] crate::db::DatabaseError),
}

/// Crate-wide error, mapped to an HTTP status at the (external) API
/// boundary and to a log line at the daemon boundary.
#[derive(Error, Debug)]
pub enum RucioError {
    #[error(transparent)]
    Did(#[from] DidError),

    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Hermes(#[from] HermesError),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("cannot authenticate: {0}")]
    CannotAuthenticate(String),

    #[error("database exception: {0}")]
    DatabaseException(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    RucioException(String),
}

pub type Result<T> = std::result::Result<T, RucioError>;

//! # rucio-core
//!
//! Control-plane core for a scientific data-management system: the DID
//! graph store, the replication-rule engine and RSE selector, the
//! replica-lock layer, the undertaker deletion daemon, the
//! re-evaluation feed connecting attach/detach events to rule
//! evaluation, and the Hermes message-delivery daemon.
//!
//! ## Architecture
//!
//! - `model`: plain shared types (DIDs, replicas, rules, locks, messages)
//! - `error`: per-component `thiserror` taxonomy, aggregated into
//!   [`error::RucioError`]
//! - `db`: connection pool, migrations, and the row-lock discipline the
//!   rest of the crate builds on
//! - `did`: the DID graph store — add/attach/detach/delete, status
//!   transitions, worker-sharded expiry scans
//! - `rse`: the weighted, quota-aware RSE selector and expression
//!   resolver contract
//! - `quota`: per-account, per-RSE limits and usage
//! - `transfer`: the outbound transfer subsystem contract the rule
//!   engine calls into
//! - `lock`: replica/dataset lock bookkeeping and the `lock_cnt`/
//!   tombstone invariant
//! - `rule`: the replication-rule engine tying `did`, `rse`, `lock`, and
//!   `transfer` together
//! - `reeval`: the append-only feed of DID work items the rule engine
//!   drains
//! - `undertaker`: the background deletion daemon
//! - `hermes`: the STOMP/SMTP message-delivery daemon
//! - `config`: environment-driven daemon configuration

#![warn(missing_docs)]

/// Plain shared types.
pub mod model;

/// Per-component error taxonomy.
pub mod error;

/// Connection pool, migrations, row-lock discipline.
pub mod db;

/// The DID graph store.
pub mod did;

/// RSE selection and expression resolution.
pub mod rse;

/// Account quota limits and usage.
pub mod quota;

/// Outbound transfer subsystem contract.
pub mod transfer;

/// Replica/dataset lock bookkeeping.
pub mod lock;

/// The replication-rule engine.
pub mod rule;

/// The DID re-evaluation feed.
pub mod reeval;

/// The background deletion daemon.
pub mod undertaker;

/// The STOMP/SMTP message-delivery daemon.
pub mod hermes;

pub use error::{RucioError, Result};

/// Crate version, exposed for daemon `--version` output and log banners.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name, exposed for log banners.
pub const NAME: &str = env!("CARGO_PKG_NAME");

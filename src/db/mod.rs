//! # Database Layer
//!
//! The connection-context layer the rest of the crate is built on. Every
//! mutating operation in `did`, `rule`, and `lock` takes an explicit
//! [`sqlx::SqlitePool`]/[`sqlx::Transaction`] rather than reaching for a
//! global/thread-local session — see the "global ORM session" design note
//! in `DESIGN.md`.
//!
//! Backed by `sqlx::SqlitePool` so the whole test suite runs against
//! `sqlite::memory:`; swapping the connection URL to a Postgres DSN is the
//! only change needed for a production deployment since the schema avoids
//! SQLite-only constructs beyond `AUTOINCREMENT`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rucio_core::db::{ConnectionPool, DatabaseConfig, MigrationManager};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = ConnectionPool::new(DatabaseConfig::default()).await?;
//! let migrations = MigrationManager::new(pool.clone());
//! migrations.init().await?;
//! migrations.run_pending().await?;
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

/// Database error types
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Connection pool error
    #[error("Connection pool error: {0}")]
    ConnectionPool(String),

    /// Query execution error
    #[error("Query execution error: {0}")]
    QueryExecution(String),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),

    /// A write raced another writer holding the same row lock
    /// (`SELECT ... FOR UPDATE NOWAIT` semantics). Callers must treat this
    /// as "abort the batch, let the next tick retry" per spec §5.
    #[error("row lock not acquired, retry next tick")]
    WouldBlock,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLx error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Result type for database operations
pub type Result<T> = std::result::Result<T, DatabaseError>;

pub mod migrations;
pub mod pool;

pub use migrations::{Migration, MigrationManager, MigrationVersion};
pub use pool::{ConnectionPool, DatabaseConfig};

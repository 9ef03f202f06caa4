//! Database access for the installation pipeline.
//!
//! Advisory locks are session-scoped, so every operation under the lock must
//! run on the exact connection that acquired it. [`InstallSession`] is that
//! pinned connection; [`Database`] hands one out per run.

pub mod connection;
pub mod ledger;
pub mod lock;

pub use connection::PgDatabase;
pub use ledger::MigrationRecord;

use anyhow::Result;
use async_trait::async_trait;

/// One database session pinned to a single connection for the duration of a
/// run: ping, advisory locking, ledger operations, and SQL execution.
///
/// Production uses [`connection::PgSession`]; tests substitute in-memory
/// stubs to count executions deterministically.
#[async_trait]
pub trait InstallSession: Send {
    async fn ping(&mut self) -> Result<()>;

    async fn acquire_lock(&mut self, key: i64) -> Result<()>;
    async fn release_lock(&mut self, key: i64) -> Result<()>;

    /// True iff the migration ledger table does not exist yet.
    async fn is_fresh(&mut self) -> Result<bool>;
    async fn ensure_ledger(&mut self) -> Result<()>;
    async fn get_migration(&mut self, version: &str) -> Result<Option<MigrationRecord>>;
    async fn record_migration(&mut self, record: &MigrationRecord) -> Result<()>;

    /// Execute a statement batch directly on the pinned connection.
    async fn execute_batch(&mut self, sql: &str) -> Result<()>;
    /// Execute a statement batch inside BEGIN/COMMIT, rolling back on error.
    async fn execute_in_transaction(&mut self, sql: &str) -> Result<()>;
}

/// Hands out pinned sessions from a connection pool.
#[async_trait]
pub trait Database: Send + Sync {
    async fn session(&self) -> Result<Box<dyn InstallSession>>;
}

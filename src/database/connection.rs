// Postgres connection management.
//
// The pool is created lazily; the first real connection attempt happens at
// the CONNECT_DB pipeline step, where failures belong.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgPool, Postgres};

use super::{ledger, lock, Database, InstallSession, MigrationRecord};
use crate::config::DbConfig;

pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    /// Build a lazily-connecting pool from the configured connection options.
    pub fn connect_lazy(cfg: &DbConfig) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy_with(cfg.connect_options());
        Self { pool }
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn session(&self) -> Result<Box<dyn InstallSession>> {
        let conn = self
            .pool
            .acquire()
            .await
            .context("failed to acquire connection")?;
        Ok(Box::new(PgSession { conn }))
    }
}

/// A single pooled connection held for the whole run. Ledger queries, lock
/// calls, and SQL execution all go through it so they share the advisory
/// lock's session.
pub struct PgSession {
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl InstallSession for PgSession {
    async fn ping(&mut self) -> Result<()> {
        self.conn.ping().await.context("failed to ping database")?;
        Ok(())
    }

    async fn acquire_lock(&mut self, key: i64) -> Result<()> {
        lock::acquire(&mut *self.conn, key).await
    }

    async fn release_lock(&mut self, key: i64) -> Result<()> {
        lock::release(&mut *self.conn, key).await
    }

    async fn is_fresh(&mut self) -> Result<bool> {
        ledger::is_fresh(&mut *self.conn).await
    }

    async fn ensure_ledger(&mut self) -> Result<()> {
        ledger::ensure_ledger(&mut *self.conn).await
    }

    async fn get_migration(&mut self, version: &str) -> Result<Option<MigrationRecord>> {
        ledger::get_migration(&mut *self.conn, version).await
    }

    async fn record_migration(&mut self, record: &MigrationRecord) -> Result<()> {
        ledger::record_migration(&mut *self.conn, record).await
    }

    async fn execute_batch(&mut self, sql: &str) -> Result<()> {
        let conn: &mut sqlx::PgConnection = &mut self.conn;
        conn.execute(sqlx::raw_sql(sql))
            .await
            .context("failed to execute statement batch")?;
        Ok(())
    }

    async fn execute_in_transaction(&mut self, sql: &str) -> Result<()> {
        let mut tx = self
            .conn
            .begin()
            .await
            .context("failed to begin transaction")?;
        let tx_conn: &mut sqlx::PgConnection = &mut tx;
        if let Err(exec_err) = tx_conn.execute(sqlx::raw_sql(sql)).await {
            if let Err(rollback_err) = tx.rollback().await {
                log::warn!(
                    "[PHASE: setup] [STEP: APPLY_MIGRATIONS] Rollback failed after execution error: {}",
                    rollback_err
                );
            }
            return Err(anyhow::Error::from(exec_err));
        }
        tx.commit().await.context("failed to commit transaction")?;
        Ok(())
    }
}

// Migration ledger persisted in `hris_meta.schema_migrations`.
//
// All queries take the caller-provided connection — the one holding the
// advisory lock.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Executor, PgConnection};

/// One row of `hris_meta.schema_migrations`: the record of the last attempt
/// to apply a version, successful or not.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct MigrationRecord {
    pub version: String,
    pub name: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
    pub execution_time_ms: i64,
    pub success: bool,
    pub error: Option<String>,
}

/// Report whether `hris_meta.schema_migrations` does not exist.
pub async fn is_fresh(conn: &mut PgConnection) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT FROM information_schema.tables
            WHERE table_schema = 'hris_meta' AND table_name = 'schema_migrations'
        )
        "#,
    )
    .fetch_one(&mut *conn)
    .await
    .context("failed to check schema_migrations existence")?;
    Ok(!exists)
}

/// Idempotently create the `hris_meta` schema and the ledger table.
pub async fn ensure_ledger(conn: &mut PgConnection) -> Result<()> {
    let stmt = sqlx::raw_sql(
        r#"
        CREATE SCHEMA IF NOT EXISTS hris_meta;
        CREATE TABLE IF NOT EXISTS hris_meta.schema_migrations (
            version           TEXT PRIMARY KEY,
            name              TEXT NOT NULL,
            checksum          TEXT NOT NULL,
            applied_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            execution_time_ms BIGINT NOT NULL DEFAULT 0,
            success           BOOLEAN NOT NULL DEFAULT FALSE,
            error             TEXT
        );
        "#,
    );
    conn.execute(stmt)
        .await
        .context("failed to create schema_migrations table")?;
    Ok(())
}

/// Return the ledger row for `version`, or `None` when not recorded.
pub async fn get_migration(
    conn: &mut PgConnection,
    version: &str,
) -> Result<Option<MigrationRecord>> {
    sqlx::query_as::<_, MigrationRecord>(
        r#"
        SELECT version, name, checksum, applied_at, execution_time_ms, success, error
        FROM hris_meta.schema_migrations
        WHERE version = $1
        "#,
    )
    .bind(version)
    .fetch_optional(&mut *conn)
    .await
    .with_context(|| format!("failed to query migration record {}", version))
}

/// Insert or replace the row for `record.version`.
pub async fn record_migration(conn: &mut PgConnection, record: &MigrationRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO hris_meta.schema_migrations
            (version, name, checksum, applied_at, execution_time_ms, success, error)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (version) DO UPDATE SET
            name              = EXCLUDED.name,
            checksum          = EXCLUDED.checksum,
            applied_at        = EXCLUDED.applied_at,
            execution_time_ms = EXCLUDED.execution_time_ms,
            success           = EXCLUDED.success,
            error             = EXCLUDED.error
        "#,
    )
    .bind(&record.version)
    .bind(&record.name)
    .bind(&record.checksum)
    .bind(record.applied_at)
    .bind(record.execution_time_ms)
    .bind(record.success)
    .bind(&record.error)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("failed to record migration {}", record.version))?;
    Ok(())
}

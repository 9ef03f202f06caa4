// Session-scoped advisory locking.
//
// `pg_advisory_lock` blocks until the lock is granted and is released on
// explicit unlock or when the session's connection closes. Cross-instance
// exclusion relies on this; the in-process gate only covers one agent.

use anyhow::{Context, Result};
use sqlx::PgConnection;

pub async fn acquire(conn: &mut PgConnection, key: i64) -> Result<()> {
    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(key)
        .execute(&mut *conn)
        .await
        .context("failed to acquire advisory lock")?;
    Ok(())
}

pub async fn release(conn: &mut PgConnection, key: i64) -> Result<()> {
    sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(key)
        .execute(&mut *conn)
        .await
        .context("failed to release advisory lock")?;
    Ok(())
}

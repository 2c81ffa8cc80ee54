//! SQLite pool setup and schema bootstrap.
//!
//! Production deployments run explicit migrations; this bootstrap exists for
//! dev and test databases. Every statement is idempotent and safe on restart,
//! including the add-column guards for columns that postdate the original
//! `jobs` and `pic_teams` tables.

use crate::error::Result;
use anyhow::Context as _;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row as _, SqlitePool};
use std::str::FromStr;

/// Open (and create if missing) the SQLite database behind `database_url`.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("invalid database url: {database_url}"))?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("failed to connect to SQLite")?;

    Ok(pool)
}

/// Ensure every table and column the core reads or writes exists.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    for statement in CREATE_TABLES {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("schema bootstrap statement failed")?;
    }

    // Columns added after the initial jobs table shipped.
    add_column_if_missing(pool, "jobs", "end_date", "DATE").await?;
    add_column_if_missing(pool, "jobs", "pic_team", "VARCHAR(100)").await?;
    add_column_if_missing(pool, "pic_teams", "slack_handle", "VARCHAR(255)").await?;

    Ok(())
}

const CREATE_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        email TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL DEFAULT '',
        role TEXT NOT NULL DEFAULT 'viewer',
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        cron_expression TEXT NOT NULL,
        target_url TEXT,
        github_owner TEXT,
        github_repo TEXT,
        github_workflow_name TEXT,
        metadata TEXT,
        enable_email_notifications INTEGER NOT NULL DEFAULT 0,
        notification_emails TEXT,
        notify_on_success INTEGER NOT NULL DEFAULT 0,
        category TEXT,
        created_by TEXT REFERENCES users(id),
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_executions (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        status TEXT NOT NULL,
        trigger_type TEXT NOT NULL,
        started_at TIMESTAMP NOT NULL,
        completed_at TIMESTAMP,
        duration_seconds REAL,
        execution_type TEXT,
        target TEXT,
        response_status INTEGER,
        error_message TEXT,
        output TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_job_executions_job_id
        ON job_executions(job_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS notifications (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        title TEXT NOT NULL,
        message TEXT NOT NULL,
        type TEXT NOT NULL,
        related_job_id TEXT REFERENCES jobs(id) ON DELETE SET NULL,
        related_execution_id TEXT REFERENCES job_executions(id) ON DELETE SET NULL,
        is_read INTEGER NOT NULL DEFAULT 0,
        read_at TIMESTAMP,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pic_teams (
        id TEXT PRIMARY KEY,
        slug TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_categories (
        id TEXT PRIMARY KEY,
        slug TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS slack_settings (
        id TEXT PRIMARY KEY,
        is_enabled INTEGER NOT NULL DEFAULT 0,
        webhook_url TEXT,
        channel TEXT,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
];

async fn add_column_if_missing(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    column_type: &str,
) -> Result<()> {
    let rows = sqlx::query(&format!("PRAGMA table_info('{table}')"))
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to inspect table {table}"))?;

    let exists = rows.iter().any(|row| {
        row.try_get::<String, _>("name")
            .map(|name| name == column)
            .unwrap_or(false)
    });

    if !exists {
        sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {column_type}"))
            .execute(pool)
            .await
            .with_context(|| format!("failed to add column {table}.{column}"))?;
        tracing::info!(table, column, "schema bootstrap: added missing column");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should connect")
    }

    #[tokio::test]
    async fn ensure_schema_is_idempotent() {
        let pool = memory_pool().await;
        ensure_schema(&pool).await.expect("first bootstrap");
        ensure_schema(&pool).await.expect("second bootstrap");

        let columns = sqlx::query("PRAGMA table_info('jobs')")
            .fetch_all(&pool)
            .await
            .expect("pragma should run");
        let names: Vec<String> = columns
            .iter()
            .map(|row| row.try_get::<String, _>("name").unwrap())
            .collect();
        assert!(names.contains(&"end_date".to_string()));
        assert!(names.contains(&"pic_team".to_string()));
    }

    #[tokio::test]
    async fn add_column_guard_upgrades_legacy_table() {
        let pool = memory_pool().await;
        sqlx::query(
            "CREATE TABLE pic_teams (
                id TEXT PRIMARY KEY,
                slug TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&pool)
        .await
        .expect("legacy table should be created");

        ensure_schema(&pool).await.expect("bootstrap should upgrade");

        sqlx::query("SELECT slack_handle FROM pic_teams")
            .fetch_all(&pool)
            .await
            .expect("slack_handle column should exist");
    }
}

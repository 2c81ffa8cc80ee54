//! Minimal user reads for notification fan-out.
//!
//! The core never writes users; it only needs the full id set for broadcasts
//! and the active-admin set for targeted warnings.

use crate::error::Result;
use anyhow::Context as _;
use sqlx::SqlitePool;

#[derive(Debug, Clone)]
pub struct UserStore {
    pool: SqlitePool,
}

impl UserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Ids of every known user, for broadcast notifications.
    pub async fn list_all_ids(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar("SELECT id FROM users ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .context("failed to list user ids")?;
        Ok(ids)
    }

    /// Ids of active admins, for targeted job warnings.
    pub async fn list_active_admin_ids(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM users WHERE role = 'admin' AND is_active = 1 ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list active admin ids")?;
        Ok(ids)
    }

    /// Test/bootstrap helper: insert a user row.
    pub async fn insert(
        &self,
        id: &str,
        username: &str,
        email: &str,
        role: &str,
        is_active: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, username, email, role, is_active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(username)
        .bind(email)
        .bind(role)
        .bind(is_active)
        .bind(chrono::Utc::now())
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to insert user")?;
        Ok(())
    }
}

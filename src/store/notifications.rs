//! In-app notification storage (SQLite).

use crate::error::Result;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row as _, SqlitePool};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Error,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Info => "info",
            NotificationKind::Success => "success",
            NotificationKind::Warning => "warning",
            NotificationKind::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "info" => Some(NotificationKind::Info),
            "success" => Some(NotificationKind::Success),
            "warning" => Some(NotificationKind::Warning),
            "error" => Some(NotificationKind::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One notification row for one user. The job/execution references are weak:
/// they null out when the referenced row is deleted.
#[derive(Debug, Clone)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub related_job_id: Option<String>,
    pub related_execution_id: Option<String>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NotificationStore {
    pool: SqlitePool,
}

impl NotificationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        user_id: &str,
        title: &str,
        message: &str,
        kind: NotificationKind,
        related_job_id: Option<&str>,
        related_execution_id: Option<&str>,
    ) -> Result<Notification> {
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();

        sqlx::query(
            "INSERT INTO notifications (
                id, user_id, title, message, type,
                related_job_id, related_execution_id, is_read, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(title)
        .bind(message)
        .bind(kind.as_str())
        .bind(related_job_id)
        .bind(related_execution_id)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .context("failed to insert notification")?;

        Ok(Notification {
            id,
            user_id: user_id.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            kind,
            related_job_id: related_job_id.map(str::to_string),
            related_execution_id: related_execution_id.map(str::to_string),
            is_read: false,
            read_at: None,
            created_at,
        })
    }

    pub async fn list_for_user(&self, user_id: &str, limit: i64) -> Result<Vec<Notification>> {
        let rows = sqlx::query(
            "SELECT id, user_id, title, message, type, related_job_id,
                    related_execution_id, is_read, read_at, created_at
             FROM notifications WHERE user_id = ?
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await
        .context("failed to list notifications")?;

        rows.into_iter().map(notification_from_row).collect()
    }

    pub async fn list_by_title(&self, title: &str) -> Result<Vec<Notification>> {
        let rows = sqlx::query(
            "SELECT id, user_id, title, message, type, related_job_id,
                    related_execution_id, is_read, read_at, created_at
             FROM notifications WHERE title = ?
             ORDER BY created_at DESC",
        )
        .bind(title)
        .fetch_all(&self.pool)
        .await
        .context("failed to list notifications by title")?;

        rows.into_iter().map(notification_from_row).collect()
    }

    /// Mark one notification read. Returns false if it was already read or
    /// does not exist.
    pub async fn mark_read(&self, notification_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE notifications SET is_read = 1, read_at = ?
             WHERE id = ? AND is_read = 0",
        )
        .bind(Utc::now())
        .bind(notification_id)
        .execute(&self.pool)
        .await
        .context("failed to mark notification read")?;

        Ok(result.rows_affected() > 0)
    }
}

fn notification_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Notification> {
    let kind_value: String = row
        .try_get("type")
        .context("failed to read notification type")?;
    let kind = NotificationKind::parse(&kind_value)
        .with_context(|| format!("invalid notification type in database: {kind_value}"))?;

    Ok(Notification {
        id: row.try_get("id").context("failed to read notification id")?,
        user_id: row
            .try_get("user_id")
            .context("failed to read notification user_id")?,
        title: row
            .try_get("title")
            .context("failed to read notification title")?,
        message: row
            .try_get("message")
            .context("failed to read notification message")?,
        kind,
        related_job_id: row.try_get("related_job_id").ok(),
        related_execution_id: row.try_get("related_execution_id").ok(),
        is_read: row
            .try_get("is_read")
            .context("failed to read notification is_read")?,
        read_at: row.try_get("read_at").ok(),
        created_at: row
            .try_get("created_at")
            .context("failed to read notification created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_store() -> NotificationStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should connect");
        crate::db::ensure_schema(&pool)
            .await
            .expect("schema should bootstrap");
        NotificationStore::new(pool)
    }

    #[tokio::test]
    async fn create_and_mark_read() {
        let store = setup_store().await;
        let created = store
            .create(
                "user-1",
                "Job Failed",
                "Job \"nightly\" failed: boom",
                NotificationKind::Error,
                Some("job-1"),
                None,
            )
            .await
            .expect("notification should insert");

        assert!(!created.is_read);
        assert!(store.mark_read(&created.id).await.expect("mark read"));
        assert!(!store.mark_read(&created.id).await.expect("second mark is a no-op"));

        let listed = store.list_for_user("user-1", 10).await.expect("list");
        assert_eq!(listed.len(), 1);
        assert!(listed[0].is_read);
        assert!(listed[0].read_at.is_some());
        assert_eq!(listed[0].kind, NotificationKind::Error);
    }
}

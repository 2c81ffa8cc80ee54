//! Global Slack integration settings (SQLite singleton).

use crate::error::Result;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sqlx::{Row as _, SqlitePool};

/// Admin-managed Slack settings. The webhook URL is stored in plaintext.
#[derive(Debug, Clone)]
pub struct SlackSettings {
    pub id: String,
    pub is_enabled: bool,
    pub webhook_url: Option<String>,
    pub channel: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SlackSettings {
    /// Enabled iff the flag is set and a webhook URL is present.
    pub fn effective_webhook(&self) -> Option<(&str, Option<&str>)> {
        if !self.is_enabled {
            return None;
        }
        let url = self.webhook_url.as_deref()?.trim();
        if url.is_empty() {
            return None;
        }
        Some((url, self.channel.as_deref()))
    }
}

#[derive(Debug, Clone)]
pub struct SlackStore {
    pool: SqlitePool,
}

impl SlackStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self) -> Result<Option<SlackSettings>> {
        let row = sqlx::query(
            "SELECT id, is_enabled, webhook_url, channel, created_at, updated_at
             FROM slack_settings LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch slack settings")?;

        row.map(settings_from_row).transpose()
    }

    /// Create or replace the singleton settings row.
    pub async fn upsert(
        &self,
        is_enabled: bool,
        webhook_url: Option<&str>,
        channel: Option<&str>,
    ) -> Result<SlackSettings> {
        let now = Utc::now();

        if let Some(existing) = self.get().await? {
            sqlx::query(
                "UPDATE slack_settings SET is_enabled = ?, webhook_url = ?, channel = ?, updated_at = ?
                 WHERE id = ?",
            )
            .bind(is_enabled)
            .bind(webhook_url)
            .bind(channel)
            .bind(now)
            .bind(&existing.id)
            .execute(&self.pool)
            .await
            .context("failed to update slack settings")?;
        } else {
            sqlx::query(
                "INSERT INTO slack_settings (id, is_enabled, webhook_url, channel, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(is_enabled)
            .bind(webhook_url)
            .bind(channel)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .context("failed to insert slack settings")?;
        }

        self.get()
            .await?
            .context("slack settings written but not found")
            .map_err(Into::into)
    }

    /// Convenience for callers that only need "should I post, and where".
    pub async fn effective_config(&self) -> Result<Option<(String, Option<String>)>> {
        Ok(self.get().await?.and_then(|settings| {
            settings
                .effective_webhook()
                .map(|(url, channel)| (url.to_string(), channel.map(str::to_string)))
        }))
    }
}

fn settings_from_row(row: sqlx::sqlite::SqliteRow) -> Result<SlackSettings> {
    Ok(SlackSettings {
        id: row.try_get("id").context("failed to read slack settings id")?,
        is_enabled: row
            .try_get("is_enabled")
            .context("failed to read slack settings is_enabled")?,
        webhook_url: row.try_get("webhook_url").ok(),
        channel: row.try_get("channel").ok(),
        created_at: row
            .try_get("created_at")
            .context("failed to read slack settings created_at")?,
        updated_at: row
            .try_get("updated_at")
            .context("failed to read slack settings updated_at")?,
    })
}

//! PIC team and job category storage (SQLite).

use crate::error::Result;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sqlx::{Row as _, SqlitePool};

/// Category slug that is seeded with the system and can never be renamed
/// or deactivated.
pub const RESERVED_CATEGORY_SLUG: &str = "general";

/// A person-in-charge team. Disabled teams cannot be assigned to active jobs
/// (enforced at the API seam); the scheduler only reads `slack_handle` for
/// mentions.
#[derive(Debug, Clone)]
pub struct PicTeam {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub slack_handle: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct JobCategory {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TaxonomyStore {
    pool: SqlitePool,
}

impl TaxonomyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_team(
        &self,
        slug: &str,
        name: &str,
        slack_handle: Option<&str>,
    ) -> Result<PicTeam> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO pic_teams (id, slug, name, slack_handle, is_active, created_at, updated_at)
             VALUES (?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(&id)
        .bind(slug)
        .bind(name)
        .bind(slack_handle)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to insert pic team")?;

        self.get_team(slug)
            .await?
            .context("pic team inserted but not found")
            .map_err(Into::into)
    }

    pub async fn get_team(&self, slug: &str) -> Result<Option<PicTeam>> {
        let row = sqlx::query(
            "SELECT id, slug, name, slack_handle, is_active, created_at, updated_at
             FROM pic_teams WHERE slug = ?",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch pic team")?;

        row.map(team_from_row).transpose()
    }

    /// Slack handle for a team slug, normalized: empty handles come back as
    /// None.
    pub async fn team_slack_handle(&self, slug: &str) -> Result<Option<String>> {
        let team = self.get_team(slug).await?;
        Ok(team
            .and_then(|team| team.slack_handle)
            .map(|handle| handle.trim().to_string())
            .filter(|handle| !handle.is_empty()))
    }

    pub async fn create_category(&self, slug: &str, name: &str) -> Result<JobCategory> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO job_categories (id, slug, name, is_active, created_at, updated_at)
             VALUES (?, ?, ?, 1, ?, ?)",
        )
        .bind(&id)
        .bind(slug)
        .bind(name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to insert job category")?;

        self.get_category(slug)
            .await?
            .context("job category inserted but not found")
            .map_err(Into::into)
    }

    pub async fn get_category(&self, slug: &str) -> Result<Option<JobCategory>> {
        let row = sqlx::query(
            "SELECT id, slug, name, is_active, created_at, updated_at
             FROM job_categories WHERE slug = ?",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch job category")?;

        row.map(category_from_row).transpose()
    }

    /// Rename or (de)activate a category. The reserved `general` category
    /// refuses both.
    pub async fn update_category(
        &self,
        slug: &str,
        name: Option<&str>,
        is_active: Option<bool>,
    ) -> Result<Option<JobCategory>> {
        if slug == RESERVED_CATEGORY_SLUG && (name.is_some() || is_active == Some(false)) {
            return Err(anyhow::anyhow!(
                "category '{RESERVED_CATEGORY_SLUG}' is reserved and cannot be renamed or disabled"
            )
            .into());
        }

        let Some(current) = self.get_category(slug).await? else {
            return Ok(None);
        };

        sqlx::query(
            "UPDATE job_categories SET name = ?, is_active = ?, updated_at = ? WHERE slug = ?",
        )
        .bind(name.unwrap_or(&current.name))
        .bind(is_active.unwrap_or(current.is_active))
        .bind(Utc::now())
        .bind(slug)
        .execute(&self.pool)
        .await
        .context("failed to update job category")?;

        self.get_category(slug).await
    }
}

fn team_from_row(row: sqlx::sqlite::SqliteRow) -> Result<PicTeam> {
    Ok(PicTeam {
        id: row.try_get("id").context("failed to read team id")?,
        slug: row.try_get("slug").context("failed to read team slug")?,
        name: row.try_get("name").context("failed to read team name")?,
        slack_handle: row.try_get("slack_handle").ok(),
        is_active: row
            .try_get("is_active")
            .context("failed to read team is_active")?,
        created_at: row
            .try_get("created_at")
            .context("failed to read team created_at")?,
        updated_at: row
            .try_get("updated_at")
            .context("failed to read team updated_at")?,
    })
}

fn category_from_row(row: sqlx::sqlite::SqliteRow) -> Result<JobCategory> {
    Ok(JobCategory {
        id: row.try_get("id").context("failed to read category id")?,
        slug: row.try_get("slug").context("failed to read category slug")?,
        name: row.try_get("name").context("failed to read category name")?,
        is_active: row
            .try_get("is_active")
            .context("failed to read category is_active")?,
        created_at: row
            .try_get("created_at")
            .context("failed to read category created_at")?,
        updated_at: row
            .try_get("updated_at")
            .context("failed to read category updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_store() -> TaxonomyStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should connect");
        crate::db::ensure_schema(&pool)
            .await
            .expect("schema should bootstrap");
        TaxonomyStore::new(pool)
    }

    #[tokio::test]
    async fn team_handle_normalizes_blank_to_none() {
        let store = setup_store().await;
        store.create_team("team-a", "Team A", Some("@team-a")).await.unwrap();
        store.create_team("team-b", "Team B", Some("   ")).await.unwrap();
        store.create_team("team-c", "Team C", None).await.unwrap();

        assert_eq!(
            store.team_slack_handle("team-a").await.unwrap().as_deref(),
            Some("@team-a")
        );
        assert_eq!(store.team_slack_handle("team-b").await.unwrap(), None);
        assert_eq!(store.team_slack_handle("team-c").await.unwrap(), None);
        assert_eq!(store.team_slack_handle("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reserved_category_refuses_rename() {
        let store = setup_store().await;
        store.create_category("general", "General").await.unwrap();

        let error = store
            .update_category("general", Some("Renamed"), None)
            .await
            .expect_err("rename of reserved category must fail");
        assert!(error.to_string().contains("reserved"));

        // Re-activating (a no-op) is allowed.
        store
            .update_category("general", None, Some(true))
            .await
            .expect("activation no-op should pass");
    }
}

//! Job CRUD storage (SQLite).

use crate::error::Result;
use anyhow::Context as _;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sqlx::{Row as _, SqlitePool};

/// A scheduled cron job.
///
/// Either `target_url` is set or the GitHub triple is fully set; the store
/// rejects writes that violate this.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub cron_expression: String,
    pub is_active: bool,
    /// Date-only, compared in the scheduler timezone at runtime.
    pub end_date: Option<NaiveDate>,
    pub target_url: Option<String>,
    pub github_owner: Option<String>,
    pub github_repo: Option<String>,
    pub github_workflow_name: Option<String>,
    pub metadata: Value,
    pub pic_team: Option<String>,
    pub category: Option<String>,
    pub created_by: Option<String>,
    pub enable_email_notifications: bool,
    pub notify_on_success: bool,
    pub notification_emails: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// True when all three GitHub workflow coordinates are present.
    pub fn has_github_target(&self) -> bool {
        self.github_owner.is_some()
            && self.github_repo.is_some()
            && self.github_workflow_name.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateJobInput {
    pub name: String,
    pub cron_expression: String,
    pub end_date: Option<NaiveDate>,
    pub target_url: Option<String>,
    pub github_owner: Option<String>,
    pub github_repo: Option<String>,
    pub github_workflow_name: Option<String>,
    pub metadata: Value,
    pub pic_team: Option<String>,
    pub category: Option<String>,
    pub created_by: Option<String>,
    pub enable_email_notifications: bool,
    pub notify_on_success: bool,
    pub notification_emails: Vec<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, input: CreateJobInput) -> Result<Job> {
        validate_target(
            input.target_url.as_deref(),
            input.github_owner.as_deref(),
            input.github_repo.as_deref(),
            input.github_workflow_name.as_deref(),
        )?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let metadata_json = metadata_to_column(&input.metadata);
        let emails = emails_to_column(&input.notification_emails);

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, name, cron_expression, is_active, end_date, target_url,
                github_owner, github_repo, github_workflow_name, metadata,
                pic_team, category, created_by, enable_email_notifications,
                notify_on_success, notification_emails, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&input.name)
        .bind(input.cron_expression.trim())
        .bind(input.is_active)
        .bind(input.end_date)
        .bind(&input.target_url)
        .bind(&input.github_owner)
        .bind(&input.github_repo)
        .bind(&input.github_workflow_name)
        .bind(&metadata_json)
        .bind(&input.pic_team)
        .bind(&input.category)
        .bind(&input.created_by)
        .bind(input.enable_email_notifications)
        .bind(input.notify_on_success)
        .bind(&emails)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to insert job")?;

        self.get(&id)
            .await?
            .context("job inserted but not found")
            .map_err(Into::into)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("{JOB_SELECT} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch job")?;

        row.map(job_from_row).transpose()
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("{JOB_SELECT} WHERE name = ?"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch job by name")?;

        row.map(job_from_row).transpose()
    }

    pub async fn list_all(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!("{JOB_SELECT} ORDER BY created_at ASC"))
            .fetch_all(&self.pool)
            .await
            .context("failed to list jobs")?;

        rows.into_iter().map(job_from_row).collect()
    }

    /// Flip `is_active` and bump `updated_at`. Returns false when the job
    /// does not exist.
    pub async fn set_active(&self, id: &str, is_active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE jobs SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(is_active)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to update job active flag")?;

        Ok(result.rows_affected() > 0)
    }

    /// Active jobs whose end date has already passed.
    pub async fn list_expired_active(&self, today: NaiveDate) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "{JOB_SELECT} WHERE is_active = 1 AND end_date IS NOT NULL AND end_date < ?"
        ))
        .bind(today)
        .fetch_all(&self.pool)
        .await
        .context("failed to list expired jobs")?;

        rows.into_iter().map(job_from_row).collect()
    }

    /// Jobs whose end date falls inside `[today, cutoff]`, active or not.
    pub async fn list_ending_between(
        &self,
        today: NaiveDate,
        cutoff: NaiveDate,
    ) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "{JOB_SELECT} WHERE end_date IS NOT NULL AND end_date >= ? AND end_date <= ?"
        ))
        .bind(today)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("failed to list jobs ending soon")?;

        rows.into_iter().map(job_from_row).collect()
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to delete job")?;

        Ok(result.rows_affected() > 0)
    }
}

/// Target invariant: a webhook URL, or a complete GitHub workflow triple.
/// Never both empty, never a partial triple.
pub fn validate_target(
    target_url: Option<&str>,
    github_owner: Option<&str>,
    github_repo: Option<&str>,
    github_workflow_name: Option<&str>,
) -> Result<()> {
    let has_url = target_url.map(|url| !url.trim().is_empty()).unwrap_or(false);
    let github_fields = [github_owner, github_repo, github_workflow_name];
    let set_count = github_fields
        .iter()
        .filter(|field| field.map(|value| !value.trim().is_empty()).unwrap_or(false))
        .count();

    if set_count != 0 && set_count != 3 {
        return Err(anyhow::anyhow!(
            "incomplete GitHub target: owner, repo and workflow name must all be set"
        )
        .into());
    }
    if !has_url && set_count == 0 {
        return Err(anyhow::anyhow!(
            "job needs a target: either a webhook URL or a GitHub workflow"
        )
        .into());
    }

    Ok(())
}

const JOB_SELECT: &str = "SELECT id, name, cron_expression, is_active, end_date, target_url, \
     github_owner, github_repo, github_workflow_name, metadata, pic_team, category, \
     created_by, enable_email_notifications, notify_on_success, notification_emails, \
     created_at, updated_at FROM jobs";

fn metadata_to_column(metadata: &Value) -> Option<String> {
    match metadata {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        other => Some(other.to_string()),
    }
}

fn emails_to_column(emails: &[String]) -> Option<String> {
    let joined: Vec<&str> = emails
        .iter()
        .map(|email| email.trim())
        .filter(|email| !email.is_empty())
        .collect();
    if joined.is_empty() {
        None
    } else {
        Some(joined.join(","))
    }
}

fn parse_metadata(value: Option<String>) -> Value {
    value
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
}

fn parse_emails(value: Option<String>) -> Vec<String> {
    value
        .map(|raw| {
            raw.split(',')
                .map(|email| email.trim().to_string())
                .filter(|email| !email.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn job_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Job> {
    Ok(Job {
        id: row.try_get("id").context("failed to read job id")?,
        name: row.try_get("name").context("failed to read job name")?,
        cron_expression: row
            .try_get("cron_expression")
            .context("failed to read job cron_expression")?,
        is_active: row
            .try_get("is_active")
            .context("failed to read job is_active")?,
        end_date: row.try_get("end_date").ok(),
        target_url: row.try_get("target_url").ok(),
        github_owner: row.try_get("github_owner").ok(),
        github_repo: row.try_get("github_repo").ok(),
        github_workflow_name: row.try_get("github_workflow_name").ok(),
        metadata: parse_metadata(row.try_get("metadata").ok()),
        pic_team: row.try_get("pic_team").ok(),
        category: row.try_get("category").ok(),
        created_by: row.try_get("created_by").ok(),
        enable_email_notifications: row
            .try_get("enable_email_notifications")
            .context("failed to read job enable_email_notifications")?,
        notify_on_success: row
            .try_get("notify_on_success")
            .context("failed to read job notify_on_success")?,
        notification_emails: parse_emails(row.try_get("notification_emails").ok()),
        created_at: row
            .try_get("created_at")
            .context("failed to read job created_at")?,
        updated_at: row
            .try_get("updated_at")
            .context("failed to read job updated_at")?,
    })
}

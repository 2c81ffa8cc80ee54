//! Job execution history storage (SQLite).

use crate::error::Result;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row as _, SqlitePool};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(ExecutionStatus::Running),
            "success" => Some(ExecutionStatus::Success),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Scheduled,
    Manual,
}

impl TriggerType {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerType::Scheduled => "scheduled",
            TriggerType::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(TriggerType::Scheduled),
            "manual" => Some(TriggerType::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the dispatch reached out. Absent when the job had no valid target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    GithubActions,
    Webhook,
}

impl ExecutionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionType::GithubActions => "github_actions",
            ExecutionType::Webhook => "webhook",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "github_actions" => Some(ExecutionType::GithubActions),
            "webhook" => Some(ExecutionType::Webhook),
            _ => None,
        }
    }
}

/// One recorded firing of a job.
///
/// Invariant: `status == Running` iff `completed_at` is null, and
/// `duration_seconds = completed_at - started_at` once completed.
#[derive(Debug, Clone)]
pub struct JobExecution {
    pub id: String,
    pub job_id: String,
    pub status: ExecutionStatus,
    pub trigger_type: TriggerType,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub execution_type: Option<ExecutionType>,
    pub target: Option<String>,
    pub response_status: Option<i64>,
    pub error_message: Option<String>,
    pub output: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutionStore {
    pool: SqlitePool,
}

impl ExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a fresh `running` row at the start of a dispatch.
    pub async fn insert_running(
        &self,
        job_id: &str,
        trigger_type: TriggerType,
    ) -> Result<JobExecution> {
        let id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();

        sqlx::query(
            "INSERT INTO job_executions (id, job_id, status, trigger_type, started_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(job_id)
        .bind(ExecutionStatus::Running.as_str())
        .bind(trigger_type.as_str())
        .bind(started_at)
        .execute(&self.pool)
        .await
        .context("failed to insert running execution")?;

        Ok(JobExecution {
            id,
            job_id: job_id.to_string(),
            status: ExecutionStatus::Running,
            trigger_type,
            started_at,
            completed_at: None,
            duration_seconds: None,
            execution_type: None,
            target: None,
            response_status: None,
            error_message: None,
            output: None,
        })
    }

    /// Record which endpoint this execution is about to call.
    pub async fn set_target(
        &self,
        execution_id: &str,
        execution_type: ExecutionType,
        target: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE job_executions SET execution_type = ?, target = ? WHERE id = ?")
            .bind(execution_type.as_str())
            .bind(target)
            .bind(execution_id)
            .execute(&self.pool)
            .await
            .context("failed to set execution target")?;
        Ok(())
    }

    /// Mark the execution finished, computing `duration_seconds` from the
    /// stored `started_at`.
    pub async fn mark_completed(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        response_status: Option<i64>,
        error_message: Option<&str>,
        output: Option<&str>,
    ) -> Result<()> {
        let started_at: DateTime<Utc> =
            sqlx::query_scalar("SELECT started_at FROM job_executions WHERE id = ?")
                .bind(execution_id)
                .fetch_one(&self.pool)
                .await
                .context("failed to read execution started_at")?;

        let completed_at = Utc::now().max(started_at);
        let duration_seconds = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;

        sqlx::query(
            "UPDATE job_executions
             SET status = ?, completed_at = ?, duration_seconds = ?,
                 response_status = ?, error_message = ?, output = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(completed_at)
        .bind(duration_seconds)
        .bind(response_status)
        .bind(error_message)
        .bind(output)
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .context("failed to mark execution completed")?;

        Ok(())
    }

    /// Close out `running` rows left behind by a crashed process. Runs at
    /// leader startup, before the first reconcile.
    pub async fn fail_dangling_running(&self, reason: &str) -> Result<u64> {
        let rows = sqlx::query("SELECT id, started_at FROM job_executions WHERE status = 'running'")
            .fetch_all(&self.pool)
            .await
            .context("failed to list dangling running executions")?;

        let mut swept = 0;
        for row in rows {
            let id: String = row
                .try_get("id")
                .context("failed to read dangling execution id")?;
            let started_at: DateTime<Utc> = row
                .try_get("started_at")
                .context("failed to read dangling execution started_at")?;

            let completed_at = Utc::now().max(started_at);
            let duration_seconds = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;

            let result = sqlx::query(
                "UPDATE job_executions
                 SET status = 'failed', completed_at = ?, error_message = ?, duration_seconds = ?
                 WHERE id = ? AND status = 'running'",
            )
            .bind(completed_at)
            .bind(reason)
            .bind(duration_seconds)
            .bind(&id)
            .execute(&self.pool)
            .await
            .context("failed to close dangling running execution")?;
            swept += result.rows_affected();
        }

        Ok(swept)
    }

    pub async fn get(&self, execution_id: &str) -> Result<Option<JobExecution>> {
        let row = sqlx::query(
            "SELECT id, job_id, status, trigger_type, started_at, completed_at,
                    duration_seconds, execution_type, target, response_status,
                    error_message, output
             FROM job_executions WHERE id = ?",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch execution")?;

        row.map(execution_from_row).transpose()
    }

    pub async fn list_for_job(&self, job_id: &str, limit: i64) -> Result<Vec<JobExecution>> {
        let rows = sqlx::query(
            "SELECT id, job_id, status, trigger_type, started_at, completed_at,
                    duration_seconds, execution_type, target, response_status,
                    error_message, output
             FROM job_executions WHERE job_id = ?
             ORDER BY started_at DESC LIMIT ?",
        )
        .bind(job_id)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await
        .context("failed to list executions")?;

        rows.into_iter().map(execution_from_row).collect()
    }
}

fn execution_from_row(row: sqlx::sqlite::SqliteRow) -> Result<JobExecution> {
    let status_value: String = row
        .try_get("status")
        .context("failed to read execution status")?;
    let trigger_value: String = row
        .try_get("trigger_type")
        .context("failed to read execution trigger_type")?;

    let status = ExecutionStatus::parse(&status_value)
        .with_context(|| format!("invalid execution status in database: {status_value}"))?;
    let trigger_type = TriggerType::parse(&trigger_value)
        .with_context(|| format!("invalid trigger type in database: {trigger_value}"))?;

    Ok(JobExecution {
        id: row.try_get("id").context("failed to read execution id")?,
        job_id: row
            .try_get("job_id")
            .context("failed to read execution job_id")?,
        status,
        trigger_type,
        started_at: row
            .try_get("started_at")
            .context("failed to read execution started_at")?,
        completed_at: row.try_get("completed_at").ok(),
        duration_seconds: row.try_get("duration_seconds").ok(),
        execution_type: row
            .try_get::<Option<String>, _>("execution_type")
            .ok()
            .flatten()
            .and_then(|value| ExecutionType::parse(&value)),
        target: row.try_get("target").ok(),
        response_status: row.try_get("response_status").ok(),
        error_message: row.try_get("error_message").ok(),
        output: row.try_get("output").ok(),
    })
}

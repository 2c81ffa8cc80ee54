//! Job execution: end-date guard, execution row lifecycle, the outbound HTTP
//! call, and outcome notifications.
//!
//! Every failure mode here flattens into a `failed` execution row or a log
//! line. Nothing propagates back into the trigger engine.

use crate::notify::broadcast::Notifier;
use crate::notify::mail::MailSink;
use crate::notify::slack::send_slack_message;
use crate::scheduler::engine::TriggerEngine;
use crate::store::executions::{ExecutionStatus, ExecutionStore, ExecutionType, TriggerType};
use crate::store::jobs::{Job, JobStore};
use crate::store::slack::SlackStore;
use crate::store::taxonomy::TaxonomyStore;
use chrono::NaiveDate;
use chrono_tz::Tz;
use futures::StreamExt as _;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::{Arc, Weak};

/// Response bodies are kept up to this many bytes in `output`.
const OUTPUT_CAP_BYTES: usize = 1000;

/// Everything a dispatch needs, shared across all job callbacks.
#[derive(Clone)]
pub struct DispatchContext {
    pub pool: SqlitePool,
    pub jobs: JobStore,
    pub executions: ExecutionStore,
    pub notifier: Notifier,
    pub slack: SlackStore,
    pub taxonomy: TaxonomyStore,
    pub http: reqwest::Client,
    pub engine: Weak<TriggerEngine>,
    pub mail: Arc<dyn MailSink>,
    pub timezone: Tz,
    pub timezone_name: String,
    pub github_token: Option<String>,
    pub frontend_base_url: String,
}

impl DispatchContext {
    pub fn new(
        pool: SqlitePool,
        config: &crate::config::Config,
        http: reqwest::Client,
        engine: Weak<TriggerEngine>,
        mail: Arc<dyn MailSink>,
    ) -> Self {
        Self {
            jobs: JobStore::new(pool.clone()),
            executions: ExecutionStore::new(pool.clone()),
            notifier: Notifier::new(pool.clone()),
            slack: SlackStore::new(pool.clone()),
            taxonomy: TaxonomyStore::new(pool.clone()),
            pool,
            http,
            engine,
            mail,
            timezone: config.timezone,
            timezone_name: config.timezone_name.clone(),
            github_token: config.github_token.clone(),
            frontend_base_url: config.frontend_base_url.clone(),
        }
    }

    pub fn today_in_tz(&self) -> NaiveDate {
        chrono::Utc::now().with_timezone(&self.timezone).date_naive()
    }

    pub fn job_link(&self, job_id: &str) -> String {
        format!("{}/jobs/{job_id}/edit", self.frontend_base_url)
    }
}

impl std::fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchContext").finish_non_exhaustive()
    }
}

/// Snapshot of the job fields a dispatch needs. Captured at scheduling time;
/// the dispatcher re-reads the row only for the end-date guard.
#[derive(Debug, Clone, Default)]
pub struct JobSnapshot {
    pub target_url: Option<String>,
    pub github_owner: Option<String>,
    pub github_repo: Option<String>,
    pub github_workflow_name: Option<String>,
    pub metadata: Value,
    pub enable_email_notifications: bool,
    pub notification_emails: Vec<String>,
    pub notify_on_success: bool,
    /// One-shot token for manual runs; scheduled runs fall back to the
    /// process-level GITHUB_TOKEN.
    pub github_token: Option<String>,
}

impl JobSnapshot {
    pub fn from_job(job: &Job) -> Self {
        Self {
            target_url: job.target_url.clone(),
            github_owner: job.github_owner.clone(),
            github_repo: job.github_repo.clone(),
            github_workflow_name: job.github_workflow_name.clone(),
            metadata: job.metadata.clone(),
            enable_email_notifications: job.enable_email_notifications,
            notification_emails: job.notification_emails.clone(),
            notify_on_success: job.notify_on_success,
            github_token: None,
        }
    }

    /// Apply one-shot manual-trigger overrides. Never persisted.
    pub fn with_overrides(mut self, overrides: &TriggerOverrides) -> Self {
        if let Some(token) = &overrides.github_token {
            self.github_token = Some(token.clone());
        }
        if let Some(url) = &overrides.dispatch_url {
            self.target_url = Some(url.clone());
        }
        if let Some(metadata) = &overrides.metadata {
            self.metadata = metadata.clone();
        }
        self
    }
}

/// One-shot overrides an external caller may supply on a manual trigger.
#[derive(Debug, Clone, Default)]
pub struct TriggerOverrides {
    pub github_token: Option<String>,
    pub dispatch_url: Option<String>,
    pub metadata: Option<Value>,
}

enum DispatchOutcome {
    Success {
        response_status: Option<i64>,
        output: Option<String>,
    },
    Failure {
        response_status: Option<i64>,
        error_message: String,
        output: Option<String>,
    },
}

/// Execute one firing of a job. This is the trigger-engine callback body;
/// it records its outcome in the store and never returns an error.
#[tracing::instrument(skip(ctx, snapshot))]
pub async fn execute_job(
    ctx: &DispatchContext,
    job_id: &str,
    job_name: &str,
    snapshot: JobSnapshot,
    trigger_type: TriggerType,
) {
    tracing::info!(job_id, job_name, "executing job");

    // End-date guard: paused, deleted and expired jobs produce no execution
    // row at all.
    match end_date_guard(ctx, job_id, job_name).await {
        Ok(true) => {}
        Ok(false) => return,
        Err(error) => {
            tracing::warn!(job_id, job_name, %error, "end-date guard failed, continuing dispatch");
        }
    }

    let execution = match ctx.executions.insert_running(job_id, trigger_type).await {
        Ok(execution) => execution,
        Err(error) => {
            tracing::error!(job_id, job_name, %error, "failed to record execution start");
            return;
        }
    };

    let outcome = dispatch(ctx, job_id, job_name, &snapshot, &execution.id).await;

    let (status, response_status, error_message, output) = match &outcome {
        DispatchOutcome::Success {
            response_status,
            output,
        } => (ExecutionStatus::Success, *response_status, None, output.clone()),
        DispatchOutcome::Failure {
            response_status,
            error_message,
            output,
        } => (
            ExecutionStatus::Failed,
            *response_status,
            Some(error_message.clone()),
            output.clone(),
        ),
    };

    if let Err(error) = ctx
        .executions
        .mark_completed(
            &execution.id,
            status,
            response_status,
            error_message.as_deref(),
            output.as_deref(),
        )
        .await
    {
        tracing::error!(job_id, job_name, %error, "failed to record execution outcome");
    }

    // Notifications are best-effort; the execution row is already final.
    match outcome {
        DispatchOutcome::Success { .. } => {
            if let Err(error) = ctx.notifier.job_completed(job_name, job_id, &execution.id).await {
                tracing::error!(job_id, %error, "failed to broadcast success notification");
            }
            if snapshot.notify_on_success
                && snapshot.enable_email_notifications
                && !snapshot.notification_emails.is_empty()
            {
                let duration = duration_of(ctx, &execution.id).await;
                ctx.mail
                    .send_job_success(job_name, job_id, duration, &snapshot.notification_emails)
                    .await;
            }
        }
        DispatchOutcome::Failure { error_message, .. } => {
            if let Err(error) = ctx
                .notifier
                .job_failed(job_name, job_id, &execution.id, &error_message)
                .await
            {
                tracing::error!(job_id, %error, "failed to broadcast failure notification");
            }
            if snapshot.enable_email_notifications && !snapshot.notification_emails.is_empty() {
                ctx.mail
                    .send_job_failure(job_name, job_id, &error_message, &snapshot.notification_emails)
                    .await;
            }
        }
    }
}

/// Manually trigger a job. Goes through the engine when the job is scheduled
/// there (so manual fires compete under the per-job concurrency cap) and
/// dispatches directly otherwise. Returns false when the fire was dropped at
/// the cap.
pub async fn trigger_job_manually(
    ctx: &DispatchContext,
    job: &Job,
    overrides: Option<TriggerOverrides>,
) -> crate::error::Result<bool> {
    if let Some(engine) = ctx.engine.upgrade() {
        if engine.get(&job.id).await.is_some() {
            return engine
                .trigger_now(&job.id, overrides)
                .await
                .map_err(Into::into);
        }
    }

    let mut snapshot = JobSnapshot::from_job(job);
    if let Some(overrides) = &overrides {
        snapshot = snapshot.with_overrides(overrides);
    }
    execute_job(ctx, &job.id, &job.name, snapshot, TriggerType::Manual).await;
    Ok(true)
}

/// Returns Ok(true) when the dispatch should proceed. An expired job is
/// auto-paused, unscheduled and announced here, and produces no execution
/// row.
async fn end_date_guard(
    ctx: &DispatchContext,
    job_id: &str,
    job_name: &str,
) -> crate::error::Result<bool> {
    let Some(job) = ctx.jobs.get(job_id).await? else {
        tracing::info!(job_id, job_name, "skipping execution for missing job");
        return Ok(false);
    };
    if !job.is_active {
        tracing::info!(job_id, job_name, "skipping execution for inactive job");
        return Ok(false);
    }

    let Some(end_date) = job.end_date else {
        return Ok(true);
    };
    if end_date >= ctx.today_in_tz() {
        return Ok(true);
    }

    ctx.jobs.set_active(job_id, false).await?;
    if let Some(engine) = ctx.engine.upgrade() {
        engine.remove(job_id).await;
    }
    announce_auto_pause(ctx, &job, end_date).await;

    tracing::info!(job_id, job_name, %end_date, "auto-paused expired job during execution guard");
    Ok(false)
}

/// Auto-pause announcement: warning notifications to creator + active admins
/// and, when Slack is configured, one message mentioning the team handle.
/// Best effort on every branch.
pub(crate) async fn announce_auto_pause(ctx: &DispatchContext, job: &Job, end_date: NaiveDate) {
    if let Err(error) = ctx
        .notifier
        .job_auto_paused(job, end_date, &ctx.timezone_name)
        .await
    {
        tracing::error!(job_id = %job.id, %error, "failed to create auto-pause notifications");
    }

    let slack_config = match ctx.slack.effective_config().await {
        Ok(config) => config,
        Err(error) => {
            tracing::warn!(job_id = %job.id, %error, "failed to load Slack settings");
            None
        }
    };
    if let Some((webhook_url, channel)) = slack_config {
        let mention = team_mention(ctx, job).await;
        let text = format!(
            ":warning: {mention}Job auto-paused (end date passed): <{}|{}> (end_date {} {})",
            ctx.job_link(&job.id),
            job.name,
            end_date,
            ctx.timezone_name,
        );
        send_slack_message(&ctx.http, &webhook_url, &text, channel.as_deref()).await;
    }
}

/// "@handle " prefix for the job's team, or empty when there is none.
pub(crate) async fn team_mention(ctx: &DispatchContext, job: &Job) -> String {
    let Some(team_slug) = &job.pic_team else {
        return String::new();
    };
    match ctx.taxonomy.team_slack_handle(team_slug).await {
        Ok(Some(handle)) => format!("{handle} "),
        Ok(None) => String::new(),
        Err(error) => {
            tracing::warn!(job_id = %job.id, %error, "failed to resolve team Slack handle");
            String::new()
        }
    }
}

async fn dispatch(
    ctx: &DispatchContext,
    job_id: &str,
    job_name: &str,
    snapshot: &JobSnapshot,
    execution_id: &str,
) -> DispatchOutcome {
    if let (Some(owner), Some(repo), Some(workflow)) = (
        snapshot.github_owner.as_deref(),
        snapshot.github_repo.as_deref(),
        snapshot.github_workflow_name.as_deref(),
    ) {
        dispatch_github(ctx, job_name, snapshot, execution_id, owner, repo, workflow).await
    } else if let Some(target_url) = snapshot.target_url.as_deref() {
        dispatch_webhook(ctx, job_name, snapshot, execution_id, target_url).await
    } else {
        let error_message = format!(
            "Job '{job_name}' has no valid target (neither GitHub Actions nor webhook URL)"
        );
        tracing::error!(job_id, "{error_message}");
        DispatchOutcome::Failure {
            response_status: None,
            error_message,
            output: None,
        }
    }
}

/// GitHub Actions workflow dispatch. 204 with an empty body is the success
/// shape.
async fn dispatch_github(
    ctx: &DispatchContext,
    job_name: &str,
    snapshot: &JobSnapshot,
    execution_id: &str,
    owner: &str,
    repo: &str,
    workflow: &str,
) -> DispatchOutcome {
    let target = format!("{owner}/{repo}/{workflow}");
    if let Err(error) = ctx
        .executions
        .set_target(execution_id, ExecutionType::GithubActions, &target)
        .await
    {
        tracing::error!(execution_id, %error, "failed to record execution target");
    }

    let Some(token) = snapshot
        .github_token
        .clone()
        .or_else(|| ctx.github_token.clone())
    else {
        let error_message = format!(
            "GitHub token not configured. Cannot trigger workflow for job '{job_name}'"
        );
        tracing::error!(target = %target, "{error_message}");
        return DispatchOutcome::Failure {
            response_status: None,
            error_message,
            output: None,
        };
    };

    let url =
        format!("https://api.github.com/repos/{owner}/{repo}/actions/workflows/{workflow}/dispatches");
    let ref_name = snapshot
        .metadata
        .get("branchDetails")
        .and_then(Value::as_str)
        .unwrap_or("master")
        .to_string();
    let payload = serde_json::json!({
        "ref": ref_name,
        "inputs": snapshot.metadata,
    });

    tracing::info!(target = %target, ref_name = %ref_name, "triggering GitHub Actions workflow");

    let response = ctx
        .http
        .post(&url)
        .header("Authorization", format!("Bearer {token}"))
        .header("Accept", "application/vnd.github+json")
        .header("Content-Type", "application/json")
        .json(&payload)
        .send()
        .await;

    match response {
        Ok(response) if response.status().as_u16() == 204 => {
            tracing::info!(job_name, target = %target, "GitHub Actions workflow triggered");
            DispatchOutcome::Success {
                response_status: Some(204),
                output: Some(format!("Workflow triggered successfully on branch {ref_name}")),
            }
        }
        Ok(response) => {
            let status = response.status().as_u16() as i64;
            let body = read_capped_body(response).await;
            let error_message = format!(
                "GitHub Actions dispatch failed. Status: {status}, Response: {}",
                body.as_deref().unwrap_or("")
            );
            tracing::error!(job_name, target = %target, "{error_message}");
            DispatchOutcome::Failure {
                response_status: Some(status),
                error_message,
                output: body,
            }
        }
        Err(error) => {
            let error_message = format!("GitHub Actions request failed: {error}");
            tracing::error!(job_name, target = %target, "{error_message}");
            DispatchOutcome::Failure {
                response_status: None,
                error_message,
                output: None,
            }
        }
    }
}

/// Generic webhook call: POST json when the metadata object is non-empty,
/// plain GET otherwise.
async fn dispatch_webhook(
    ctx: &DispatchContext,
    job_name: &str,
    snapshot: &JobSnapshot,
    execution_id: &str,
    target_url: &str,
) -> DispatchOutcome {
    if let Err(error) = ctx
        .executions
        .set_target(execution_id, ExecutionType::Webhook, target_url)
        .await
    {
        tracing::error!(execution_id, %error, "failed to record execution target");
    }

    let payload = match &snapshot.metadata {
        Value::Object(map) if !map.is_empty() => Some(&snapshot.metadata),
        _ => None,
    };

    tracing::info!(job_name, target_url, post = payload.is_some(), "calling webhook");

    let request = match payload {
        Some(payload) => ctx.http.post(target_url).json(payload),
        None => ctx.http.get(target_url),
    };

    match request.send().await {
        Ok(response) => {
            let status = response.status().as_u16() as i64;
            let output = read_capped_body(response).await;
            if (200..300).contains(&status) {
                DispatchOutcome::Success {
                    response_status: Some(status),
                    output,
                }
            } else {
                let error_message = format!("Webhook returned status {status}");
                tracing::error!(job_name, target_url, "{error_message}");
                DispatchOutcome::Failure {
                    response_status: Some(status),
                    error_message,
                    output,
                }
            }
        }
        Err(error) => {
            let error_message = format!("Webhook call failed: {error}");
            tracing::error!(job_name, target_url, "{error_message}");
            DispatchOutcome::Failure {
                response_status: None,
                error_message,
                output: None,
            }
        }
    }
}

/// Stream at most `OUTPUT_CAP_BYTES` of the response body; the rest of the
/// stream is dropped unread.
async fn read_capped_body(response: reqwest::Response) -> Option<String> {
    let mut collected: Vec<u8> = Vec::with_capacity(256);
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(error) => {
                tracing::debug!(%error, "response body read aborted");
                break;
            }
        };
        let remaining = OUTPUT_CAP_BYTES - collected.len();
        collected.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
        if collected.len() >= OUTPUT_CAP_BYTES {
            break;
        }
    }

    if collected.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&collected).into_owned())
    }
}

async fn duration_of(ctx: &DispatchContext, execution_id: &str) -> f64 {
    ctx.executions
        .get(execution_id)
        .await
        .ok()
        .flatten()
        .and_then(|execution| execution.duration_seconds)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::mail::NullMailSink;
    use crate::store::jobs::CreateJobInput;
    use crate::store::notifications::NotificationStore;
    use axum::routing::any;
    use std::sync::Mutex;

    async fn setup_ctx() -> (SqlitePool, DispatchContext) {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should connect");
        crate::db::ensure_schema(&pool)
            .await
            .expect("schema should bootstrap");

        let config = test_config();
        let http = crate::dispatch::client::build_http_client(std::time::Duration::from_secs(2))
            .expect("client should build");
        let ctx = DispatchContext::new(pool.clone(), &config, http, Weak::new(), Arc::new(NullMailSink));
        (pool, ctx)
    }

    fn test_config() -> crate::config::Config {
        crate::config::Config {
            scheduler_enabled: true,
            timezone: chrono_tz::Asia::Tokyo,
            timezone_name: "Asia/Tokyo".to_string(),
            lock_path: std::path::PathBuf::from("./scheduler.lock"),
            lock_stale_seconds: None,
            poll_seconds: 60,
            github_token: None,
            database_url: "sqlite::memory:".to_string(),
            frontend_base_url: "http://localhost:5173".to_string(),
        }
    }

    /// Spawn a one-route HTTP stub that records request methods and bodies.
    async fn spawn_stub(
        status: u16,
        body: &'static str,
    ) -> (String, Arc<Mutex<Vec<(String, String)>>>) {
        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_handler = Arc::clone(&seen);

        let app = axum::Router::new().route(
            "/hook",
            any(move |request: axum::extract::Request| {
                let seen = Arc::clone(&seen_handler);
                async move {
                    let method = request.method().to_string();
                    let bytes = axum::body::to_bytes(request.into_body(), 1 << 16)
                        .await
                        .unwrap_or_default();
                    seen.lock()
                        .unwrap()
                        .push((method, String::from_utf8_lossy(&bytes).into_owned()));
                    (
                        axum::http::StatusCode::from_u16(status).unwrap(),
                        body.to_string(),
                    )
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/hook"), seen)
    }

    fn webhook_job(url: &str, metadata: Value) -> CreateJobInput {
        CreateJobInput {
            name: "webhook-job".to_string(),
            cron_expression: "*/5 * * * *".to_string(),
            target_url: Some(url.to_string()),
            metadata,
            is_active: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn webhook_success_records_execution_and_broadcast() {
        let (pool, ctx) = setup_ctx().await;
        let (url, seen) = spawn_stub(200, "ok").await;

        crate::store::users::UserStore::new(pool.clone())
            .insert("u1", "alice", "alice@example.com", "admin", true)
            .await
            .unwrap();

        let mut input = webhook_job(&url, serde_json::json!({"k": "v"}));
        input.end_date = Some(ctx.today_in_tz());
        let job = ctx.jobs.create(input).await.unwrap();

        execute_job(
            &ctx,
            &job.id,
            &job.name,
            JobSnapshot::from_job(&job),
            TriggerType::Scheduled,
        )
        .await;

        let executions = ctx.executions.list_for_job(&job.id, 10).await.unwrap();
        assert_eq!(executions.len(), 1);
        let execution = &executions[0];
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.execution_type, Some(ExecutionType::Webhook));
        assert_eq!(execution.target.as_deref(), Some(url.as_str()));
        assert_eq!(execution.response_status, Some(200));
        assert_eq!(execution.output.as_deref(), Some("ok"));
        assert!(execution.completed_at.unwrap() >= execution.started_at);

        // Non-empty metadata object means POST with the metadata as body.
        let requests = seen.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "POST");
        assert!(requests[0].1.contains("\"k\":\"v\""));

        let notifications = NotificationStore::new(pool)
            .list_by_title("Job Completed")
            .await
            .unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].related_execution_id.as_deref(), Some(execution.id.as_str()));
    }

    #[tokio::test]
    async fn webhook_with_empty_metadata_uses_get() {
        let (_pool, ctx) = setup_ctx().await;
        let (url, seen) = spawn_stub(200, "pong").await;

        let job = ctx
            .jobs
            .create(webhook_job(&url, Value::Object(serde_json::Map::new())))
            .await
            .unwrap();

        execute_job(
            &ctx,
            &job.id,
            &job.name,
            JobSnapshot::from_job(&job),
            TriggerType::Manual,
        )
        .await;

        let requests = seen.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "GET");
    }

    #[tokio::test]
    async fn webhook_non_2xx_marks_failed_with_body() {
        let (pool, ctx) = setup_ctx().await;
        let (url, _seen) = spawn_stub(503, "overloaded").await;

        crate::store::users::UserStore::new(pool.clone())
            .insert("u1", "alice", "alice@example.com", "admin", true)
            .await
            .unwrap();

        let job = ctx
            .jobs
            .create(webhook_job(&url, Value::Null))
            .await
            .unwrap();

        execute_job(
            &ctx,
            &job.id,
            &job.name,
            JobSnapshot::from_job(&job),
            TriggerType::Scheduled,
        )
        .await;

        let execution = &ctx.executions.list_for_job(&job.id, 10).await.unwrap()[0];
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.response_status, Some(503));
        assert_eq!(execution.output.as_deref(), Some("overloaded"));
        assert_eq!(
            execution.error_message.as_deref(),
            Some("Webhook returned status 503")
        );

        let notifications = NotificationStore::new(pool)
            .list_by_title("Job Failed")
            .await
            .unwrap();
        assert_eq!(notifications.len(), 1);
        assert!(notifications[0].message.contains("Webhook returned status 503"));
    }

    #[tokio::test]
    async fn github_dispatch_without_token_fails_with_target_recorded() {
        let (_pool, ctx) = setup_ctx().await;
        assert!(ctx.github_token.is_none());

        let job = ctx
            .jobs
            .create(CreateJobInput {
                name: "gha-job".to_string(),
                cron_expression: "0 0 * * *".to_string(),
                github_owner: Some("octo".to_string()),
                github_repo: Some("repo".to_string()),
                github_workflow_name: Some("workflow.yml".to_string()),
                is_active: true,
                ..Default::default()
            })
            .await
            .unwrap();

        execute_job(
            &ctx,
            &job.id,
            &job.name,
            JobSnapshot::from_job(&job),
            TriggerType::Scheduled,
        )
        .await;

        let execution = &ctx.executions.list_for_job(&job.id, 10).await.unwrap()[0];
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.execution_type, Some(ExecutionType::GithubActions));
        assert_eq!(execution.target.as_deref(), Some("octo/repo/workflow.yml"));
        assert!(
            execution
                .error_message
                .as_deref()
                .unwrap()
                .starts_with("GitHub token not configured")
        );
    }

    #[tokio::test]
    async fn expired_job_is_auto_paused_without_execution_row() {
        let (pool, ctx) = setup_ctx().await;

        crate::store::users::UserStore::new(pool.clone())
            .insert("admin", "root", "root@example.com", "admin", true)
            .await
            .unwrap();

        let mut input = webhook_job("https://example.com/hook", Value::Null);
        input.name = "expired-job".to_string();
        input.end_date = Some(ctx.today_in_tz() - chrono::Days::new(1));
        let job = ctx.jobs.create(input).await.unwrap();

        execute_job(
            &ctx,
            &job.id,
            &job.name,
            JobSnapshot::from_job(&job),
            TriggerType::Scheduled,
        )
        .await;

        assert!(ctx.executions.list_for_job(&job.id, 10).await.unwrap().is_empty());
        assert!(!ctx.jobs.get(&job.id).await.unwrap().unwrap().is_active);

        let notifications = NotificationStore::new(pool)
            .list_by_title("Job auto-paused (end date passed)")
            .await
            .unwrap();
        assert!(!notifications.is_empty());
        assert!(
            notifications
                .iter()
                .all(|n| n.related_job_id.as_deref() == Some(job.id.as_str()))
        );
    }

    #[tokio::test]
    async fn no_target_snapshot_fails_without_http() {
        let (_pool, ctx) = setup_ctx().await;

        let job = ctx
            .jobs
            .create(webhook_job("https://example.com/hook", Value::Null))
            .await
            .unwrap();

        // A snapshot stripped of its target: misconfigured dispatch.
        let snapshot = JobSnapshot {
            target_url: None,
            ..JobSnapshot::from_job(&job)
        };
        execute_job(&ctx, &job.id, &job.name, snapshot, TriggerType::Manual).await;

        let execution = &ctx.executions.list_for_job(&job.id, 10).await.unwrap()[0];
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.execution_type, None);
        assert!(execution.error_message.as_deref().unwrap().contains("no valid target"));
    }

    #[tokio::test]
    async fn manual_overrides_apply_once() {
        let job = Job {
            id: "j".into(),
            name: "j".into(),
            cron_expression: "* * * * *".into(),
            is_active: true,
            end_date: None,
            target_url: Some("https://example.com/a".into()),
            github_owner: None,
            github_repo: None,
            github_workflow_name: None,
            metadata: serde_json::json!({"a": 1}),
            pic_team: None,
            category: None,
            created_by: None,
            enable_email_notifications: false,
            notify_on_success: false,
            notification_emails: vec![],
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };

        let overridden = JobSnapshot::from_job(&job).with_overrides(&TriggerOverrides {
            github_token: Some("tok".into()),
            dispatch_url: Some("https://example.com/b".into()),
            metadata: Some(serde_json::json!({"b": 2})),
        });

        assert_eq!(overridden.target_url.as_deref(), Some("https://example.com/b"));
        assert_eq!(overridden.github_token.as_deref(), Some("tok"));
        assert_eq!(overridden.metadata, serde_json::json!({"b": 2}));

        // The job row itself is untouched.
        assert_eq!(job.target_url.as_deref(), Some("https://example.com/a"));
        assert_eq!(job.metadata, serde_json::json!({"a": 1}));
    }
}

//! Weekly end-date maintenance.
//!
//! Runs inside the trigger engine every Monday at 09:00 scheduler time:
//! auto-pauses jobs whose end date has passed and reminds owners about jobs
//! ending within 30 days. Database mutations land in a single transaction;
//! Slack posts happen afterwards and are best-effort.

use crate::dispatch::executor::{team_mention, DispatchContext};
use crate::error::Result;
use crate::notify::slack::send_slack_message;
use crate::store::jobs::Job;
use crate::store::notifications::NotificationKind;
use anyhow::Context as _;
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Serialize;
use sqlx::SqliteConnection;
use std::collections::BTreeSet;

/// Reminder horizon for "ending soon" warnings.
const ENDING_SOON_DAYS: u64 = 30;

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceSummary {
    pub ran_at: DateTime<Utc>,
    pub paused_expired_jobs: usize,
    pub ending_soon_jobs: usize,
    pub notifications_created: usize,
}

/// Run one maintenance sweep.
pub async fn run_end_date_maintenance(ctx: &DispatchContext) -> Result<MaintenanceSummary> {
    let today = ctx.today_in_tz();
    let cutoff = today + Days::new(ENDING_SOON_DAYS);

    let expired = ctx.jobs.list_expired_active(today).await?;
    let ending_soon = ctx.jobs.list_ending_between(today, cutoff).await?;
    let slack_config = ctx.slack.effective_config().await?;
    let admin_ids = ctx.notifier_admin_ids().await?;

    // Resolve Slack mentions before the transaction: reads stay off the
    // write path, and the messages only go out after commit anyway.
    let mut slack_messages: Vec<String> = Vec::new();
    if slack_config.is_some() {
        for job in &expired {
            let Some(end_date) = job.end_date else { continue };
            let mention = team_mention(ctx, job).await;
            slack_messages.push(format!(
                ":warning: {mention}Job auto-paused (end date passed): <{}|{}> (end_date {} {})",
                ctx.job_link(&job.id),
                job.name,
                end_date,
                ctx.timezone_name,
            ));
        }
        for job in &ending_soon {
            let Some(end_date) = job.end_date else { continue };
            let days_left = days_until(today, end_date);
            let mention = team_mention(ctx, job).await;
            slack_messages.push(format!(
                ":warning: {mention}Job ending soon ({days_left}d): <{}|{}> (end_date {} {})",
                ctx.job_link(&job.id),
                job.name,
                end_date,
                ctx.timezone_name,
            ));
        }
    }

    let mut notifications_created = 0;
    let mut tx = ctx
        .pool
        .begin()
        .await
        .context("failed to open maintenance transaction")?;

    for job in &expired {
        let Some(end_date) = job.end_date else { continue };

        sqlx::query("UPDATE jobs SET is_active = 0, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(&job.id)
            .execute(&mut *tx)
            .await
            .context("failed to auto-pause expired job")?;

        let message = format!(
            "Job \"{}\" passed its end_date ({} {}) and was auto-paused. PIC Team: {}",
            job.name,
            end_date,
            ctx.timezone_name,
            job.pic_team.as_deref().unwrap_or("-"),
        );
        notifications_created += insert_warnings(
            &mut tx,
            job,
            &admin_ids,
            "Job auto-paused (end date passed)",
            &message,
        )
        .await?;
    }

    for job in &ending_soon {
        let Some(end_date) = job.end_date else { continue };
        let days_left = days_until(today, end_date);

        let message = format!(
            "Job \"{}\" ends on {} {} ({days_left} day(s) left). PIC Team: {}",
            job.name,
            end_date,
            ctx.timezone_name,
            job.pic_team.as_deref().unwrap_or("-"),
        );
        notifications_created +=
            insert_warnings(&mut tx, job, &admin_ids, "Job ending soon", &message).await?;
    }

    tx.commit()
        .await
        .context("failed to commit maintenance transaction")?;

    // The paused jobs must also leave the engine; in-memory, best effort.
    if let Some(engine) = ctx.engine.upgrade() {
        for job in &expired {
            engine.remove(&job.id).await;
        }
    }

    if let Some((webhook_url, channel)) = &slack_config {
        for text in &slack_messages {
            send_slack_message(&ctx.http, webhook_url, text, channel.as_deref()).await;
        }
    }

    let summary = MaintenanceSummary {
        ran_at: Utc::now(),
        paused_expired_jobs: expired.len(),
        ending_soon_jobs: ending_soon.len(),
        notifications_created,
    };
    tracing::info!(
        paused_expired_jobs = summary.paused_expired_jobs,
        ending_soon_jobs = summary.ending_soon_jobs,
        notifications_created = summary.notifications_created,
        "end-date maintenance complete"
    );
    Ok(summary)
}

fn days_until(today: NaiveDate, end_date: NaiveDate) -> i64 {
    (end_date - today).num_days()
}

/// Insert one warning row per recipient (creator plus active admins) inside
/// the maintenance transaction.
async fn insert_warnings(
    tx: &mut SqliteConnection,
    job: &Job,
    admin_ids: &[String],
    title: &str,
    message: &str,
) -> Result<usize> {
    let mut recipients: BTreeSet<&str> = BTreeSet::new();
    if let Some(creator) = &job.created_by {
        recipients.insert(creator.as_str());
    }
    for admin_id in admin_ids {
        recipients.insert(admin_id.as_str());
    }

    let mut created = 0;
    for user_id in recipients {
        sqlx::query(
            "INSERT INTO notifications (
                id, user_id, title, message, type, related_job_id, is_read, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(title)
        .bind(message)
        .bind(NotificationKind::Warning.as_str())
        .bind(&job.id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .context("failed to insert maintenance warning")?;
        created += 1;
    }
    Ok(created)
}

impl DispatchContext {
    /// Active admin ids, shared by the maintenance warning fan-out.
    pub(crate) async fn notifier_admin_ids(&self) -> Result<Vec<String>> {
        crate::store::users::UserStore::new(self.pool.clone())
            .list_active_admin_ids()
            .await
    }
}

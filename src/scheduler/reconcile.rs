//! DB → engine reconciliation.
//!
//! The jobs table is the source of truth; the trigger engine is a derived
//! view. Reconciliation is idempotent and runs at leader startup, on a
//! periodic loop, and on demand from the admin surface. It schedules jobs
//! that should run, removes ones that should not, auto-pauses expired jobs,
//! and clears engine entries whose rows have disappeared.

use crate::dispatch::executor::{announce_auto_pause, execute_job, DispatchContext, JobSnapshot};
use crate::error::Result;
use crate::scheduler::engine::{JobCallback, TriggerEngine};
use crate::scheduler::runtime::RESERVED_JOB_IDS;
use crate::scheduler::trigger::CronTrigger;
use crate::store::jobs::Job;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

#[derive(Debug, Clone, Copy)]
pub struct ResyncOptions {
    pub remove_orphans: bool,
    pub auto_pause_expired: bool,
}

impl Default for ResyncOptions {
    fn default() -> Self {
        Self {
            remove_orphans: true,
            auto_pause_expired: true,
        }
    }
}

/// Counters from one reconcile pass, surfaced by the scheduler status
/// endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ResyncSummary {
    pub ran_at: DateTime<Utc>,
    pub db_jobs_total: usize,
    pub db_jobs_active: usize,
    pub scheduled_now: usize,
    pub scheduled_added: usize,
    pub scheduled_removed: usize,
    pub expired_auto_paused: usize,
    pub orphaned_removed: usize,
    pub invalid_cron: usize,
}

pub struct Reconciler {
    ctx: Arc<DispatchContext>,
    engine: Arc<TriggerEngine>,
    last: RwLock<Option<ResyncSummary>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(ctx: Arc<DispatchContext>, engine: Arc<TriggerEngine>) -> Self {
        Self {
            ctx,
            engine,
            last: RwLock::new(None),
        }
    }

    pub async fn last_resync(&self) -> Option<ResyncSummary> {
        self.last.read().await.clone()
    }

    /// One full reconcile pass. Safe to call repeatedly.
    pub async fn resync(&self, options: ResyncOptions) -> Result<ResyncSummary> {
        let today = self.ctx.today_in_tz();
        let jobs = self.ctx.jobs.list_all().await?;

        let db_jobs_total = jobs.len();
        let mut db_jobs_active = 0;
        let mut scheduled_added = 0;
        let mut scheduled_removed = 0;
        let mut expired_auto_paused = 0;
        let mut invalid_cron = 0;
        let mut db_ids: HashSet<String> = HashSet::with_capacity(jobs.len());

        for mut job in jobs {
            db_ids.insert(job.id.clone());

            let expired = job
                .end_date
                .map(|end_date| end_date < today)
                .unwrap_or(false);

            if options.auto_pause_expired && job.is_active && expired {
                if let Some(end_date) = job.end_date {
                    self.ctx.jobs.set_active(&job.id, false).await?;
                    job.is_active = false;
                    expired_auto_paused += 1;
                    announce_auto_pause(&self.ctx, &job, end_date).await;
                    tracing::info!(job_id = %job.id, job_name = %job.name, %end_date, "auto-paused expired job");
                }
            }

            let should_schedule = job.is_active && !expired;
            if should_schedule {
                db_jobs_active += 1;

                let signature = job_signature(&job);
                if self.engine.signature(&job.id).await.as_deref() == Some(signature.as_str()) {
                    continue;
                }

                let trigger =
                    match CronTrigger::parse(&job.cron_expression, self.ctx.timezone) {
                        Ok(trigger) => trigger,
                        Err(error) => {
                            invalid_cron += 1;
                            tracing::warn!(
                                job_id = %job.id,
                                job_name = %job.name,
                                %error,
                                "skipping schedule update for job with invalid cron"
                            );
                            continue;
                        }
                    };

                let was_scheduled = self.engine.get(&job.id).await.is_some();
                let callback = build_callback(Arc::clone(&self.ctx), &job);
                if let Err(error) = self
                    .engine
                    .add(&job.id, trigger, callback, &job.name, &signature, true)
                    .await
                {
                    tracing::warn!(job_id = %job.id, %error, "failed to schedule job");
                    continue;
                }
                if !was_scheduled {
                    scheduled_added += 1;
                }
            } else if self.engine.remove(&job.id).await {
                scheduled_removed += 1;
            }
        }

        // Engine entries with no backing row were deleted while this process
        // was not leading. Reserved internal jobs stay.
        let mut orphaned_removed = 0;
        if options.remove_orphans {
            for scheduled_id in self.engine.list_ids().await {
                if RESERVED_JOB_IDS.contains(&scheduled_id.as_str()) {
                    continue;
                }
                if !db_ids.contains(&scheduled_id) && self.engine.remove(&scheduled_id).await {
                    orphaned_removed += 1;
                    tracing::info!(job_id = %scheduled_id, "removed orphaned schedule");
                }
            }
        }

        let summary = ResyncSummary {
            ran_at: Utc::now(),
            db_jobs_total,
            db_jobs_active,
            scheduled_now: self.engine.scheduled_count(&[]).await,
            scheduled_added,
            scheduled_removed,
            expired_auto_paused,
            orphaned_removed,
            invalid_cron,
        };

        tracing::info!(
            db_jobs_total = summary.db_jobs_total,
            db_jobs_active = summary.db_jobs_active,
            scheduled_now = summary.scheduled_now,
            scheduled_added = summary.scheduled_added,
            scheduled_removed = summary.scheduled_removed,
            expired_auto_paused = summary.expired_auto_paused,
            orphaned_removed = summary.orphaned_removed,
            invalid_cron = summary.invalid_cron,
            "reconcile pass complete"
        );

        *self.last.write().await = Some(summary.clone());
        Ok(summary)
    }

    /// Apply the should-be-scheduled rule for one job, after an API write.
    /// Returns true when the engine was changed.
    pub async fn sync_one(&self, job: &Job) -> Result<bool> {
        let today = self.ctx.today_in_tz();
        let expired = job
            .end_date
            .map(|end_date| end_date < today)
            .unwrap_or(false);

        if !job.is_active || expired {
            return Ok(self.engine.remove(&job.id).await);
        }

        let signature = job_signature(job);
        if self.engine.signature(&job.id).await.as_deref() == Some(signature.as_str()) {
            return Ok(false);
        }

        let trigger = CronTrigger::parse(&job.cron_expression, self.ctx.timezone)?;
        let callback = build_callback(Arc::clone(&self.ctx), job);
        self.engine
            .add(&job.id, trigger, callback, &job.name, &signature, true)
            .await?;
        Ok(true)
    }
}

/// Periodic reconcile loop: wait one period, then resync until told to stop.
pub fn spawn_loop(
    reconciler: Arc<Reconciler>,
    poll_seconds: u64,
    mut stop: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = std::time::Duration::from_secs(poll_seconds);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    if let Err(error) = reconciler.resync(ResyncOptions::default()).await {
                        tracing::warn!(%error, "reconcile loop error");
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        tracing::debug!("reconcile loop stopped");
                        return;
                    }
                }
            }
        }
    })
}

/// Deterministic summary of every field that feeds the trigger or the
/// dispatch snapshot. An unchanged signature means the engine entry can stay.
pub fn job_signature(job: &Job) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
        job.id,
        job.name,
        job.cron_expression,
        job.is_active,
        job.end_date.map(|d| d.to_string()).unwrap_or_default(),
        job.target_url.as_deref().unwrap_or_default(),
        job.github_owner.as_deref().unwrap_or_default(),
        job.github_repo.as_deref().unwrap_or_default(),
        job.github_workflow_name.as_deref().unwrap_or_default(),
        job.enable_email_notifications,
        job.notify_on_success,
        job.notification_emails.join(","),
        job.updated_at.to_rfc3339(),
    )
}

fn build_callback(ctx: Arc<DispatchContext>, job: &Job) -> JobCallback {
    let job_id = job.id.clone();
    let job_name = job.name.clone();
    let base = JobSnapshot::from_job(job);

    Arc::new(move |firing| {
        let ctx = Arc::clone(&ctx);
        let job_id = job_id.clone();
        let job_name = job_name.clone();
        let mut snapshot = base.clone();
        if let Some(overrides) = &firing.overrides {
            snapshot = snapshot.with_overrides(overrides);
        }
        Box::pin(async move {
            execute_job(&ctx, &job_id, &job_name, snapshot, firing.trigger_type).await;
        })
    })
}

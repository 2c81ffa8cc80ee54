//! Scheduler runtime: one object owning the leader lock, the trigger engine,
//! the leadership flag and the reconcile loop.
//!
//! Every process constructs a runtime; only the one that wins the lock
//! becomes the leader and drives schedules. Followers keep serving the API
//! with the side-effect helpers disabled.

use crate::config::Config;
use crate::dispatch::client::{build_http_client, HTTP_TIMEOUT};
use crate::dispatch::executor::{trigger_job_manually, DispatchContext, TriggerOverrides};
use crate::error::{Result, ScheduleError};
use crate::maintenance::run_end_date_maintenance;
use crate::notify::mail::MailSink;
use crate::scheduler::engine::{JobCallback, TriggerEngine};
use crate::scheduler::lock::SchedulerLock;
use crate::scheduler::reconcile::{self, Reconciler, ResyncOptions, ResyncSummary};
use crate::scheduler::trigger::CronTrigger;
use crate::store::jobs::Job;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{watch, Mutex};

/// Engine-internal job that sweeps end dates every Monday morning.
pub const MAINTENANCE_JOB_ID: &str = "end_date_maintenance";

/// Monday 09:00 in the scheduler timezone.
const MAINTENANCE_CRON: &str = "0 9 * * mon";

/// Ids exempt from orphan cleanup.
pub const RESERVED_JOB_IDS: &[&str] = &[MAINTENANCE_JOB_ID];

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub scheduler_running: bool,
    pub scheduler_is_leader: bool,
    /// Registered jobs excluding reserved internal ones.
    pub scheduled_jobs_count: usize,
    pub last_resync_at: Option<DateTime<Utc>>,
}

pub struct SchedulerRuntime {
    config: Config,
    engine: Arc<TriggerEngine>,
    ctx: Arc<DispatchContext>,
    reconciler: Arc<Reconciler>,
    lock: Mutex<Option<SchedulerLock>>,
    is_leader: AtomicBool,
    stop_tx: watch::Sender<bool>,
    reconcile_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for SchedulerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerRuntime")
            .field("is_leader", &self.is_leader.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl SchedulerRuntime {
    pub fn new(pool: SqlitePool, config: Config, mail: Arc<dyn MailSink>) -> Result<Arc<Self>> {
        let engine = Arc::new(TriggerEngine::new());
        let http = build_http_client(HTTP_TIMEOUT)?;
        let ctx = Arc::new(DispatchContext::new(
            pool,
            &config,
            http,
            Arc::downgrade(&engine),
            mail,
        ));
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&ctx), Arc::clone(&engine)));
        let (stop_tx, _stop_rx) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            engine,
            ctx,
            reconciler,
            lock: Mutex::new(None),
            is_leader: AtomicBool::new(false),
            stop_tx,
            reconcile_handle: Mutex::new(None),
        }))
    }

    pub fn engine(&self) -> &Arc<TriggerEngine> {
        &self.engine
    }

    pub fn dispatch_context(&self) -> &Arc<DispatchContext> {
        &self.ctx
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    /// Try to start scheduling in this process. Returns true when this
    /// process won the lock and now leads; false means follower (or the
    /// scheduler is disabled).
    pub async fn start(self: &Arc<Self>) -> Result<bool> {
        if !self.config.scheduler_enabled {
            tracing::info!("scheduler disabled by configuration, skipping leader acquisition");
            return Ok(false);
        }
        if self.is_leader() {
            return Ok(true);
        }

        let stale_after = self
            .config
            .lock_stale_seconds
            .map(std::time::Duration::from_secs);
        let mut lock = SchedulerLock::new(&self.config.lock_path, stale_after);
        if !lock.try_acquire() {
            tracing::info!(
                lock_path = %self.config.lock_path.display(),
                "scheduler lock held elsewhere, running as follower"
            );
            return Ok(false);
        }

        *self.lock.lock().await = Some(lock);
        self.is_leader.store(true, Ordering::Release);

        // A previous leader may have died mid-dispatch; its `running` rows
        // would otherwise dangle forever.
        match self
            .ctx
            .executions
            .fail_dangling_running("Interrupted by scheduler restart")
            .await
        {
            Ok(0) => {}
            Ok(count) => tracing::warn!(count, "closed dangling running executions"),
            Err(error) => tracing::warn!(%error, "failed to close dangling running executions"),
        }

        self.engine.start().await;
        self.register_maintenance_job().await;

        // Bootstrap schedules from the store, then keep them reconciled.
        // Startup survives a failed initial pass; the loop retries.
        if let Err(error) = self.reconciler.resync(ResyncOptions::default()).await {
            tracing::warn!(%error, "initial reconcile failed");
        }

        let _ = self.stop_tx.send(false);
        let handle = reconcile::spawn_loop(
            Arc::clone(&self.reconciler),
            self.config.poll_seconds,
            self.stop_tx.subscribe(),
        );
        *self.reconcile_handle.lock().await = Some(handle);

        tracing::info!(
            timezone = %self.config.timezone_name,
            poll_seconds = self.config.poll_seconds,
            "scheduler started as leader"
        );
        Ok(true)
    }

    /// Stop scheduling and release leadership. The lock is released only
    /// after the engine has drained its in-flight callbacks.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.reconcile_handle.lock().await.take() {
            let _ = handle.await;
        }

        self.engine.stop().await;

        if let Some(mut lock) = self.lock.lock().await.take() {
            lock.release();
        }
        self.is_leader.store(false, Ordering::Release);
        tracing::info!("scheduler stopped");
    }

    pub async fn status(&self) -> SchedulerStatus {
        let running = self.engine.is_running();
        SchedulerStatus {
            scheduler_running: running,
            scheduler_is_leader: self.is_leader() && running,
            scheduled_jobs_count: self.engine.scheduled_count(RESERVED_JOB_IDS).await,
            last_resync_at: self
                .reconciler
                .last_resync()
                .await
                .map(|summary| summary.ran_at),
        }
    }

    pub async fn last_resync(&self) -> Option<ResyncSummary> {
        self.reconciler.last_resync().await
    }

    /// Admin resync. Leader-only: followers get a conflict error.
    pub async fn resync_from_db(
        &self,
        remove_orphans: bool,
        auto_pause_expired: bool,
    ) -> Result<ResyncSummary> {
        if !(self.is_leader() && self.engine.is_running()) {
            return Err(ScheduleError::NotLeader.into());
        }
        self.reconciler
            .resync(ResyncOptions {
                remove_orphans,
                auto_pause_expired,
            })
            .await
    }

    /// Post-write side effect: make the engine match one job. No-op (false)
    /// on followers; the leader's reconcile loop will pick the write up.
    pub async fn sync_job_schedule(&self, job: &Job) -> bool {
        if !(self.is_leader() && self.engine.is_running()) {
            return false;
        }
        match self.reconciler.sync_one(job).await {
            Ok(changed) => changed,
            Err(error) => {
                tracing::warn!(job_id = %job.id, %error, "scheduler side-effect failed");
                false
            }
        }
    }

    /// Post-delete side effect: drop a schedule. No-op (false) on followers.
    pub async fn unschedule_job(&self, job_id: &str) -> bool {
        if !(self.is_leader() && self.engine.is_running()) {
            return false;
        }
        self.engine.remove(job_id).await
    }

    /// Manual trigger entry point for the API. Works on any process; on the
    /// leader it competes with scheduled fires under the per-job cap.
    pub async fn trigger_job(
        &self,
        job: &Job,
        overrides: Option<TriggerOverrides>,
    ) -> Result<bool> {
        trigger_job_manually(&self.ctx, job, overrides).await
    }

    async fn register_maintenance_job(&self) {
        let trigger = match CronTrigger::parse(MAINTENANCE_CRON, self.config.timezone) {
            Ok(trigger) => trigger,
            Err(error) => {
                tracing::error!(%error, "failed to parse maintenance cron");
                return;
            }
        };

        let ctx = Arc::clone(&self.ctx);
        let callback: JobCallback = Arc::new(move |_firing| {
            let ctx = Arc::clone(&ctx);
            Box::pin(async move {
                if let Err(error) = run_end_date_maintenance(&ctx).await {
                    tracing::error!(%error, "end-date maintenance failed");
                }
            })
        });

        // Never fail scheduler startup over the internal job.
        if let Err(error) = self
            .engine
            .add(
                MAINTENANCE_JOB_ID,
                trigger,
                callback,
                "End date maintenance",
                "internal",
                true,
            )
            .await
        {
            tracing::error!(%error, "failed to register end-date maintenance job");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::mail::NullMailSink;
    use crate::store::jobs::{CreateJobInput, JobStore};

    async fn memory_pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should connect");
        crate::db::ensure_schema(&pool)
            .await
            .expect("schema should bootstrap");
        pool
    }

    fn config_with_lock(dir: &tempfile::TempDir) -> Config {
        Config {
            scheduler_enabled: true,
            timezone: chrono_tz::Asia::Tokyo,
            timezone_name: "Asia/Tokyo".to_string(),
            lock_path: dir.path().join("scheduler.lock"),
            lock_stale_seconds: None,
            poll_seconds: 60,
            github_token: None,
            database_url: "sqlite::memory:".to_string(),
            frontend_base_url: "http://localhost:5173".to_string(),
        }
    }

    async fn runtime(dir: &tempfile::TempDir) -> Arc<SchedulerRuntime> {
        SchedulerRuntime::new(memory_pool().await, config_with_lock(dir), Arc::new(NullMailSink))
            .expect("runtime should build")
    }

    #[tokio::test]
    async fn leader_is_unique_per_lock_path() {
        let dir = tempfile::tempdir().unwrap();
        let leader = runtime(&dir).await;
        let follower = runtime(&dir).await;

        assert!(leader.start().await.unwrap());
        assert!(!follower.start().await.unwrap());

        let leader_status = leader.status().await;
        let follower_status = follower.status().await;
        assert!(leader_status.scheduler_is_leader);
        assert!(!follower_status.scheduler_is_leader);
        assert!(!follower_status.scheduler_running);

        leader.stop().await;
        follower.stop().await;
    }

    #[tokio::test]
    async fn follower_side_effects_are_noops() {
        let dir = tempfile::tempdir().unwrap();
        let leader = runtime(&dir).await;
        let follower = runtime(&dir).await;
        assert!(leader.start().await.unwrap());
        assert!(!follower.start().await.unwrap());

        let jobs = JobStore::new(follower.dispatch_context().pool.clone());
        let job = jobs
            .create(CreateJobInput {
                name: "follower-side".to_string(),
                cron_expression: "*/5 * * * *".to_string(),
                target_url: Some("https://example.com/hook".to_string()),
                is_active: true,
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(!follower.sync_job_schedule(&job).await);
        assert!(!follower.unschedule_job(&job.id).await);
        assert!(follower.engine().get(&job.id).await.is_none());

        let error = follower
            .resync_from_db(true, true)
            .await
            .expect_err("follower resync must conflict");
        assert!(error.to_string().contains("not running as leader"));

        leader.stop().await;
        follower.stop().await;
    }

    #[tokio::test]
    async fn leader_bootstraps_preexisting_jobs_and_reserved_id() {
        let dir = tempfile::tempdir().unwrap();
        let pool = memory_pool().await;
        let jobs = JobStore::new(pool.clone());
        let job = jobs
            .create(CreateJobInput {
                name: "preexisting".to_string(),
                cron_expression: "*/5 * * * *".to_string(),
                target_url: Some("https://example.com/hook".to_string()),
                end_date: Some(chrono::Utc::now().date_naive() + chrono::Days::new(7)),
                is_active: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let runtime =
            SchedulerRuntime::new(pool, config_with_lock(&dir), Arc::new(NullMailSink)).unwrap();
        assert!(runtime.start().await.unwrap());

        assert!(runtime.engine().get(&job.id).await.is_some());
        assert!(runtime.engine().get(MAINTENANCE_JOB_ID).await.is_some());

        let summary = runtime.last_resync().await.expect("initial resync ran");
        assert!(summary.scheduled_added >= 1);

        // The reserved job is excluded from the public count.
        let status = runtime.status().await;
        assert_eq!(status.scheduled_jobs_count, 1);
        assert!(status.last_resync_at.is_some());

        runtime.stop().await;
    }

    #[tokio::test]
    async fn stop_releases_lock_for_next_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let first = runtime(&dir).await;
        assert!(first.start().await.unwrap());
        first.stop().await;
        assert!(!dir.path().join("scheduler.lock").exists());

        let second = runtime(&dir).await;
        assert!(second.start().await.unwrap());
        second.stop().await;
    }

    #[tokio::test]
    async fn disabled_scheduler_skips_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_with_lock(&dir);
        config.scheduler_enabled = false;

        let runtime =
            SchedulerRuntime::new(memory_pool().await, config, Arc::new(NullMailSink)).unwrap();
        assert!(!runtime.start().await.unwrap());
        assert!(!dir.path().join("scheduler.lock").exists());
        runtime.stop().await;
    }

    #[tokio::test]
    async fn resync_preserves_reserved_job_when_orphans_removed() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(&dir).await;
        assert!(runtime.start().await.unwrap());

        // Register a schedule the store knows nothing about.
        let trigger = CronTrigger::parse("*/5 * * * *", chrono_tz::Asia::Tokyo).unwrap();
        runtime
            .engine()
            .add("orphan-id", trigger, Arc::new(|_| Box::pin(async {})), "orphan", "x", true)
            .await
            .unwrap();

        let summary = runtime.resync_from_db(true, true).await.unwrap();
        assert_eq!(summary.orphaned_removed, 1);
        assert!(runtime.engine().get("orphan-id").await.is_none());
        assert!(runtime.engine().get(MAINTENANCE_JOB_ID).await.is_some());

        runtime.stop().await;
    }
}

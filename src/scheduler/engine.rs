//! In-memory trigger engine.
//!
//! A keyed registry `job_id -> (trigger, callback, name)` driven by a single
//! tick loop. The loop itself never runs user work: due fires are handed to a
//! bounded worker set and the callbacks do their blocking HTTP there.
//!
//! Execution policy per job: missed fires older than the 30s grace window are
//! skipped, at most 3 instances of the same job run concurrently (extra due
//! fires are dropped with a log, never queued), and distinct occurrences are
//! not coalesced.

use crate::dispatch::TriggerOverrides;
use crate::error::ScheduleError;
use crate::scheduler::trigger::CronTrigger;
use crate::store::TriggerType;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Mutex, Notify, RwLock, Semaphore};
use tokio::time::Duration;

/// Upper bound on concurrently running callbacks across all jobs.
pub const WORKER_POOL_SIZE: usize = 20;

/// At most this many concurrent invocations per job id.
pub const MAX_INSTANCES: usize = 3;

/// Fires older than this are considered misfires and skipped.
const MISFIRE_GRACE_SECONDS: i64 = 30;

/// Tick period of the trigger loop.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// One invocation handed to a job callback.
#[derive(Debug, Clone)]
pub struct Firing {
    pub trigger_type: TriggerType,
    /// One-shot overrides for manual triggers; never persisted.
    pub overrides: Option<TriggerOverrides>,
}

impl Default for Firing {
    fn default() -> Self {
        Self {
            trigger_type: TriggerType::Scheduled,
            overrides: None,
        }
    }
}

/// Job callback: owns its captured snapshot, runs on a worker.
pub type JobCallback =
    Arc<dyn Fn(Firing) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

struct EngineEntry {
    name: String,
    trigger: CronTrigger,
    callback: JobCallback,
    signature: String,
    next_fire: Option<DateTime<Utc>>,
    in_flight: Arc<AtomicUsize>,
}

/// Registered-job view returned by `get`/`list`.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub id: String,
    pub name: String,
    pub cron_expression: String,
    pub next_fire: Option<DateTime<Utc>>,
    pub in_flight: usize,
}

/// RAII guard decrementing a job's in-flight counter when the callback ends,
/// even if it panics.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct TriggerEngine {
    jobs: RwLock<HashMap<String, EngineEntry>>,
    workers: Arc<Semaphore>,
    accepting: AtomicBool,
    started: AtomicBool,
    shutdown: Notify,
    tick_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for TriggerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerEngine").finish_non_exhaustive()
    }
}

impl TriggerEngine {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(WORKER_POOL_SIZE)),
            accepting: AtomicBool::new(true),
            started: AtomicBool::new(false),
            shutdown: Notify::new(),
            tick_handle: Mutex::new(None),
        }
    }

    /// Spawn the tick loop. Idempotent: a second call replaces a finished
    /// loop but leaves a live one alone.
    pub async fn start(self: &Arc<Self>) {
        let mut handle_slot = self.tick_handle.lock().await;
        if let Some(handle) = handle_slot.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }

        self.accepting.store(true, Ordering::Release);
        self.started.store(true, Ordering::Release);
        let engine = Arc::clone(self);
        *handle_slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !engine.accepting.load(Ordering::Acquire) {
                            break;
                        }
                        engine.tick(Utc::now()).await;
                    }
                    _ = engine.shutdown.notified() => break,
                }
            }
        }));
    }

    /// Register a job. With `replace_existing`, re-registering resets future
    /// fires but keeps the in-flight counter of a currently executing
    /// instance.
    pub async fn add(
        &self,
        id: &str,
        trigger: CronTrigger,
        callback: JobCallback,
        name: &str,
        signature: &str,
        replace_existing: bool,
    ) -> Result<(), ScheduleError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(ScheduleError::EngineStopped);
        }

        let next_fire = trigger.next_fire_after(Utc::now());
        let mut jobs = self.jobs.write().await;

        let in_flight = match jobs.get(id) {
            Some(existing) if !replace_existing => {
                return Err(ScheduleError::Other(anyhow::anyhow!(
                    "job '{}' is already scheduled",
                    existing.name
                )));
            }
            Some(existing) => Arc::clone(&existing.in_flight),
            None => Arc::new(AtomicUsize::new(0)),
        };

        jobs.insert(
            id.to_string(),
            EngineEntry {
                name: name.to_string(),
                trigger,
                callback,
                signature: signature.to_string(),
                next_fire,
                in_flight,
            },
        );

        tracing::info!(job_id = %id, job_name = %name, next_fire = ?next_fire, "job scheduled");
        Ok(())
    }

    /// Remove a job. Returns false when it was not registered. An in-flight
    /// callback keeps running to completion.
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.jobs.write().await.remove(id).is_some();
        if removed {
            tracing::info!(job_id = %id, "job unscheduled");
        }
        removed
    }

    pub async fn get(&self, id: &str) -> Option<ScheduledJob> {
        let jobs = self.jobs.read().await;
        jobs.get(id).map(|entry| ScheduledJob {
            id: id.to_string(),
            name: entry.name.clone(),
            cron_expression: entry.trigger.expression().to_string(),
            next_fire: entry.next_fire,
            in_flight: entry.in_flight.load(Ordering::Acquire),
        })
    }

    pub async fn list_ids(&self) -> Vec<String> {
        self.jobs.read().await.keys().cloned().collect()
    }

    /// Count of registered jobs, excluding the given reserved ids.
    pub async fn scheduled_count(&self, exclude: &[&str]) -> usize {
        let jobs = self.jobs.read().await;
        jobs.keys().filter(|id| !exclude.contains(&id.as_str())).count()
    }

    /// The change-detection signature recorded at registration time.
    pub async fn signature(&self, id: &str) -> Option<String> {
        let jobs = self.jobs.read().await;
        jobs.get(id).map(|entry| entry.signature.clone())
    }

    /// True once the tick loop has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && self.accepting.load(Ordering::Acquire)
    }

    /// Fire a job immediately, outside its schedule. Competes with scheduled
    /// fires under the same per-job cap: returns Ok(false) when the fire was
    /// dropped at the cap.
    pub async fn trigger_now(
        &self,
        id: &str,
        overrides: Option<TriggerOverrides>,
    ) -> Result<bool, ScheduleError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(ScheduleError::EngineStopped);
        }

        let (callback, in_flight, name) = {
            let jobs = self.jobs.read().await;
            let entry = jobs
                .get(id)
                .ok_or_else(|| ScheduleError::JobNotFound(id.to_string()))?;
            (
                Arc::clone(&entry.callback),
                Arc::clone(&entry.in_flight),
                entry.name.clone(),
            )
        };

        if in_flight.load(Ordering::Acquire) >= MAX_INSTANCES {
            tracing::warn!(
                job_id = %id,
                job_name = %name,
                max_instances = MAX_INSTANCES,
                "manual trigger dropped: job at concurrency cap"
            );
            return Ok(false);
        }

        tracing::info!(job_id = %id, job_name = %name, "job triggered manually");
        self.spawn_worker(
            id,
            callback,
            in_flight,
            Firing {
                trigger_type: TriggerType::Manual,
                overrides,
            },
        );
        Ok(true)
    }

    /// Stop the engine: refuse new fires, stop the tick loop, then wait for
    /// in-flight callbacks (each bounded by its own HTTP timeout).
    pub async fn stop(&self) {
        self.started.store(false, Ordering::Release);
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.notify_waiters();

        if let Some(handle) = self.tick_handle.lock().await.take() {
            let _ = handle.await;
        }

        // Claiming every worker permit means every callback has finished.
        if let Ok(permits) = self.workers.acquire_many(WORKER_POOL_SIZE as u32).await {
            drop(permits);
        }

        tracing::info!("trigger engine stopped");
    }

    /// Evaluate one tick: initiate every due occurrence per job in
    /// scheduled-time order.
    async fn tick(&self, now: DateTime<Utc>) {
        let grace = ChronoDuration::seconds(MISFIRE_GRACE_SECONDS);
        let mut fires: Vec<(String, JobCallback, Arc<AtomicUsize>)> = Vec::new();

        {
            let mut jobs = self.jobs.write().await;
            for (id, entry) in jobs.iter_mut() {
                while let Some(due) = entry.next_fire {
                    if due > now {
                        break;
                    }
                    // Advance before deciding: occurrences are evaluated
                    // one by one and never merged.
                    entry.next_fire = entry.trigger.next_fire_after(due);

                    if now - due > grace {
                        tracing::warn!(
                            job_id = %id,
                            job_name = %entry.name,
                            scheduled_for = %due,
                            grace_seconds = MISFIRE_GRACE_SECONDS,
                            "skipping misfired run"
                        );
                        continue;
                    }

                    if entry.in_flight.load(Ordering::Acquire) >= MAX_INSTANCES {
                        tracing::warn!(
                            job_id = %id,
                            job_name = %entry.name,
                            scheduled_for = %due,
                            max_instances = MAX_INSTANCES,
                            "dropping fire: job at concurrency cap"
                        );
                        continue;
                    }

                    tracing::info!(job_id = %id, job_name = %entry.name, scheduled_for = %due, "job firing");
                    fires.push((
                        id.clone(),
                        Arc::clone(&entry.callback),
                        Arc::clone(&entry.in_flight),
                    ));
                }
            }
        }

        for (id, callback, in_flight) in fires {
            self.spawn_worker(&id, callback, in_flight, Firing::default());
        }
    }

    fn spawn_worker(
        &self,
        id: &str,
        callback: JobCallback,
        in_flight: Arc<AtomicUsize>,
        firing: Firing,
    ) {
        in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = InFlightGuard(in_flight);
        let workers = Arc::clone(&self.workers);
        let job_id = id.to_string();

        tokio::spawn(async move {
            let _guard = guard;
            let permit = match workers.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::debug!(job_id = %job_id, "worker pool closed, dropping fire");
                    return;
                }
            };
            callback(firing).await;
            drop(permit);
        });
    }

    /// Test hook: pin a job's next fire time.
    #[cfg(test)]
    pub(crate) async fn set_next_fire(&self, id: &str, when: DateTime<Utc>) {
        let mut jobs = self.jobs.write().await;
        if let Some(entry) = jobs.get_mut(id) {
            entry.next_fire = Some(when);
        }
    }

    /// Test hook: run one tick synchronously.
    #[cfg(test)]
    pub(crate) async fn tick_for_test(&self, now: DateTime<Utc>) {
        self.tick(now).await;
    }
}

impl Default for TriggerEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_callback(counter: Arc<AtomicUsize>) -> JobCallback {
        Arc::new(move |_firing| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::AcqRel);
            })
        })
    }

    fn blocking_callback(release: Arc<Notify>, started: Arc<AtomicUsize>) -> JobCallback {
        Arc::new(move |_firing| {
            let release = Arc::clone(&release);
            let started = Arc::clone(&started);
            Box::pin(async move {
                started.fetch_add(1, Ordering::AcqRel);
                release.notified().await;
            })
        })
    }

    fn trigger() -> CronTrigger {
        CronTrigger::parse("*/5 * * * *", chrono_tz::UTC).unwrap()
    }

    #[tokio::test]
    async fn add_get_remove_round_trip() {
        let engine = TriggerEngine::new();
        let counter = Arc::new(AtomicUsize::new(0));

        engine
            .add("j1", trigger(), counting_callback(counter), "job one", "sig-1", true)
            .await
            .unwrap();

        let scheduled = engine.get("j1").await.expect("job should be registered");
        assert_eq!(scheduled.name, "job one");
        assert_eq!(scheduled.cron_expression, "*/5 * * * *");
        assert!(scheduled.next_fire.is_some());
        assert_eq!(engine.signature("j1").await.as_deref(), Some("sig-1"));

        assert!(engine.remove("j1").await);
        assert!(!engine.remove("j1").await);
        assert!(engine.get("j1").await.is_none());
    }

    #[tokio::test]
    async fn add_without_replace_rejects_duplicate() {
        let engine = TriggerEngine::new();
        let counter = Arc::new(AtomicUsize::new(0));

        engine
            .add("j1", trigger(), counting_callback(counter.clone()), "one", "a", true)
            .await
            .unwrap();
        let error = engine
            .add("j1", trigger(), counting_callback(counter), "one", "a", false)
            .await
            .expect_err("duplicate without replace must fail");
        assert!(error.to_string().contains("already scheduled"));
    }

    #[tokio::test]
    async fn replace_preserves_in_flight_counter() {
        let engine = TriggerEngine::new();
        let release = Arc::new(Notify::new());
        let started = Arc::new(AtomicUsize::new(0));

        engine
            .add(
                "j1",
                trigger(),
                blocking_callback(release.clone(), started.clone()),
                "one",
                "a",
                true,
            )
            .await
            .unwrap();
        assert!(engine.trigger_now("j1", None).await.unwrap());

        // Let the worker start before replacing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(started.load(Ordering::Acquire), 1);

        engine
            .add(
                "j1",
                trigger(),
                blocking_callback(release.clone(), started.clone()),
                "one",
                "b",
                true,
            )
            .await
            .unwrap();
        assert_eq!(engine.get("j1").await.unwrap().in_flight, 1);

        release.notify_waiters();
    }

    #[tokio::test]
    async fn max_instances_drops_excess_fires() {
        let engine = TriggerEngine::new();
        let release = Arc::new(Notify::new());
        let started = Arc::new(AtomicUsize::new(0));

        engine
            .add(
                "j1",
                trigger(),
                blocking_callback(release.clone(), started.clone()),
                "one",
                "a",
                true,
            )
            .await
            .unwrap();

        for _ in 0..MAX_INSTANCES {
            assert!(engine.trigger_now("j1", None).await.unwrap());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(started.load(Ordering::Acquire), MAX_INSTANCES);

        // The cap is reached: the next fire is dropped, not queued.
        assert!(!engine.trigger_now("j1", None).await.unwrap());

        release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.trigger_now("j1", None).await.unwrap());
        release.notify_waiters();
    }

    #[tokio::test]
    async fn tick_skips_misfires_older_than_grace() {
        let engine = TriggerEngine::new();
        let counter = Arc::new(AtomicUsize::new(0));

        // A yearly schedule keeps the advanced occurrence far from "now".
        let yearly = CronTrigger::parse("0 9 1 1 *", chrono_tz::UTC).unwrap();
        engine
            .add("j1", yearly, counting_callback(counter.clone()), "one", "a", true)
            .await
            .unwrap();

        // The loop wakes up 60 seconds late: outside the 30s grace window.
        let now = Utc::now();
        engine.set_next_fire("j1", now - ChronoDuration::seconds(60)).await;
        engine.tick_for_test(now).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn due_job_fires_once_within_grace() {
        let engine = TriggerEngine::new();
        let counter = Arc::new(AtomicUsize::new(0));

        engine
            .add("j1", trigger(), counting_callback(counter.clone()), "one", "a", true)
            .await
            .unwrap();

        let now = Utc::now();
        engine.set_next_fire("j1", now).await;
        engine.tick_for_test(now).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::Acquire), 1);

        // The occurrence advanced: the same tick input does not re-fire.
        engine.tick_for_test(now).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn stopped_engine_refuses_fires() {
        let engine = Arc::new(TriggerEngine::new());
        let counter = Arc::new(AtomicUsize::new(0));

        engine
            .add("j1", trigger(), counting_callback(counter), "one", "a", true)
            .await
            .unwrap();

        engine.stop().await;
        assert!(!engine.is_running());

        let error = engine.trigger_now("j1", None).await.expect_err("stopped engine");
        assert!(matches!(error, ScheduleError::EngineStopped));

        let add_error = engine
            .add(
                "j2",
                trigger(),
                Arc::new(|_| Box::pin(async {})),
                "two",
                "b",
                true,
            )
            .await
            .expect_err("stopped engine rejects add");
        assert!(matches!(add_error, ScheduleError::EngineStopped));
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_callbacks() {
        let engine = Arc::new(TriggerEngine::new());
        let done = Arc::new(AtomicUsize::new(0));
        let done_clone = Arc::clone(&done);

        let callback: JobCallback = Arc::new(move |_| {
            let done = Arc::clone(&done_clone);
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                done.fetch_add(1, Ordering::AcqRel);
            })
        });

        engine
            .add("j1", trigger(), callback, "one", "a", true)
            .await
            .unwrap();
        assert!(engine.trigger_now("j1", None).await.unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;

        engine.stop().await;
        assert_eq!(done.load(Ordering::Acquire), 1);
    }
}

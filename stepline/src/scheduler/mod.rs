//! Cron and interval scheduling.
//!
//! Each active schedule is armed as one background task that sleeps until
//! the next fire time, records the firing in the run store and asks the
//! [`RunLauncher`] to start a run. Schedules live in the run store, so
//! [`Scheduler::start`] can re-arm them after a restart.

mod trigger;

pub use trigger::Trigger;

use crate::cancellation::CancellationToken;
use crate::core::{ScheduleRecord, ScheduleSpec, ScheduleStatus};
use crate::errors::{Result, SteplineError};
use crate::store::RunStore;
use crate::utils::timestamps::until;
use crate::utils::{generate_schedule_id, now_utc, Timestamp};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Starts runs on behalf of the scheduler.
#[async_trait]
pub trait RunLauncher: Send + Sync {
    /// Launches a run of `pipeline` because `schedule_id` fired.
    async fn launch(&self, pipeline: &str, schedule_id: &str) -> Result<()>;
}

/// A live trigger task.
struct Armed {
    stop: Arc<CancellationToken>,
    handle: JoinHandle<()>,
}

impl Armed {
    fn disarm(self) {
        self.stop.cancel("unscheduled");
        self.handle.abort();
    }
}

/// Owns the live triggers of all active schedules.
pub struct Scheduler {
    store: RunStore,
    launcher: Arc<dyn RunLauncher>,
    armed: DashMap<String, Armed>,
    running: AtomicBool,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("armed", &self.armed.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a stopped scheduler.
    #[must_use]
    pub fn new(store: RunStore, launcher: Arc<dyn RunLauncher>) -> Self {
        Self {
            store,
            launcher,
            armed: DashMap::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Returns true between [`start`](Self::start) and [`stop`](Self::stop).
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Re-arms every active schedule from the run store, recomputing and
    /// persisting its next fire time. Returns how many were armed.
    ///
    /// Schedules whose stored trigger no longer parses are left untouched
    /// and reported in the log.
    pub async fn start(&self) -> Result<usize> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(self.armed.len());
        }

        let now = now_utc();
        let mut count = 0;
        for record in self.store.list_schedules(true).await? {
            let trigger = match Trigger::from_spec(&record.spec) {
                Ok(trigger) => trigger,
                Err(err) => {
                    warn!(schedule_id = %record.id, error = %err, "Skipping unparseable schedule");
                    continue;
                }
            };
            let anchor = record.last_run.unwrap_or(record.created_at);
            let next = trigger.next_fire(anchor, now);
            self.store.update_schedule_next_run(&record.id, next).await?;
            self.arm(&record.id, &record.pipeline_name, trigger, next);
            count += 1;
        }

        info!(armed = count, "Scheduler started");
        Ok(count)
    }

    /// Disarms every live trigger. Persisted schedules are untouched.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let ids: Vec<String> = self.armed.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, armed)) = self.armed.remove(&id) {
                armed.disarm();
            }
        }
        info!("Scheduler stopped");
    }

    /// Validates and persists a new schedule, arming it if the scheduler is
    /// running.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a bad trigger before anything is
    /// written, or a store error if persisting fails.
    pub async fn schedule(&self, pipeline: &str, spec: ScheduleSpec) -> Result<ScheduleRecord> {
        let trigger = Trigger::from_spec(&spec)?;
        let created_at = now_utc();
        let next_run = trigger.next_after(created_at);

        let record = ScheduleRecord {
            id: generate_schedule_id(pipeline),
            pipeline_name: pipeline.to_string(),
            spec,
            status: ScheduleStatus::Active,
            created_at,
            last_run: None,
            next_run,
        };
        self.store.insert_schedule(&record).await?;

        if self.is_running() {
            self.arm(&record.id, pipeline, trigger, next_run);
        }
        info!(
            schedule_id = %record.id,
            pipeline = %pipeline,
            trigger = %record.spec,
            next_run = ?next_run,
            "Pipeline scheduled"
        );
        Ok(record)
    }

    /// Marks inactive, then disarms, every active schedule whose id or
    /// pipeline name is `key`. Returns the ids.
    ///
    /// The records are deactivated together; if that fails, every live
    /// trigger is left armed and the store is unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`SteplineError::ScheduleNotFound`] when nothing matches, or
    /// a store error if the records could not be deactivated.
    pub async fn unschedule(&self, key: &str) -> Result<Vec<String>> {
        let matches = self.store.find_active_schedules(key).await?;
        if matches.is_empty() {
            return Err(SteplineError::ScheduleNotFound(key.to_string()));
        }

        let ids: Vec<String> = matches.iter().map(|r| r.id.clone()).collect();
        self.store.deactivate_schedules(&ids).await?;

        for record in &matches {
            if let Some((_, armed)) = self.armed.remove(&record.id) {
                armed.disarm();
            }
            info!(schedule_id = %record.id, pipeline = %record.pipeline_name, "Pipeline unscheduled");
        }
        Ok(ids)
    }

    /// Persisted schedules, oldest first.
    pub async fn list(&self, active_only: bool) -> Result<Vec<ScheduleRecord>> {
        self.store.list_schedules(active_only).await
    }

    /// Returns true if `schedule_id` has a live trigger.
    #[must_use]
    pub fn is_armed(&self, schedule_id: &str) -> bool {
        self.armed.contains_key(schedule_id)
    }

    /// Number of live triggers.
    #[must_use]
    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }

    fn arm(&self, id: &str, pipeline: &str, trigger: Trigger, first: Option<Timestamp>) {
        let stop = Arc::new(CancellationToken::new());
        let handle = tokio::spawn(fire_loop(
            self.store.clone(),
            self.launcher.clone(),
            id.to_string(),
            pipeline.to_string(),
            trigger,
            first,
            stop.clone(),
        ));
        if let Some(previous) = self.armed.insert(id.to_string(), Armed { stop, handle }) {
            previous.disarm();
        }
        debug!(schedule_id = %id, pipeline = %pipeline, next_run = ?first, "Trigger armed");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for entry in self.armed.iter() {
            entry.value().stop.cancel("scheduler dropped");
            entry.value().handle.abort();
        }
    }
}

async fn fire_loop(
    store: RunStore,
    launcher: Arc<dyn RunLauncher>,
    id: String,
    pipeline: String,
    trigger: Trigger,
    first: Option<Timestamp>,
    stop: Arc<CancellationToken>,
) {
    let mut next = first;
    while let Some(at) = next {
        tokio::select! {
            biased;
            () = stop.cancelled() => return,
            () = tokio::time::sleep(until(at)) => {}
        }

        let fired_at = now_utc();
        next = trigger.next_fire(at, fired_at);
        if let Err(err) = store.record_schedule_fire(&id, fired_at, next).await {
            warn!(schedule_id = %id, error = %err, "Failed to record schedule firing");
        }
        info!(schedule_id = %id, pipeline = %pipeline, next_run = ?next, "Schedule fired");

        let launcher = launcher.clone();
        let (pipeline, id) = (pipeline.clone(), id.clone());
        tokio::spawn(async move {
            if let Err(err) = launcher.launch(&pipeline, &id).await {
                warn!(schedule_id = %id, pipeline = %pipeline, error = %err, "Scheduled run failed to launch");
            }
        });
    }
    debug!(schedule_id = %id, "Trigger has no further fire times");
}

use chrono::{DateTime, Local, NaiveTime, TimeZone, Timelike, Utc};
use common::{Job, JobId, Run, ScheduledEntry, SchedulePolicy};
use cron::Schedule;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};

use crate::db::{Database, Storage};
use crate::executor;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Job {0} is not active")]
    JobInactive(JobId),
    #[error("Job {0} is already running")]
    JobBusy(JobId),
    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
    #[error("Execution task failed: {0}")]
    Task(String),
}

/// Why an execution was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Scheduled,
    Manual,
}

/// Executes a job by id. Called on a blocking worker thread.
pub trait JobRunner: Send + Sync + 'static {
    fn run(&self, job_id: JobId, source: TriggerSource) -> Result<Run, DispatchError>;
}

/// Looks the job up in its own storage connection at fire time and backs it up.
pub struct BackupRunner {
    db: Database,
    keep: usize,
}

impl BackupRunner {
    pub fn new(db: Database, keep: usize) -> Self {
        Self { db, keep }
    }
}

impl JobRunner for BackupRunner {
    fn run(&self, job_id: JobId, source: TriggerSource) -> Result<Run, DispatchError> {
        let store = self.db.connect()?;
        let job = store.get_job(job_id)?.ok_or(DispatchError::JobNotFound(job_id))?;
        if source == TriggerSource::Scheduled && !job.active {
            return Err(DispatchError::JobInactive(job_id));
        }
        log::info!("Starting {:?} backup for job {} ({})", source, job.id, job.name);
        Ok(executor::execute(&store, &job, self.keep))
    }
}

/// Hands executions to blocking workers, at most one per job at a time.
#[derive(Clone)]
struct Dispatcher {
    in_flight: Arc<DashMap<JobId, DateTime<Utc>>>,
    runner: Arc<dyn JobRunner>,
    handle: Handle,
}

/// Clears the in-flight marker when the execution ends, even by panic.
struct InFlight {
    in_flight: Arc<DashMap<JobId, DateTime<Utc>>>,
    job_id: JobId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.in_flight.remove(&self.job_id);
    }
}

impl Dispatcher {
    fn fire(
        &self,
        job_id: JobId,
        source: TriggerSource,
    ) -> Result<JoinHandle<Result<Run, DispatchError>>, DispatchError> {
        match self.in_flight.entry(job_id) {
            Entry::Occupied(started) => {
                log::warn!(
                    "Job {} still running since {}; skipping {:?} trigger",
                    job_id,
                    started.get().to_rfc3339(),
                    source
                );
                return Err(DispatchError::JobBusy(job_id));
            }
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
            }
        }

        let guard = InFlight { in_flight: self.in_flight.clone(), job_id };
        let runner = self.runner.clone();
        Ok(self.handle.spawn_blocking(move || {
            let _guard = guard;
            let result = runner.run(job_id, source);
            match &result {
                Ok(run) => log::debug!("Job {} run {} ended with status {}", job_id, run.id, run.status),
                Err(DispatchError::JobInactive(_)) => log::info!("Job {} is inactive; skipping run", job_id),
                Err(e) => log::warn!("Skipping run of job {}: {}", job_id, e),
            }
            result
        }))
    }
}

struct ScheduledTrigger {
    policy: SchedulePolicy,
    task: JoinHandle<()>,
}

impl Drop for ScheduledTrigger {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Default)]
struct State {
    started: bool,
    triggers: HashMap<JobId, ScheduledTrigger>,
}

/// Owns the trigger registry. `start`, `stop` and `reload` are serialized by
/// one lock; triggers never cache job data, they only carry the job id.
pub struct Scheduler {
    state: Mutex<State>,
    dispatcher: Dispatcher,
    db: Database,
    daily_at: NaiveTime,
}

impl Scheduler {
    /// Must be called from within a tokio runtime; triggers run on it.
    pub fn new(db: Database, runner: Arc<dyn JobRunner>, daily_at: NaiveTime) -> Self {
        Self {
            state: Mutex::new(State::default()),
            dispatcher: Dispatcher {
                in_flight: Arc::new(DashMap::new()),
                runner,
                handle: Handle::current(),
            },
            db,
            daily_at,
        }
    }

    pub fn start(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.started {
            return Ok(());
        }
        state.started = true;
        log::info!("Scheduler started");
        self.reload_locked(&mut state)
    }

    /// Cancels pending triggers. Executions already running are not interrupted.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.started {
            return;
        }
        state.triggers.clear();
        state.started = false;
        log::info!("Scheduler stopped");
    }

    pub fn reload(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.started {
            log::debug!("reload() called while scheduler is not started");
            return Ok(());
        }
        self.reload_locked(&mut state)
    }

    fn reload_locked(&self, state: &mut State) -> anyhow::Result<()> {
        // Read first so a storage failure leaves the current triggers in place.
        let jobs = self.db.connect()?.active_jobs()?;

        state.triggers.clear();
        for job in jobs {
            if let Some(policy) = self.trigger_policy(&job) {
                let task = self.dispatcher.handle.spawn(drive(
                    job.id,
                    policy,
                    self.daily_at,
                    self.dispatcher.clone(),
                ));
                state.triggers.insert(job.id, ScheduledTrigger { policy, task });
                log::info!("Scheduled job {} ({}) {}", job.id, job.name, policy);
            }
        }

        log::info!("Scheduler reloaded {} triggers", state.triggers.len());
        Ok(())
    }

    fn trigger_policy(&self, job: &Job) -> Option<SchedulePolicy> {
        if !job.active {
            return None;
        }
        match job.schedule() {
            Ok(SchedulePolicy::Manual) => None,
            Ok(policy) => Some(policy),
            Err(e) => {
                log::warn!("Job {} ({}) has an invalid schedule; skipping scheduling: {}", job.id, job.name, e);
                None
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().unwrap().started
    }

    pub fn scheduled_jobs(&self) -> Vec<ScheduledEntry> {
        let state = self.state.lock().unwrap();
        let mut entries: Vec<ScheduledEntry> = state
            .triggers
            .iter()
            .map(|(job_id, trigger)| ScheduledEntry { job_id: *job_id, policy: trigger.policy })
            .collect();
        entries.sort_by_key(|e| e.job_id);
        entries
    }

    /// Requests a scheduled execution without waiting for it.
    pub fn trigger(&self, job_id: JobId) -> Result<JoinHandle<Result<Run, DispatchError>>, DispatchError> {
        self.dispatcher.fire(job_id, TriggerSource::Scheduled)
    }

    /// Runs a job right away, even when inactive, and waits for the result.
    pub async fn run_now(&self, job_id: JobId) -> Result<Run, DispatchError> {
        let handle = self.dispatcher.fire(job_id, TriggerSource::Manual)?;
        handle.await.map_err(|e| DispatchError::Task(e.to_string()))?
    }
}

async fn drive(job_id: JobId, policy: SchedulePolicy, daily_at: NaiveTime, dispatcher: Dispatcher) {
    match policy {
        SchedulePolicy::Manual => {}
        SchedulePolicy::Interval { minutes } => {
            let period = Duration::from_secs(u64::from(minutes) * 60);
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let _ = dispatcher.fire(job_id, TriggerSource::Scheduled);
            }
        }
        SchedulePolicy::Daily => {
            let schedule = match daily_schedule(daily_at) {
                Ok(schedule) => schedule,
                Err(e) => {
                    log::error!("Invalid daily schedule for job {}: {}", job_id, e);
                    return;
                }
            };
            let mut cursor = Local::now();
            while let Some(next) = next_fire(&schedule, &cursor) {
                let wait = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
                let _ = dispatcher.fire(job_id, TriggerSource::Scheduled);
                cursor = next.max(Local::now());
            }
        }
    }
}

fn daily_schedule(at: NaiveTime) -> Result<Schedule, cron::error::Error> {
    Schedule::from_str(&format!("0 {} {} * * *", at.minute(), at.hour()))
}

/// First fire time strictly after `after`.
fn next_fire<Z: TimeZone>(schedule: &Schedule, after: &DateTime<Z>) -> Option<DateTime<Z>> {
    schedule.after(after).next()
}

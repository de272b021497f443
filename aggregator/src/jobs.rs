//! Recurring background jobs.
//!
//! Every registered job gets its own task that wakes on a fixed interval or on
//! a command sent through its channel. Registering an id a second time
//! replaces the running task.

use crate::errors::AppError;
use crate::metrics_defs::JOB_FAILURES;
use crate::services::DomainService;
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self) -> Result<(), AppError>;
}

#[derive(Debug)]
pub enum Command {
    // Run outside of the normal interval.
    RunNow,
    // Stop the job's task after any run in progress.
    Shutdown,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum JobError {
    #[error("no job registered as {0}")]
    UnknownJob(String),
    #[error("job {0} has a zero interval")]
    ZeroInterval(String),
    #[error("job {0} is no longer running")]
    Stopped(String),
}

struct JobHandle {
    tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

#[derive(Default)]
pub struct JobScheduler {
    jobs: Mutex<IndexMap<String, JobHandle>>,
}

impl JobScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `job` every `every`, the first time one interval from now.
    pub fn register(
        &self,
        id: impl Into<String>,
        every: Duration,
        job: Arc<dyn Job>,
    ) -> Result<(), JobError> {
        let id = id.into();
        if every.is_zero() {
            return Err(JobError::ZeroInterval(id));
        }

        let (tx, rx) = mpsc::channel::<Command>(8);
        let task = tokio::spawn(run_loop(id.clone(), every, job, rx));

        if let Some(previous) = self.jobs.lock().insert(id.clone(), JobHandle { tx, task }) {
            previous.task.abort();
            tracing::info!(job = %id, "job replaced");
        }
        tracing::info!(job = %id, every_secs = every.as_secs_f64(), "job registered");
        Ok(())
    }

    pub async fn trigger(&self, id: &str) -> Result<(), JobError> {
        let tx = self
            .jobs
            .lock()
            .get(id)
            .map(|handle| handle.tx.clone())
            .ok_or_else(|| JobError::UnknownJob(id.to_string()))?;

        tx.send(Command::RunNow)
            .await
            .map_err(|_| JobError::Stopped(id.to_string()))
    }

    /// Stops every job, waiting for runs in progress to finish.
    pub async fn shutdown(&self) {
        let jobs: Vec<_> = self.jobs.lock().drain(..).collect();
        for (id, handle) in jobs {
            // A closed channel means the task has already exited.
            let _ = handle.tx.send(Command::Shutdown).await;
            if let Err(e) = handle.task.await {
                tracing::warn!(job = %id, error = %e, "job task ended abnormally");
            }
        }
        tracing::info!("scheduler stopped");
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.lock().keys().cloned().collect()
    }
}

async fn run_loop(id: String, every: Duration, job: Arc<dyn Job>, mut rx: mpsc::Receiver<Command>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            cmd = rx.recv() => match cmd {
                Some(Command::RunNow) => tracing::debug!(job = %id, "run requested"),
                Some(Command::Shutdown) | None => break,
            },
        }
        execute(&id, job.as_ref()).await;
    }
    tracing::debug!(job = %id, "job task exiting");
}

async fn execute(id: &str, job: &dyn Job) {
    match job.run().await {
        Ok(()) => tracing::debug!(job = id, "job run finished"),
        Err(e) if e.is_conflict() => {
            tracing::info!(job = id, reason = %e, "job skipped, another run is in flight")
        }
        Err(e) => {
            shared::counter!(JOB_FAILURES, "job" => id.to_string()).increment(1);
            tracing::error!(job = id, error = %e, "job run failed");
        }
    }
}

/// Runs a domain aggregation on schedule.
pub struct AggregationJob(pub Arc<dyn DomainService>);

#[async_trait]
impl Job for AggregationJob {
    async fn run(&self) -> Result<(), AppError> {
        self.0.aggregate().await.map(|_| ())
    }
}

/// Empties a domain's mirror on schedule.
pub struct PurgeJob(pub Arc<dyn DomainService>);

#[async_trait]
impl Job for PurgeJob {
    async fn run(&self) -> Result<(), AppError> {
        self.0.purge().await.map(|_| ())
    }
}

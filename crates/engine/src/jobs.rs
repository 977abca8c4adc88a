// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background execution of provisioning and teardown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::assignment::TeamAssignment;
use crate::error::EngineError;
use crate::template::ScenarioTemplate;

pub type JobId = Uuid;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub run_id: Uuid,
    pub scenario_id: String,
    pub started_by: String,
    pub template: Arc<ScenarioTemplate>,
    pub assignment: TeamAssignment,
}

#[derive(Debug, Clone)]
pub struct TeardownRequest {
    pub run_id: Uuid,
}

#[derive(Debug, Clone)]
pub enum Job {
    Provision(ProvisionRequest),
    Teardown(TeardownRequest),
}

impl Job {
    pub fn run_id(&self) -> Uuid {
        match self {
            Job::Provision(request) => request.run_id,
            Job::Teardown(request) => request.run_id,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Job::Provision(_) => "provision",
            Job::Teardown(_) => "teardown",
        }
    }
}

#[async_trait::async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job, cancel: CancellationToken) -> Result<(), EngineError>;

    /// Called for queued jobs that are dropped without running.
    fn abandon(&self, _job: Job) {}
}

type Queue = Arc<Mutex<mpsc::Receiver<(JobId, Job)>>>;

#[derive(Debug, Clone)]
struct JobEntry {
    status: JobStatus,
    finished_at: Option<Instant>,
}

#[derive(Clone)]
struct Statuses(Arc<DashMap<JobId, JobEntry>>);

impl Statuses {
    fn set(&self, job_id: JobId, status: JobStatus) {
        let finished_at = match status {
            JobStatus::Queued | JobStatus::Running => None,
            JobStatus::Completed | JobStatus::Failed(_) => Some(Instant::now()),
        };
        self.0.insert(
            job_id,
            JobEntry {
                status,
                finished_at,
            },
        );
    }

    /// Forgets jobs that finished longer than `retention` ago.
    fn prune(&self, retention: Duration) {
        self.0
            .retain(|_, entry| entry.finished_at.is_none_or(|at| at.elapsed() < retention));
    }
}

/// A fixed set of workers draining a bounded job queue.
///
/// Statuses of finished jobs are kept for `retention` and dropped on a later
/// submission.
pub struct WorkerPool {
    sender: mpsc::Sender<(JobId, Job)>,
    receiver: Queue,
    statuses: Statuses,
    retention: Duration,
    handler: Arc<dyn JobHandler>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn start(
        handler: Arc<dyn JobHandler>,
        workers: usize,
        capacity: usize,
        retention: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let pool = Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            statuses: Statuses(Arc::new(DashMap::new())),
            retention,
            handler,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };
        for worker in 0..workers.max(1) {
            pool.tracker.spawn(run_worker(
                worker,
                pool.receiver.clone(),
                pool.statuses.clone(),
                pool.handler.clone(),
                pool.cancel.clone(),
            ));
        }
        tracing::info!("Started {} job workers", workers.max(1));
        pool
    }

    /// Queues a job. Waits for room when the queue is full.
    pub async fn submit(&self, job: Job) -> Result<JobId, EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::QueueClosed);
        }
        self.statuses.prune(self.retention);
        let job_id = Uuid::now_v7();
        self.statuses.set(job_id, JobStatus::Queued);
        if self.sender.send((job_id, job)).await.is_err() {
            self.statuses.0.remove(&job_id);
            return Err(EngineError::QueueClosed);
        }
        Ok(job_id)
    }

    pub fn status(&self, job_id: JobId) -> Option<JobStatus> {
        self.statuses.0.get(&job_id).map(|e| e.status.clone())
    }

    /// Stops the workers. Running jobs see their token cancelled; jobs still
    /// queued are marked failed and handed back to the handler.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        while let Ok((job_id, job)) = receiver.try_recv() {
            tracing::warn!("Dropping queued {} job {job_id} on shutdown", job.name());
            self.statuses.set(
                job_id,
                JobStatus::Failed("shut down before it started".to_string()),
            );
            self.handler.abandon(job);
        }
    }
}

async fn run_worker(
    worker: usize,
    receiver: Queue,
    statuses: Statuses,
    handler: Arc<dyn JobHandler>,
    cancel: CancellationToken,
) {
    loop {
        let next = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = receiver.recv() => next,
            }
        };
        let Some((job_id, job)) = next else {
            break;
        };
        if cancel.is_cancelled() {
            statuses.set(
                job_id,
                JobStatus::Failed("shut down before it started".to_string()),
            );
            handler.abandon(job);
            break;
        }

        let name = job.name();
        let run_id = job.run_id();
        tracing::info!("Worker {worker} running {name} job {job_id} for run {run_id}");
        statuses.set(job_id, JobStatus::Running);
        match handler.handle(job, cancel.child_token()).await {
            Ok(()) => {
                tracing::info!("{name} job {job_id} for run {run_id} completed");
                statuses.set(job_id, JobStatus::Completed);
            }
            Err(e) => {
                tracing::error!("{name} job {job_id} for run {run_id} failed: {e}");
                statuses.set(job_id, JobStatus::Failed(e.to_string()));
            }
        }
    }
    tracing::debug!("Worker {worker} stopped");
}

//! In-process task queue and worker pool.
//!
//! # Responsibilities
//! 1. Hand task ids to a fixed number of workers
//! 2. Re-deliver jobs whose claim failed for a transient reason
//! 3. Recover tasks left behind by a previous process
//! 4. Stop workers after their current job on shutdown
//!
//! Delivery is at-least-once. Duplicate deliveries are harmless: only the
//! worker whose compare-and-set claim succeeds runs the task.

mod worker;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agents::{Orchestrator, RunConfig};
use crate::cache::ResultCache;
use crate::error::{ResearchError, ResearchResult};
use crate::notify::{Notifier, TaskEvent};
use crate::store::TaskStore;
use crate::task::{JobId, TaskId, TaskStatus};

pub use worker::StoreObserver;

/// Error text stored on tasks a crashed process left in `processing`.
pub const INTERRUPTED_ERROR: &str = "interrupted: the service stopped while this task was running";

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub workers: usize,
    /// Deliveries per job, counting the first.
    pub max_attempts: u32,
    /// Wall-clock limit of one research run.
    pub time_limit: Duration,
    /// Base delay before a job is re-delivered; grows linearly per attempt.
    pub retry_backoff: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_attempts: 3,
            time_limit: Duration::from_secs(600),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Job {
    pub id: JobId,
    pub task_id: TaskId,
    pub attempt: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub interrupted: usize,
}

/// Everything a worker needs to run a task.
pub(crate) struct Shared {
    pub store: TaskStore,
    pub cache: ResultCache,
    pub notifier: Notifier,
    pub orchestrator: Arc<Orchestrator>,
    pub run_config: RunConfig,
    pub config: QueueConfig,
    pub tx: mpsc::UnboundedSender<Job>,
    pub pending: AtomicUsize,
    pub cancel: CancellationToken,
}

impl Shared {
    pub(crate) fn send(&self, job: Job) -> ResearchResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ResearchError::Internal("task queue is shut down".to_string()));
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.tx.send(job).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            ResearchError::Internal("task queue is closed".to_string())
        })
    }
}

pub struct TaskQueue {
    shared: Arc<Shared>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(
        store: TaskStore,
        cache: ResultCache,
        notifier: Notifier,
        orchestrator: Arc<Orchestrator>,
        run_config: RunConfig,
        config: QueueConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                store,
                cache,
                notifier,
                orchestrator,
                run_config,
                config,
                tx,
                pending: AtomicUsize::new(0),
                cancel: CancellationToken::new(),
            }),
            rx: Arc::new(Mutex::new(rx)),
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool. Calling it twice adds more workers.
    pub fn start(&self) {
        let workers = self.shared.config.workers.max(1);
        let mut handles = match self.handles.lock() {
            Ok(handles) => handles,
            Err(poisoned) => poisoned.into_inner(),
        };
        for n in 0..workers {
            let shared = Arc::clone(&self.shared);
            let rx = Arc::clone(&self.rx);
            handles.push(tokio::spawn(worker::run(n, shared, rx)));
        }
        tracing::info!(workers, "Task queue workers started");
    }

    /// Queue a task under a fresh job id.
    pub fn enqueue(&self, task_id: TaskId) -> ResearchResult<JobId> {
        let job_id = JobId::new();
        self.enqueue_job(task_id, job_id)?;
        Ok(job_id)
    }

    /// Queue a task under a job id the caller already recorded.
    pub fn enqueue_job(&self, task_id: TaskId, job_id: JobId) -> ResearchResult<()> {
        self.shared.send(Job {
            id: job_id,
            task_id,
            attempt: 1,
        })?;
        tracing::debug!(task_id = %task_id, job_id = %job_id, "Job enqueued");
        Ok(())
    }

    /// Jobs waiting for a worker.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.shared.run_config
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Settle tasks left behind by a previous process.
    ///
    /// `queued` tasks are queued again. `processing` tasks are failed: their
    /// partial messages are already stored, so re-running them would
    /// duplicate turns.
    pub async fn recover(&self) -> ResearchResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for task_id in self.shared.store.ids_with_status(TaskStatus::Processing).await? {
            match self
                .shared
                .store
                .fail(task_id, INTERRUPTED_ERROR.to_string())
                .await
            {
                Ok(()) => {
                    self.shared
                        .notifier
                        .publish(TaskEvent::failed(task_id, INTERRUPTED_ERROR));
                    report.interrupted += 1;
                }
                Err(e) => tracing::warn!(task_id = %task_id, error = %e, "Could not fail orphaned task"),
            }
        }

        for task_id in self.shared.store.ids_with_status(TaskStatus::Queued).await? {
            self.enqueue(task_id)?;
            report.requeued += 1;
        }

        if report.requeued > 0 || report.interrupted > 0 {
            tracing::info!(
                requeued = report.requeued,
                interrupted = report.interrupted,
                "Recovered tasks from previous run"
            );
        }
        Ok(report)
    }

    /// Stop accepting work and wait for workers to finish their current job.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let handles: Vec<_> = match self.handles.lock() {
            Ok(mut handles) => handles.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        tracing::info!("Task queue stopped");
    }
}

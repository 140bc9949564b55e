use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};

use super::{Job, Shared};
use crate::agents::{Role, Turn, TurnObserver};
use crate::cache::CachedResult;
use crate::error::{ResearchError, ResearchResult};
use crate::notify::{Notifier, TaskEvent};
use crate::store::{ClaimOutcome, StoreError, TaskStore};
use crate::task::{Progress, Task, TaskId};

/// Persists each turn as it happens and announces it.
pub struct StoreObserver {
    task_id: TaskId,
    store: TaskStore,
    notifier: Notifier,
    max_turns: u32,
}

impl StoreObserver {
    pub fn new(task_id: TaskId, store: TaskStore, notifier: Notifier, max_turns: u32) -> Self {
        Self {
            task_id,
            store,
            notifier,
            max_turns,
        }
    }
}

#[async_trait]
impl TurnObserver for StoreObserver {
    async fn turn_started(&self, turn: u32, role: Role) -> ResearchResult<()> {
        let progress = Progress {
            role: role.name().to_string(),
            turn,
            max_turns: self.max_turns,
        };
        self.store.set_progress(self.task_id, progress.clone()).await?;
        self.notifier
            .publish(TaskEvent::turn_started(self.task_id, &progress));
        Ok(())
    }

    async fn turn_finished(&self, turn: &Turn) -> ResearchResult<()> {
        let message = turn.to_message();
        self.store.append_message(self.task_id, message.clone()).await?;
        self.notifier
            .publish(TaskEvent::message(self.task_id, &message));
        Ok(())
    }
}

/// Worker loop: take jobs until the queue is cancelled or closed.
pub(super) async fn run(
    worker: usize,
    shared: Arc<Shared>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
) {
    tracing::debug!(worker, "Worker started");
    loop {
        let job = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            job = async { rx.lock().await.recv().await } => job,
        };
        let Some(job) = job else {
            break;
        };
        shared.pending.fetch_sub(1, Ordering::SeqCst);
        process(worker, &shared, job).await;
    }
    tracing::debug!(worker, "Worker stopped");
}

async fn process(worker: usize, shared: &Arc<Shared>, job: Job) {
    let task = match shared.store.claim(job.task_id, job.id).await {
        Ok(ClaimOutcome::Claimed(task)) => task,
        Ok(ClaimOutcome::NotQueued(status)) => {
            tracing::info!(
                task_id = %job.task_id,
                job_id = %job.id,
                status = %status,
                "Task is not queued; dropping job"
            );
            return;
        }
        Err(StoreError::NotFound(_)) => {
            tracing::warn!(task_id = %job.task_id, job_id = %job.id, "Task vanished; dropping job");
            return;
        }
        Err(e) => {
            redeliver(shared, job, &e.to_string());
            return;
        }
    };

    tracing::info!(
        worker,
        task_id = %task.id,
        job_id = %job.id,
        attempt = job.attempt,
        "Research task started"
    );
    execute(shared, task).await;
}

/// Put a job back after a transient failure, or give up.
fn redeliver(shared: &Arc<Shared>, job: Job, reason: &str) {
    if job.attempt >= shared.config.max_attempts {
        // The task stays queued; startup recovery will pick it up again.
        tracing::error!(
            task_id = %job.task_id,
            job_id = %job.id,
            attempts = job.attempt,
            error = %reason,
            "Giving up on job"
        );
        return;
    }

    let delay = shared.config.retry_backoff * job.attempt;
    tracing::warn!(
        task_id = %job.task_id,
        job_id = %job.id,
        attempt = job.attempt,
        delay_ms = delay.as_millis() as u64,
        error = %reason,
        "Claim failed; re-delivering job"
    );
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        tokio::select! {
            _ = shared.cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {
                let next = Job { attempt: job.attempt + 1, ..job };
                if let Err(e) = shared.send(next) {
                    tracing::warn!(task_id = %job.task_id, error = %e, "Could not re-deliver job");
                }
            }
        }
    });
}

/// Run a claimed task to a terminal state.
async fn execute(shared: &Arc<Shared>, task: Task) {
    let task_id = task.id;
    let config = &shared.run_config;
    let observer = StoreObserver::new(
        task_id,
        shared.store.clone(),
        shared.notifier.clone(),
        config.max_turns,
    );
    let limit = shared.config.time_limit;

    let run = shared.orchestrator.run(&task.text, config, &observer);
    let result = match tokio::time::timeout(limit, run).await {
        Ok(result) => result,
        Err(_) => Err(ResearchError::Timeout(limit)),
    };

    match result {
        Ok(outcome) => {
            let metrics = outcome.metrics();
            if let Err(e) = shared.store.complete(task_id, metrics.clone()).await {
                tracing::error!(task_id = %task_id, error = %e, "Could not record completion");
                fail(shared, task_id, &ResearchError::from(e)).await;
                return;
            }
            tracing::info!(
                task_id = %task_id,
                turns = outcome.transcript.len(),
                stop = ?outcome.stop,
                total_tokens = metrics.total_tokens,
                duration_secs = metrics.duration_secs,
                "Research task completed"
            );
            shared
                .cache
                .put(
                    &task.text,
                    &CachedResult {
                        source_task_id: task_id,
                        messages: outcome.transcript.messages(),
                        metrics: metrics.clone(),
                        cached_at: Utc::now(),
                    },
                )
                .await;
            shared
                .notifier
                .publish(TaskEvent::completed(task_id, &metrics, false));
        }
        Err(e) => fail(shared, task_id, &e).await,
    }
}

async fn fail(shared: &Arc<Shared>, task_id: TaskId, error: &ResearchError) {
    let message = error.to_string();
    tracing::warn!(
        task_id = %task_id,
        error = %message,
        retryable = error.is_retryable(),
        "Research task failed"
    );
    match shared.store.fail(task_id, message.clone()).await {
        Ok(()) => {
            shared.notifier.publish(TaskEvent::failed(task_id, &message));
        }
        Err(e) => {
            // Left in processing; recovery on next start will fail it.
            tracing::error!(task_id = %task_id, error = %e, "Could not record failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::{QueueConfig, TaskQueue, INTERRUPTED_ERROR};
    use super::*;
    use crate::agents::{AgentContext, Orchestrator, RunConfig};
    use crate::cache::{MemoryCache, ResultCache};
    use crate::llm::{LlmErrorKind, RetryConfig, ScriptedClient, ScriptedReply};
    use crate::notify::EventKind;
    use crate::task::{JobId, TaskStatus};

    struct Harness {
        store: TaskStore,
        cache: ResultCache,
        notifier: Notifier,
        queue: TaskQueue,
        client: Arc<ScriptedClient>,
    }

    fn harness(client: ScriptedClient, time_limit: Duration) -> Harness {
        harness_with(
            client,
            QueueConfig {
                workers: 2,
                time_limit,
                retry_backoff: Duration::from_millis(10),
                ..QueueConfig::default()
            },
        )
    }

    fn harness_with(client: ScriptedClient, config: QueueConfig) -> Harness {
        let store = TaskStore::open_in_memory().unwrap();
        let cache = ResultCache::new(Arc::new(MemoryCache::new()), Duration::from_secs(3600));
        let notifier = Notifier::new();
        let client = Arc::new(client);
        let orchestrator = Arc::new(Orchestrator::new(Arc::new(AgentContext::new(
            client.clone(),
        ))));
        let queue = TaskQueue::new(
            store.clone(),
            cache.clone(),
            notifier.clone(),
            orchestrator,
            RunConfig::default(),
            config,
        );
        Harness {
            store,
            cache,
            notifier,
            queue,
            client,
        }
    }

    async fn wait_terminal(store: &TaskStore, id: TaskId) -> Task {
        for _ in 0..500 {
            let task = store.get_task(id).await.unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never finished");
    }

    #[tokio::test]
    async fn test_job_runs_to_completion() {
        let h = harness(ScriptedClient::demo(), Duration::from_secs(30));
        let mut events = h.notifier.subscribe();
        h.queue.start();

        let task = h.store.create_task(Task::queued("Explain X", None)).await.unwrap();
        h.queue.enqueue(task.id).unwrap();
        let done = wait_terminal(&h.store, task.id).await;
        assert_eq!(done.status, TaskStatus::Completed);

        let detail = h.store.get_detail(task.id).await.unwrap();
        let agents: Vec<&str> = detail.messages.iter().map(|m| m.agent.as_str()).collect();
        assert_eq!(agents, vec!["Researcher", "Analyst", "Writer", "Critic"]);
        assert!(detail.metrics.unwrap().total_tokens > 0);

        // Two progress events per turn, then completion.
        let mut kinds = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            kinds.push(event.event);
            if event.event == EventKind::Completed {
                break;
            }
        }
        assert_eq!(kinds.len(), 9);
        assert!(kinds[..8].iter().all(|k| *k == EventKind::Progress));
        // Cached before completion is announced.
        assert!(h.cache.get("explain x").await.is_some());
        h.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_delivery_runs_once() {
        let h = harness(ScriptedClient::demo(), Duration::from_secs(30));
        let task = h.store.create_task(Task::queued("Explain X", None)).await.unwrap();
        h.queue.enqueue(task.id).unwrap();
        h.queue.enqueue(task.id).unwrap();
        h.queue.start();

        wait_terminal(&h.store, task.id).await;
        // Let the second delivery drain.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.client.call_count(), 4);
        assert_eq!(h.store.message_count(task.id).await.unwrap(), 4);
        h.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_gateway_failure_fails_task() {
        let h = harness(
            ScriptedClient::failing(LlmErrorKind::BadRequest),
            Duration::from_secs(30),
        );
        h.queue.start();
        let task = h.store.create_task(Task::queued("Explain X", None)).await.unwrap();
        h.queue.enqueue(task.id).unwrap();

        let done = wait_terminal(&h.store, task.id).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(!done.error.unwrap_or_default().is_empty());
        assert!(h.store.get_detail(task.id).await.unwrap().metrics.is_none());
        assert!(h.cache.get("Explain X").await.is_none());
        h.queue.shutdown().await;
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_transient_claim_failure_is_redelivered_and_runs_once() {
        let h = harness(ScriptedClient::demo(), Duration::from_secs(30));
        h.store.fail_next_claims(1);
        h.queue.start();

        let task = h.store.create_task(Task::queued("Explain X", None)).await.unwrap();
        let job_id = h.queue.enqueue(task.id).unwrap();
        let done = wait_terminal(&h.store, task.id).await;
        assert_eq!(done.status, TaskStatus::Completed);
        // The second delivery keeps the job id.
        assert_eq!(done.job_id, Some(job_id));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.client.call_count(), 4);
        assert_eq!(h.store.message_count(task.id).await.unwrap(), 4);
        assert_eq!(h.queue.pending(), 0);
        h.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_claims_leave_task_for_recovery() {
        let h = harness(ScriptedClient::demo(), Duration::from_secs(30));
        let attempts = h.queue.config().max_attempts;
        h.store.fail_next_claims(attempts);
        h.queue.start();

        let task = h.store.create_task(Task::queued("Explain X", None)).await.unwrap();
        h.queue.enqueue(task.id).unwrap();
        // Backoff is 10ms, 20ms; leave plenty of room for the last attempt.
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Never claimed, so never run and never moved past queued.
        assert_eq!(h.client.call_count(), 0);
        assert_eq!(h.queue.pending(), 0);
        let stuck = h.store.get_task(task.id).await.unwrap();
        assert_eq!(stuck.status, TaskStatus::Queued);

        let report = h.queue.recover().await.unwrap();
        assert_eq!(report.requeued, 1);
        let done = wait_terminal(&h.store, task.id).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(h.client.call_count(), 4);
        h.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_gateway_failures_within_retry_budget() {
        let client = ScriptedClient::from_fn(|call| match call.index {
            0 => ScriptedReply::Fail(LlmErrorKind::Network),
            1 => ScriptedReply::Fail(LlmErrorKind::RateLimited),
            _ if call.agent.as_deref() == Some("Critic") => {
                ScriptedReply::text("APPROVED\n\nTERMINATE")
            }
            _ => ScriptedReply::text("Notes on the topic."),
        })
        .with_retry(fast_retry());
        let h = harness(client, Duration::from_secs(30));
        h.queue.start();

        let task = h.store.create_task(Task::queued("Explain X", None)).await.unwrap();
        h.queue.enqueue(task.id).unwrap();
        let done = wait_terminal(&h.store, task.id).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.error.is_none());

        // Two failed attempts, then one call per turn.
        assert_eq!(h.client.call_count(), 6);
        let detail = h.store.get_detail(task.id).await.unwrap();
        let agents: Vec<&str> = detail.messages.iter().map(|m| m.agent.as_str()).collect();
        assert_eq!(agents, vec!["Researcher", "Analyst", "Writer", "Critic"]);
        h.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_gateway_failing_every_attempt_fails_task() {
        let client = ScriptedClient::failing(LlmErrorKind::Network).with_retry(fast_retry());
        let h = harness(client, Duration::from_secs(30));
        h.queue.start();

        let task = h.store.create_task(Task::queued("Explain X", None)).await.unwrap();
        h.queue.enqueue(task.id).unwrap();
        let done = wait_terminal(&h.store, task.id).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(!done.error.unwrap_or_default().is_empty());

        // The retry budget is spent once; the failed run is not re-delivered.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.client.call_count(), 3);
        assert_eq!(h.store.message_count(task.id).await.unwrap(), 0);
        h.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_deadline_fails_task_and_keeps_partial_messages() {
        let h = harness(
            ScriptedClient::demo().with_latency(Duration::from_millis(80)),
            Duration::from_millis(200),
        );
        h.queue.start();
        let task = h.store.create_task(Task::queued("Explain X", None)).await.unwrap();
        h.queue.enqueue(task.id).unwrap();

        let done = wait_terminal(&h.store, task.id).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.error.unwrap().contains("time limit"));
        let detail = h.store.get_detail(task.id).await.unwrap();
        assert!(!detail.messages.is_empty());
        assert!(detail.messages.len() < 4);
        h.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_recover_requeues_and_interrupts() {
        let h = harness(ScriptedClient::demo(), Duration::from_secs(30));
        let waiting = h.store.create_task(Task::queued("Explain X", None)).await.unwrap();
        let orphan = h.store.create_task(Task::queued("Explain Y", None)).await.unwrap();
        h.store.claim(orphan.id, JobId::new()).await.unwrap();

        let report = h.queue.recover().await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(report.interrupted, 1);
        assert_eq!(h.queue.pending(), 1);

        let orphan = h.store.get_task(orphan.id).await.unwrap();
        assert_eq!(orphan.status, TaskStatus::Failed);
        assert_eq!(orphan.error.as_deref(), Some(INTERRUPTED_ERROR));

        h.queue.start();
        let done = wait_terminal(&h.store, waiting.id).await;
        assert_eq!(done.status, TaskStatus::Completed);
        h.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_is_refused() {
        let h = harness(ScriptedClient::demo(), Duration::from_secs(30));
        h.queue.start();
        h.queue.shutdown().await;

        let task = h.store.create_task(Task::queued("Explain X", None)).await.unwrap();
        assert!(h.queue.enqueue(task.id).is_err());
        assert_eq!(h.queue.pending(), 0);
        assert_eq!(h.store.get_task(task.id).await.unwrap().status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_observer_persists_progress() {
        let store = TaskStore::open_in_memory().unwrap();
        let notifier = Notifier::new();
        let task = store.create_task(Task::queued("Explain X", None)).await.unwrap();
        store.claim(task.id, JobId::new()).await.unwrap();

        let observer = StoreObserver::new(task.id, store.clone(), notifier, 12);
        observer.turn_started(0, Role::Researcher).await.unwrap();
        let progress = store.get_task(task.id).await.unwrap().progress.unwrap();
        assert_eq!(progress.role, "Researcher");
        assert_eq!(progress.max_turns, 12);
    }
}

//! Job queue, retry policy and the worker loop.
//!
//! The production queue transport is external; [`JobQueue`] is the seam and
//! [`MemoryJobQueue`] the in-process implementation. Delivery is
//! at-least-once: a job that fails is either re-enqueued after a backoff
//! delay or moved to the dead-letter list, as decided by
//! [`RetryPolicy::decide`]. Duplicate deliveries of a completed workflow are
//! absorbed by the orchestrator.

use crate::error::{ErrorClass, PipelineError};
use crate::workflow::orchestrator::{ProcessOutcome, WorkflowOrchestrator};
use crate::workflow::records::JobPayload;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

// ── Retry policy ─────────────────────────────────────────────────────────

/// Exponential backoff with a cap and a maximum number of deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Deliveries before a retryable failure is dead-lettered. Default: 3.
    pub max_attempts: u32,
    /// Delay before the second delivery. Default: 1000 ms.
    pub base_delay_ms: u64,
    /// Upper bound on any delay. Default: 60 000 ms.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

/// What to do with a job whose delivery failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobDisposition {
    Retry { delay: Duration },
    DeadLetter { reason: String },
}

impl RetryPolicy {
    /// `min(base · 2^(attempt−1), max)`; `attempt` is 1-based.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let ms = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// Decide the fate of delivery number `attempt` that failed with `error`.
    pub fn decide(&self, attempt: u32, error: &PipelineError) -> JobDisposition {
        if !error.is_retryable() {
            return JobDisposition::DeadLetter {
                reason: format!("not retryable ({:?}): {}", error.class(), error),
            };
        }
        if attempt >= self.max_attempts {
            return JobDisposition::DeadLetter {
                reason: format!("gave up after {} attempts: {}", attempt, error),
            };
        }
        JobDisposition::Retry {
            delay: self.delay_for(attempt),
        }
    }
}

// ── Queue ────────────────────────────────────────────────────────────────

/// A job as delivered by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: Uuid,
    pub payload: JobPayload,
    /// Higher runs first.
    pub priority: i32,
    /// 1-based delivery count.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// A job that will not be retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub job: QueuedJob,
    pub reason: String,
    pub class: ErrorClass,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a new job.
    async fn push(&self, payload: JobPayload, priority: i32) -> Uuid;

    /// Next ready job, if any. Never waits.
    async fn pop(&self) -> Option<QueuedJob>;

    /// Deliver `job` again after `delay`.
    async fn retry(&self, job: QueuedJob, delay: Duration);

    async fn dead_letter(&self, job: QueuedJob, reason: String, class: ErrorClass);
}

struct ReadyEntry {
    job: QueuedJob,
    seq: u64,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    /// Max-heap order: higher priority first, then lower sequence (FIFO).
    fn cmp(&self, other: &Self) -> Ordering {
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    ready: BinaryHeap<ReadyEntry>,
    delayed: Vec<(Instant, QueuedJob)>,
    dead: Vec<DeadLetter>,
    seq: u64,
}

impl QueueState {
    fn enqueue(&mut self, job: QueuedJob) {
        let seq = self.seq;
        self.seq += 1;
        self.ready.push(ReadyEntry { job, seq });
    }

    fn promote_due(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, job) = self.delayed.remove(i);
                self.enqueue(job);
            } else {
                i += 1;
            }
        }
    }
}

/// In-process priority queue with delayed retries and a dead-letter list.
#[derive(Default)]
pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead.clone()
    }

    /// Ready plus delayed jobs.
    pub async fn pending(&self) -> usize {
        let state = self.state.lock().await;
        state.ready.len() + state.delayed.len()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn push(&self, payload: JobPayload, priority: i32) -> Uuid {
        let job = QueuedJob {
            id: Uuid::new_v4(),
            payload,
            priority,
            attempt: 1,
            enqueued_at: Utc::now(),
        };
        let id = job.id;
        self.state.lock().await.enqueue(job);
        id
    }

    async fn pop(&self) -> Option<QueuedJob> {
        let mut state = self.state.lock().await;
        state.promote_due(Instant::now());
        state.ready.pop().map(|e| e.job)
    }

    async fn retry(&self, mut job: QueuedJob, delay: Duration) {
        job.attempt += 1;
        let mut state = self.state.lock().await;
        if delay.is_zero() {
            state.enqueue(job);
        } else {
            state.delayed.push((Instant::now() + delay, job));
        }
    }

    async fn dead_letter(&self, job: QueuedJob, reason: String, class: ErrorClass) {
        self.state.lock().await.dead.push(DeadLetter {
            job,
            reason,
            class,
            failed_at: Utc::now(),
        });
    }
}

// ── Worker ───────────────────────────────────────────────────────────────

/// Worker tuning.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Documents processed concurrently. Default: 2.
    pub concurrency: usize,
    /// Sleep between polls of an empty queue. Default: 100 ms.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Pulls jobs and runs them through the orchestrator.
pub struct Worker {
    orchestrator: Arc<WorkflowOrchestrator>,
    queue: Arc<dyn JobQueue>,
    policy: RetryPolicy,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        orchestrator: Arc<WorkflowOrchestrator>,
        queue: Arc<dyn JobQueue>,
        policy: RetryPolicy,
        config: WorkerConfig,
    ) -> Self {
        Self {
            orchestrator,
            queue,
            policy,
            config,
        }
    }

    /// Run until `shutdown` turns `true` (or its sender is dropped), then
    /// wait for in-flight jobs.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let concurrency = self.config.concurrency.max(1);
        info!("Worker started: {} concurrent documents", concurrency);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            while let Some(done) = tasks.try_join_next() {
                if let Err(e) = done {
                    error!("Job task panicked: {}", e);
                }
            }

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match self.queue.pop().await {
                Some(job) => {
                    let orchestrator = Arc::clone(&self.orchestrator);
                    let queue = Arc::clone(&self.queue);
                    let policy = self.policy;
                    tasks.spawn(async move {
                        handle_job(&orchestrator, queue.as_ref(), &policy, job).await;
                        drop(permit);
                    });
                }
                None => {
                    drop(permit);
                    tokio::select! {
                        _ = sleep(self.config.poll_interval) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("Worker stopping; waiting for {} in-flight jobs", tasks.len());
        while let Some(done) = tasks.join_next().await {
            if let Err(e) = done {
                error!("Job task panicked: {}", e);
            }
        }
    }
}

/// Process one delivery and apply the retry policy to a failure.
pub async fn handle_job(
    orchestrator: &WorkflowOrchestrator,
    queue: &dyn JobQueue,
    policy: &RetryPolicy,
    job: QueuedJob,
) {
    match orchestrator.process_ai_parsing(&job.payload).await {
        Ok(ProcessOutcome::Completed(_)) => {
            info!("Job {} completed (attempt {})", job.id, job.attempt);
        }
        Ok(ProcessOutcome::AlreadyCompleted) => {
            info!("Job {} was a duplicate delivery", job.id);
        }
        Err(e) => match policy.decide(job.attempt, &e) {
            JobDisposition::Retry { delay } => {
                warn!(
                    "Job {} failed (attempt {}), retrying in {}ms: {}",
                    job.id,
                    job.attempt,
                    delay.as_millis(),
                    e
                );
                queue.retry(job, delay).await;
            }
            JobDisposition::DeadLetter { reason } => {
                error!("Job {} dead-lettered: {}", job.id, reason);
                queue.dead_letter(job, reason, e.class()).await;
            }
        },
    }
}

//! Tick executor: one bounded dispatch / await / apply pass over a job

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use super::alignment::{AlignmentKey, AlignmentQueue};
use super::controller::{ChunkOutcome, ChunkResult, ClaimOutcome, JobController};
use crate::config::JobsConfig;
use crate::error::Result;
use crate::providers::{ChunkTask, ChunkWorker, WorkerError};
use crate::types::{JobKey, JobStatus};

/// Options for one tick
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TickOptions {
    /// Wall-clock budget; the configured default when absent
    #[serde(default, with = "optional_millis")]
    pub max_processing_time: Option<Duration>,
}

/// What one tick did
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickResult {
    pub job_key: JobKey,
    /// Chunks dispatched by this tick
    pub started: usize,
    pub completed: usize,
    /// Chunks that failed permanently
    pub failed: usize,
    /// Chunks that failed and went back to the queue
    pub requeued: usize,
    /// Results dropped because the dispatch was superseded
    pub discarded: usize,
    /// Queued chunks found already done and completed in place
    pub auto_completed: usize,
    /// Results that could not be written
    pub errors: usize,
    /// Dispatches still running when the budget ran out
    pub still_running: usize,
    pub remaining_queue: usize,
    /// Chunks active after the tick, including other ticks' dispatches
    pub in_flight: usize,
    pub budget_exhausted: bool,
    pub job_status: JobStatus,
    pub elapsed_ms: u64,
}

impl TickResult {
    fn new(job_key: JobKey, job_status: JobStatus) -> Self {
        Self {
            job_key,
            started: 0,
            completed: 0,
            failed: 0,
            requeued: 0,
            discarded: 0,
            auto_completed: 0,
            errors: 0,
            still_running: 0,
            remaining_queue: 0,
            in_flight: 0,
            budget_exhausted: false,
            job_status,
            elapsed_ms: 0,
        }
    }

    fn tally(&mut self, outcome: &ChunkOutcome) {
        match outcome {
            ChunkOutcome::Completed => self.completed += 1,
            ChunkOutcome::Failed => self.failed += 1,
            ChunkOutcome::Requeued { .. } | ChunkOutcome::Partial { .. } => self.requeued += 1,
            ChunkOutcome::Ignored => self.discarded += 1,
        }
    }
}

/// Runs ticks against the job store with a chunk worker
pub struct TickExecutor {
    dispatcher: Dispatcher,
    default_budget: Duration,
}

impl TickExecutor {
    pub fn new(
        controller: Arc<JobController>,
        worker: Arc<dyn ChunkWorker>,
        config: &JobsConfig,
    ) -> Self {
        Self {
            dispatcher: Dispatcher {
                controller,
                worker,
                worker_timeout: config.worker.timeout(),
                alignment: None,
            },
            default_budget: config.scheduler.tick_budget(),
        }
    }

    /// Enqueue alignment work for every chunk this executor completes
    pub fn with_alignment(mut self, queue: Arc<AlignmentQueue>) -> Self {
        self.dispatcher.alignment = Some(queue);
        self
    }

    pub fn controller(&self) -> &Arc<JobController> {
        &self.dispatcher.controller
    }

    /// Run one tick.
    ///
    /// Claims chunks until the job's concurrency cap, the per-tick cap or the
    /// budget is reached, runs them concurrently, and waits for them until the
    /// budget runs out. Dispatches still running at that point are left alone;
    /// their results are applied when they finish.
    pub async fn run_tick(&self, key: &JobKey, options: TickOptions) -> Result<TickResult> {
        let tick_id = Uuid::new_v4();
        let start = Instant::now();
        let budget = options.max_processing_time.unwrap_or(self.default_budget);
        let deadline = tokio::time::Instant::now() + budget;

        let controller = self.controller();
        let job = controller.get_job(key).await?;
        let mut result = TickResult::new(key.clone(), job.status);
        if job.status.is_terminal() {
            tracing::debug!("Tick {} on job {}: already {:?}", tick_id, key, job.status);
            return Ok(result);
        }
        let max_per_tick = job.options.max_chunks_per_tick;

        // Claim first, then start. Completions cannot free a slot mid-loop.
        let mut claimed = ClaimBatch::new(key.clone(), self.dispatcher.clone());
        while claimed.len() < max_per_tick {
            if tokio::time::Instant::now() >= deadline {
                result.budget_exhausted = true;
                break;
            }
            let claim = controller.claim_next(key).await?;
            result.auto_completed += claim.auto_completed.len();
            match claim.outcome {
                ClaimOutcome::Dispatch(task) => claimed.push(task),
                ClaimOutcome::Idle(reason) => {
                    tracing::debug!("Tick {} on job {} stops claiming: {:?}", tick_id, key, reason);
                    break;
                }
            }
        }
        result.started = claimed.len();

        let mut running = claimed.start();

        loop {
            match tokio::time::timeout_at(deadline, running.next()).await {
                Ok(Some(Ok(Ok(outcome)))) => result.tally(&outcome),
                Ok(Some(Ok(Err(e)))) => {
                    result.errors += 1;
                    tracing::error!("Tick {} on job {}: failed to apply result: {}", tick_id, key, e);
                }
                Ok(Some(Err(e))) => {
                    result.errors += 1;
                    tracing::error!("Tick {} on job {}: dispatch task panicked: {}", tick_id, key, e);
                }
                Ok(None) => break,
                Err(_) => {
                    result.budget_exhausted = true;
                    result.still_running = running.len();
                    break;
                }
            }
        }
        // Dropping the handles detaches whatever is still running.
        drop(running);

        let job = controller.get_job(key).await?;
        result.remaining_queue = job.queue.len();
        result.in_flight = job.active.len();
        result.job_status = job.status;
        result.elapsed_ms = start.elapsed().as_millis() as u64;

        tracing::info!(
            "Tick {} on job {}: started {}, completed {}, requeued {}, failed {}, \
             still running {}, {} queued, status {:?} ({}ms)",
            tick_id,
            key,
            result.started,
            result.completed,
            result.requeued,
            result.failed,
            result.still_running,
            result.remaining_queue,
            result.job_status,
            result.elapsed_ms
        );
        Ok(result)
    }
}

/// What a dispatch task needs, detached from the executor
#[derive(Clone)]
struct Dispatcher {
    controller: Arc<JobController>,
    worker: Arc<dyn ChunkWorker>,
    worker_timeout: Duration,
    alignment: Option<Arc<AlignmentQueue>>,
}

impl Dispatcher {
    /// Build the task future for one claimed chunk
    fn dispatch(
        &self,
        task: ChunkTask,
    ) -> impl std::future::Future<Output = Result<ChunkOutcome>> + Send + 'static {
        let controller = Arc::clone(&self.controller);
        let worker = Arc::clone(&self.worker);
        let alignment = self.alignment.clone();
        let worker_timeout = self.worker_timeout;

        async move {
            let key = task.job_key.clone();
            let ticket = task.ticket();

            let result = match timeout(worker_timeout, worker.process(task)).await {
                Ok(Ok(output)) => ChunkResult::Success(output),
                Ok(Err(e)) => ChunkResult::Failure(e),
                Err(_) => ChunkResult::Failure(WorkerError::new(format!(
                    "{} worker timed out after {}s",
                    worker.name(),
                    worker_timeout.as_secs()
                ))),
            };

            let outcome = controller.apply_dispatch_result(&key, ticket, result).await?;
            if outcome == ChunkOutcome::Completed {
                if let Some(queue) = alignment {
                    queue.enqueue(AlignmentKey::new(key, ticket.chunk_index));
                }
            }
            Ok(outcome)
        }
    }
}

/// Chunks a tick has claimed but not yet handed to the worker.
///
/// A claim marks the chunk processing and takes a concurrency slot, so a
/// batch dropped before [`start`](Self::start) (failed claim, cancelled tick)
/// still dispatches what it holds.
struct ClaimBatch {
    job_key: JobKey,
    dispatcher: Dispatcher,
    tasks: Vec<ChunkTask>,
}

impl ClaimBatch {
    fn new(job_key: JobKey, dispatcher: Dispatcher) -> Self {
        Self {
            job_key,
            dispatcher,
            tasks: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }

    fn push(&mut self, task: ChunkTask) {
        self.tasks.push(task);
    }

    /// Spawn every claimed chunk
    fn start(mut self) -> FuturesUnordered<JoinHandle<Result<ChunkOutcome>>> {
        std::mem::take(&mut self.tasks)
            .into_iter()
            .map(|task| tokio::spawn(self.dispatcher.dispatch(task)))
            .collect()
    }
}

impl Drop for ClaimBatch {
    fn drop(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            tracing::error!(
                "Job {}: {} claimed chunks left without a runtime; the reconciler will reclaim them",
                self.job_key,
                self.tasks.len()
            );
            return;
        };
        tracing::warn!(
            "Job {}: tick stopped early, dispatching {} already claimed chunks",
            self.job_key,
            self.tasks.len()
        );
        for task in self.tasks.drain(..) {
            runtime.spawn(self.dispatcher.dispatch(task));
        }
    }
}

/// `Option<Duration>` as optional milliseconds
mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

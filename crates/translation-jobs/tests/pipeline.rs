//! End-to-end pipeline tests with scripted in-process workers.
//!
//! These drive the controller, tick executor, reconciler and alignment queue
//! together against real stores.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_test::assert_ok;

use translation_jobs::config::StorageBackend;
use translation_jobs::processing::{
    ChunkOutcome, ChunkResult, ClaimOutcome, CreateJobOptions, RequeueOptions, TickOptions,
    TickResult,
};
use translation_jobs::types::SourceLine;
use translation_jobs::{
    AlignmentKey, AlignmentQueue, AlignmentWorker, CasResult, ChunkOutput, ChunkStatus, ChunkTask,
    ChunkWorker, Error, Job, JobController, JobKey, JobOptions, JobStatus, JobStore, JobsConfig,
    LineResult, MemoryJobStore, ProgressSummary, Reconciler, SqliteJobStore, TextChunk,
    TickExecutor, Versioned, WorkerError,
};

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// Translates every line, optionally after a delay, and records concurrency
#[derive(Default)]
struct TranslateWorker {
    delay: Duration,
    calls: AtomicU32,
    running: Mutex<HashSet<u32>>,
    max_running: AtomicUsize,
    double_dispatches: AtomicU32,
}

impl TranslateWorker {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ChunkWorker for TranslateWorker {
    async fn process(&self, task: ChunkTask) -> Result<ChunkOutput, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut running = self.running.lock();
            if !running.insert(task.chunk_index) {
                self.double_dispatches.fetch_add(1, Ordering::SeqCst);
            }
            self.max_running.fetch_max(running.len(), Ordering::SeqCst);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.lock().remove(&task.chunk_index);

        Ok(ChunkOutput {
            lines: task
                .lines
                .iter()
                .map(|l| LineResult::translated(l.line_index, format!("[fr] {}", l.text)))
                .collect(),
            fallback_mode: false,
        })
    }

    fn name(&self) -> &str {
        "translate"
    }
}

/// Always fails
#[derive(Default)]
struct FailingWorker {
    calls: AtomicU32,
}

#[async_trait]
impl ChunkWorker for FailingWorker {
    async fn process(&self, _task: ChunkTask) -> Result<ChunkOutput, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(WorkerError::with_details("model unavailable", "HTTP 503"))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Blocks every call until a permit is released
struct GatedWorker {
    gate: Semaphore,
}

#[async_trait]
impl ChunkWorker for GatedWorker {
    async fn process(&self, task: ChunkTask) -> Result<ChunkOutput, WorkerError> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| WorkerError::new(e.to_string()))?;
        permit.forget();
        TranslateWorker::default().process(task).await
    }

    fn name(&self) -> &str {
        "gated"
    }
}

/// Alignment worker that never finishes
struct StalledAligner {
    calls: AtomicU32,
}

#[async_trait]
impl AlignmentWorker for StalledAligner {
    async fn align(&self, _key: &AlignmentKey) -> Result<(), WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
        Ok(())
    }

    fn name(&self) -> &str {
        "stalled"
    }
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// Memory store with slow writes and an optional failing write
struct FlakyStore {
    inner: MemoryJobStore,
    writes: AtomicU32,
    /// 1-based write that returns an error
    fail_on: Option<u32>,
    write_delay: Duration,
}

impl FlakyStore {
    fn failing_on(write: u32) -> Self {
        Self {
            inner: MemoryJobStore::new(),
            writes: AtomicU32::new(0),
            fail_on: Some(write),
            write_delay: Duration::ZERO,
        }
    }

    fn slow(write_delay: Duration) -> Self {
        Self {
            inner: MemoryJobStore::new(),
            writes: AtomicU32::new(0),
            fail_on: None,
            write_delay,
        }
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn load(&self, key: &JobKey) -> translation_jobs::Result<Option<Versioned<Job>>> {
        self.inner.load(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &JobKey,
        expected: Option<u64>,
        job: &Job,
    ) -> translation_jobs::Result<CasResult> {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        let write = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on == Some(write) {
            return Err(Error::storage("disk full"));
        }
        self.inner.compare_and_swap(key, expected, job).await
    }

    async fn list_keys(&self) -> translation_jobs::Result<Vec<JobKey>> {
        self.inner.list_keys().await
    }

    async fn delete(&self, key: &JobKey) -> translation_jobs::Result<bool> {
        self.inner.delete(key).await
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_config() -> JobsConfig {
    let mut config = JobsConfig::default();
    config.storage.backend = StorageBackend::Memory;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

fn single_line_chunks(n: u32) -> Vec<TextChunk> {
    (0..n)
        .map(|i| TextChunk {
            index: i,
            lines: vec![SourceLine {
                line_index: i as usize,
                text: format!("Sentence {}.", i),
            }],
        })
        .collect()
}

fn options(max_concurrent: usize, max_retries: u32) -> CreateJobOptions {
    CreateJobOptions {
        replace: false,
        job: Some(JobOptions {
            max_concurrent,
            max_chunks_per_tick: 6,
            max_retries,
            fail_on_chunk_failure: false,
        }),
    }
}

fn pipeline(
    store: Arc<dyn JobStore>,
    worker: Arc<dyn ChunkWorker>,
    config: &JobsConfig,
) -> (Arc<JobController>, TickExecutor, Reconciler) {
    let controller = Arc::new(JobController::new(store, config));
    let executor = TickExecutor::new(Arc::clone(&controller), worker, config);
    let reconciler = Reconciler::new(Arc::clone(&controller), &config.reconcile);
    (controller, executor, reconciler)
}

async fn drive_to_terminal(executor: &TickExecutor, key: &JobKey) -> TickResult {
    for _ in 0..100 {
        let result = assert_ok!(executor.run_tick(key, TickOptions::default()).await);
        if result.job_status.is_terminal() {
            return result;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached a terminal status", key);
}

fn assert_invariants(summary: &ProgressSummary, job: &translation_jobs::Job) {
    let c = summary.counts;
    assert_eq!(
        c.completed + c.processing + c.queued + c.pending + c.failed,
        c.total
    );
    assert!(job.active.len() <= job.options.max_concurrent);
    for chunk in job.chunks.values() {
        let queued = job.queue.contains(&chunk.index);
        let active = job.active.contains(&chunk.index);
        assert!(!(queued && active), "chunk {} both queued and active", chunk.index);
        assert_eq!(
            chunk.status.is_terminal(),
            !queued && !active,
            "chunk {} status {:?} vs structures",
            chunk.index,
            chunk.status
        );
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// 13 non-blank lines, target 4: 3-4 chunks reconstructing the document.
#[tokio::test]
async fn thirteen_lines_chunk_in_order() {
    let text = (1..=13)
        .map(|i| format!("Line number {}.", i))
        .collect::<Vec<_>>()
        .join("\n\n");
    let config = test_config();
    let (controller, _, _) = pipeline(
        Arc::new(MemoryJobStore::new()),
        Arc::new(TranslateWorker::default()),
        &config,
    );
    let key = JobKey::from("chunked");

    let job = assert_ok!(
        controller
            .create_job(&key, &text, CreateJobOptions::default())
            .await
    );

    assert!((3..=4).contains(&job.chunks.len()), "{} chunks", job.chunks.len());
    let lines: Vec<String> = job
        .chunks
        .values()
        .flat_map(|c| c.source.iter().map(|l| l.text.clone()))
        .collect();
    let expected: Vec<String> = (1..=13).map(|i| format!("Line number {}.", i)).collect();
    assert_eq!(lines, expected);

    // blank lines keep their slots in the original numbering
    let indices: Vec<usize> = job
        .chunks
        .values()
        .flat_map(|c| c.source.iter().map(|l| l.line_index))
        .collect();
    assert_eq!(indices, (0..13).map(|i| i * 2).collect::<Vec<_>>());
}

/// All lines translated but status left at processing: reconcile completes it.
#[tokio::test]
async fn stuck_chunk_is_repaired() {
    let config = test_config();
    let (controller, _, reconciler) = pipeline(
        Arc::new(MemoryJobStore::new()),
        Arc::new(TranslateWorker::default()),
        &config,
    );
    let key = JobKey::from("stuck");
    assert_ok!(
        controller
            .create_job(&key, "Un.\nDeux.\nTrois.", CreateJobOptions::default())
            .await
    );
    assert_ok!(controller.claim_next(&key).await);

    // Lines land without the status transition
    assert_ok!(
        controller
            .update(&key, |job, _| {
                let chunk = job.chunk_mut(0).expect("chunk 0");
                chunk.lines = chunk
                    .source
                    .iter()
                    .map(|l| LineResult::translated(l.line_index, "done"))
                    .collect();
                chunk.lines_processed = 3;
                Ok(())
            })
            .await
    );
    let stuck = controller.get_job(&key).await.unwrap();
    assert_eq!(stuck.chunk(0).unwrap().status, ChunkStatus::Processing);
    assert_eq!(stuck.chunk(0).unwrap().total_lines, 3);

    let report = assert_ok!(reconciler.reconcile(&key).await);
    assert_eq!(report.stuck_completed, vec![0]);

    let job = controller.get_job(&key).await.unwrap();
    let chunk = job.chunk(0).unwrap();
    assert_eq!(chunk.status, ChunkStatus::Completed);
    assert!(chunk.completed_at.is_some());
    assert!(job.active.is_empty());
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(report.status_after, JobStatus::Completed);
}

/// max_retries = 3: three failures requeue, the fourth marks the chunk failed.
#[tokio::test]
async fn fourth_failure_is_terminal() {
    let config = test_config();
    let (controller, _, _) = pipeline(
        Arc::new(MemoryJobStore::new()),
        Arc::new(TranslateWorker::default()),
        &config,
    );
    let key = JobKey::from("retries");
    assert_ok!(
        controller
            .create_job_from_chunks(&key, "Sentence 0.", single_line_chunks(1), options(1, 3))
            .await
    );

    for attempt in 1..=4 {
        let outcome = assert_ok!(
            controller
                .apply_chunk_result(
                    &key,
                    0,
                    translation_jobs::processing::ChunkResult::Failure(WorkerError::new("boom")),
                )
                .await
        );
        let job = controller.get_job(&key).await.unwrap();
        let chunk = job.chunk(0).unwrap();
        if attempt < 4 {
            assert!(matches!(
                outcome,
                translation_jobs::processing::ChunkOutcome::Requeued { .. }
            ));
            assert_eq!(chunk.status, ChunkStatus::Queued);
            assert_eq!(job.queue.front(), Some(&0));
        } else {
            assert_eq!(outcome, translation_jobs::processing::ChunkOutcome::Failed);
            assert_eq!(chunk.status, ChunkStatus::Failed);
            assert!(job.queue.is_empty());
            assert!(job.active.is_empty());
        }
    }
}

/// max_concurrent = 2 with 5 queued chunks: the first tick dispatches 2.
#[tokio::test]
async fn first_tick_respects_concurrency() {
    let config = test_config();
    let worker = Arc::new(TranslateWorker::default());
    let (controller, executor, _) =
        pipeline(Arc::new(MemoryJobStore::new()), worker.clone(), &config);
    let key = JobKey::from("capacity");
    assert_ok!(
        controller
            .create_job_from_chunks(&key, "five", single_line_chunks(5), options(2, 3))
            .await
    );

    let result = assert_ok!(executor.run_tick(&key, TickOptions::default()).await);
    assert_eq!(result.started, 2);
    assert_eq!(result.remaining_queue, 3);
    assert_eq!(worker.calls.load(Ordering::SeqCst), 2);

    let job = controller.get_job(&key).await.unwrap();
    assert_eq!(job.queue.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_bound_through_ticks() {
    let config = test_config();
    let worker = Arc::new(FailingWorker::default());
    let (controller, executor, _) =
        pipeline(Arc::new(MemoryJobStore::new()), worker.clone(), &config);
    let key = JobKey::from("retry-bound");
    assert_ok!(
        controller
            .create_job_from_chunks(&key, "one", single_line_chunks(1), options(1, 3))
            .await
    );

    let result = drive_to_terminal(&executor, &key).await;
    assert_eq!(result.job_status, JobStatus::Completed);
    assert_eq!(worker.calls.load(Ordering::SeqCst), 4);

    let job = controller.get_job(&key).await.unwrap();
    let chunk = job.chunk(0).unwrap();
    assert_eq!(chunk.status, ChunkStatus::Failed);
    assert_eq!(chunk.retries, 3);
    assert_eq!(chunk.error.as_deref(), Some("model unavailable"));
    assert_eq!(chunk.error_details.as_deref(), Some("HTTP 503"));
    assert_eq!(chunk.error_history.len(), 4);

    let summary = controller.get_summary(&key).await.unwrap();
    assert_eq!(summary.counts.failed, 1);
}

#[tokio::test]
async fn failed_chunk_policy_marks_job_failed() {
    let config = test_config();
    let (controller, executor, _) = pipeline(
        Arc::new(MemoryJobStore::new()),
        Arc::new(FailingWorker::default()),
        &config,
    );
    let key = JobKey::from("strict");
    let mut strict = options(1, 0);
    if let Some(job) = strict.job.as_mut() {
        job.fail_on_chunk_failure = true;
    }
    assert_ok!(
        controller
            .create_job_from_chunks(&key, "one", single_line_chunks(1), strict)
            .await
    );

    let result = drive_to_terminal(&executor, &key).await;
    assert_eq!(result.job_status, JobStatus::Failed);
}

#[tokio::test]
async fn convergence_after_one_reconcile() {
    let config = test_config();
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let (controller, _, reconciler) = pipeline(
        Arc::clone(&store),
        Arc::new(TranslateWorker::default()),
        &config,
    );
    let key = JobKey::from("converge");
    assert_ok!(
        controller
            .create_job_from_chunks(&key, "three", single_line_chunks(3), options(2, 3))
            .await
    );

    // Every chunk terminal, nothing queued or active, status left behind
    let stored = store.load(&key).await.unwrap().unwrap();
    let mut job = stored.value.clone();
    job.queue.clear();
    job.active.clear();
    for chunk in job.chunks.values_mut() {
        chunk.status = ChunkStatus::Completed;
    }
    job.chunk_mut(2).unwrap().status = ChunkStatus::Failed;
    job.status = JobStatus::Processing;
    assert!(store
        .compare_and_swap(&key, Some(stored.version), &job)
        .await
        .unwrap()
        .is_success());

    let report = assert_ok!(reconciler.reconcile(&key).await);
    assert_eq!(report.status_before, JobStatus::Processing);
    assert_eq!(report.status_after, JobStatus::Completed);
    assert_eq!(
        controller.get_job(&key).await.unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn concurrent_ticks_never_double_dispatch() {
    let config = test_config();
    let worker = Arc::new(TranslateWorker::with_delay(Duration::from_millis(30)));
    let (controller, executor, _) =
        pipeline(Arc::new(MemoryJobStore::new()), worker.clone(), &config);
    let key = JobKey::from("double");
    assert_ok!(
        controller
            .create_job_from_chunks(&key, "eight", single_line_chunks(8), options(2, 3))
            .await
    );

    for _ in 0..20 {
        let (a, b) = tokio::join!(
            executor.run_tick(&key, TickOptions::default()),
            executor.run_tick(&key, TickOptions::default())
        );
        assert_ok!(a);
        assert_ok!(b);

        let job = controller.get_job(&key).await.unwrap();
        assert_invariants(&ProgressSummary::from_job(&job), &job);
        if job.status.is_terminal() {
            break;
        }
    }

    let job = controller.get_job(&key).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(worker.double_dispatches.load(Ordering::SeqCst), 0);
    assert!(worker.max_running.load(Ordering::SeqCst) <= 2);
    assert_eq!(worker.calls.load(Ordering::SeqCst), 8);
    assert!(job.chunks.values().all(|c| c.attempt == 1));
}

#[tokio::test]
async fn counts_stay_consistent_mid_tick() {
    let config = test_config();
    let worker = Arc::new(GatedWorker {
        gate: Semaphore::new(0),
    });
    let (controller, executor, _) =
        pipeline(Arc::new(MemoryJobStore::new()), worker.clone(), &config);
    let executor = Arc::new(executor);
    let key = JobKey::from("mid-tick");
    assert_ok!(
        controller
            .create_job_from_chunks(&key, "six", single_line_chunks(6), options(3, 3))
            .await
    );

    let tick = {
        let executor = Arc::clone(&executor);
        let key = key.clone();
        tokio::spawn(async move { executor.run_tick(&key, TickOptions::default()).await })
    };

    for round in 0..6 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let job = controller.get_job(&key).await.unwrap();
        assert_invariants(&ProgressSummary::from_job(&job), &job);
        if round % 2 == 1 {
            worker.gate.add_permits(1);
        }
    }
    worker.gate.add_permits(10);

    let result = assert_ok!(tick.await.unwrap());
    assert_eq!(result.started, 3);

    let result = drive_to_terminal(&executor, &key).await;
    assert_eq!(result.job_status, JobStatus::Completed);
    let summary = controller.get_summary(&key).await.unwrap();
    assert_eq!(summary.counts.completed, 6);
    assert_eq!(summary.lines_processed, 6);
}

#[tokio::test]
async fn requeue_races_resolve_through_cas() {
    let config = test_config();
    let (controller, executor, _) = pipeline(
        Arc::new(MemoryJobStore::new()),
        Arc::new(TranslateWorker::default()),
        &config,
    );
    let key = JobKey::from("races");
    assert_ok!(
        controller
            .create_job_from_chunks(&key, "ten", single_line_chunks(10), options(10, 3))
            .await
    );
    drive_to_terminal(&executor, &key).await;

    let handles: Vec<_> = (0..10)
        .map(|index| {
            let controller = Arc::clone(&controller);
            let key = key.clone();
            tokio::spawn(async move {
                controller
                    .requeue_chunk(&key, index, RequeueOptions { clear_lines: true })
                    .await
            })
        })
        .collect();
    for handle in handles {
        assert_ok!(handle.await.unwrap());
    }

    let job = controller.get_job(&key).await.unwrap();
    assert_eq!(job.queue.len(), 10);
    assert!(job.chunks.values().all(|c| c.status == ChunkStatus::Queued));
    assert_eq!(job.status, JobStatus::Processing);

    let result = drive_to_terminal(&executor, &key).await;
    assert_eq!(result.job_status, JobStatus::Completed);
}

#[tokio::test]
async fn stale_dispatch_result_is_discarded() {
    let mut config = test_config();
    config.reconcile.stale_after_secs = 0;
    let worker = Arc::new(TranslateWorker::with_delay(Duration::from_millis(100)));
    let (controller, executor, reconciler) =
        pipeline(Arc::new(MemoryJobStore::new()), worker, &config);
    let key = JobKey::from("stale");
    assert_ok!(
        controller
            .create_job_from_chunks(&key, "one", single_line_chunks(1), options(1, 3))
            .await
    );

    let first = assert_ok!(
        executor
            .run_tick(
                &key,
                TickOptions {
                    max_processing_time: Some(Duration::from_millis(10)),
                },
            )
            .await
    );
    assert_eq!(first.still_running, 1);

    // The dispatch is reclaimed before its result arrives
    let report = assert_ok!(reconciler.reconcile(&key).await);
    assert_eq!(report.stale_requeued, vec![0]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let job = controller.get_job(&key).await.unwrap();
    let chunk = job.chunk(0).unwrap();
    assert_eq!(chunk.status, ChunkStatus::Queued);
    assert_eq!(chunk.retries, 1);
    assert!(chunk.lines.is_empty());
}

async fn claim_task(controller: &JobController, key: &JobKey) -> ChunkTask {
    match assert_ok!(controller.claim_next(key).await).outcome {
        ClaimOutcome::Dispatch(task) => task,
        ClaimOutcome::Idle(reason) => panic!("nothing to claim: {:?}", reason),
    }
}

async fn wait_until_settled(controller: &JobController, key: &JobKey) -> Job {
    for _ in 0..200 {
        let job = controller.get_job(key).await.unwrap();
        if job.active.is_empty()
            && job
                .chunks
                .values()
                .all(|c| c.status != ChunkStatus::Processing)
        {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} kept chunks processing", key);
}

#[tokio::test]
async fn replaced_job_ignores_old_dispatch() {
    let config = test_config();
    let (controller, _, _) = pipeline(
        Arc::new(MemoryJobStore::new()),
        Arc::new(TranslateWorker::default()),
        &config,
    );
    let key = JobKey::from("replaced");
    assert_ok!(
        controller
            .create_job(&key, "Old text.", CreateJobOptions::default())
            .await
    );
    let old = claim_task(&controller, &key).await;

    assert_ok!(
        controller
            .create_job(
                &key,
                "New text.",
                CreateJobOptions {
                    replace: true,
                    job: None,
                },
            )
            .await
    );
    let new = claim_task(&controller, &key).await;
    assert_eq!((old.chunk_index, old.attempt), (new.chunk_index, new.attempt));
    assert_ne!(old.generation, new.generation);

    let late = ChunkResult::Success(ChunkOutput {
        lines: vec![LineResult::translated(0, "TRANSLATION OF OLD TEXT")],
        fallback_mode: false,
    });
    let outcome = assert_ok!(controller.apply_dispatch_result(&key, old.ticket(), late).await);
    assert_eq!(outcome, ChunkOutcome::Ignored);

    let job = controller.get_job(&key).await.unwrap();
    let chunk = job.chunk(0).unwrap();
    assert_eq!(chunk.status, ChunkStatus::Processing);
    assert!(chunk.lines.is_empty());
    assert_eq!(chunk.source[0].text, "New text.");

    let current = ChunkResult::Success(ChunkOutput {
        lines: vec![LineResult::translated(0, "Nouveau texte.")],
        fallback_mode: false,
    });
    let outcome = assert_ok!(controller.apply_dispatch_result(&key, new.ticket(), current).await);
    assert_eq!(outcome, ChunkOutcome::Completed);
}

#[tokio::test]
async fn failed_claim_still_dispatches_earlier_claims() {
    let config = test_config();
    // write 1 creates the job, write 2 claims chunk 0, write 3 fails
    let store: Arc<dyn JobStore> = Arc::new(FlakyStore::failing_on(3));
    let worker = Arc::new(TranslateWorker::default());
    let (controller, executor, reconciler) = pipeline(store, worker.clone(), &config);
    let key = JobKey::from("claim-error");
    assert_ok!(
        controller
            .create_job_from_chunks(&key, "three", single_line_chunks(3), options(3, 3))
            .await
    );

    let result = executor.run_tick(&key, TickOptions::default()).await;
    assert!(matches!(result, Err(Error::Storage(_))));

    let job = wait_until_settled(&controller, &key).await;
    assert_eq!(job.chunk(0).unwrap().status, ChunkStatus::Completed);
    assert_eq!(job.queue.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(worker.calls.load(Ordering::SeqCst), 1);

    let report = assert_ok!(reconciler.reconcile(&key).await);
    assert!(report.stale_requeued.is_empty());
    let result = drive_to_terminal(&executor, &key).await;
    assert_eq!(result.job_status, JobStatus::Completed);
}

#[tokio::test]
async fn cancelled_tick_still_dispatches_its_claims() {
    let config = test_config();
    let store: Arc<dyn JobStore> = Arc::new(FlakyStore::slow(Duration::from_millis(25)));
    let worker = Arc::new(TranslateWorker::default());
    let (controller, executor, _) = pipeline(store, worker.clone(), &config);
    let key = JobKey::from("cancelled");
    assert_ok!(
        controller
            .create_job_from_chunks(&key, "three", single_line_chunks(3), options(3, 3))
            .await
    );

    // Dropped while claiming: the first claim has landed, a later one has not
    let cancelled = tokio::time::timeout(
        Duration::from_millis(40),
        executor.run_tick(&key, TickOptions::default()),
    )
    .await;
    assert!(cancelled.is_err());

    let job = wait_until_settled(&controller, &key).await;
    let claimed: Vec<&translation_jobs::Chunk> =
        job.chunks.values().filter(|c| c.attempt > 0).collect();
    assert!(!claimed.is_empty());
    assert!(claimed.iter().all(|c| c.status == ChunkStatus::Completed));
    assert_eq!(worker.calls.load(Ordering::SeqCst) as usize, claimed.len());
}

#[tokio::test]
async fn alignment_stall_does_not_block_translation() {
    let mut config = test_config();
    config.alignment.enabled = true;
    let aligner = Arc::new(StalledAligner {
        calls: AtomicU32::new(0),
    });
    let queue = Arc::new(AlignmentQueue::new(aligner.clone(), 1));
    let dispatcher = queue.spawn_dispatcher();

    let controller = Arc::new(JobController::new(Arc::new(MemoryJobStore::new()), &config));
    let executor = TickExecutor::new(
        Arc::clone(&controller),
        Arc::new(TranslateWorker::default()),
        &config,
    )
    .with_alignment(Arc::clone(&queue));
    let key = JobKey::from("aligned");
    assert_ok!(
        controller
            .create_job_from_chunks(&key, "four", single_line_chunks(4), options(2, 3))
            .await
    );

    let result = drive_to_terminal(&executor, &key).await;
    assert_eq!(result.job_status, JobStatus::Completed);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let stats = queue.stats();
    assert_eq!(stats.total_enqueued, 4);
    assert_eq!(stats.active, 1);
    assert_eq!(stats.pending, 3);
    assert_eq!(aligner.calls.load(Ordering::SeqCst), 1);

    // duplicate enqueue while pending is a no-op
    assert!(!queue.enqueue(AlignmentKey::new(key.clone(), 3)));
    assert_eq!(queue.stats().pending, 3);

    dispatcher.abort();
}

#[tokio::test]
async fn sqlite_job_resumes_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let config = test_config();
    let key = JobKey::from("durable");

    {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(&path).unwrap());
        let (controller, executor, _) =
            pipeline(store, Arc::new(TranslateWorker::default()), &config);
        assert_ok!(
            controller
                .create_job_from_chunks(&key, "five", single_line_chunks(5), options(2, 3))
                .await
        );
        let result = assert_ok!(executor.run_tick(&key, TickOptions::default()).await);
        assert_eq!(result.completed, 2);
    }

    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(&path).unwrap());
    let (controller, executor, _) = pipeline(store, Arc::new(TranslateWorker::default()), &config);
    let summary = controller.get_summary(&key).await.unwrap();
    assert_eq!(summary.counts.completed, 2);
    assert_eq!(summary.queue_length, 3);

    let result = drive_to_terminal(&executor, &key).await;
    assert_eq!(result.job_status, JobStatus::Completed);
}

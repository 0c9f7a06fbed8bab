//! Job controller: creates jobs and applies every state transition
//!
//! All mutations go through [`JobController::update`], a read-modify-write
//! against the stored record that retries on version conflicts. Nothing here
//! holds job state in memory between calls.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use super::backoff::retry_delay;
use super::completion::{chunk_work_done, refresh_job_status};
use super::scheduler::TickSignal;
use super::summary::ProgressSummary;
use crate::config::{JobsConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::ingestion::{LineChunker, TextChunk};
use crate::providers::{ChunkOutput, ChunkTask, DispatchTicket, WorkerError};
use crate::storage::{CasResult, JobStore};
use crate::types::{Chunk, ChunkStatus, Job, JobKey, JobOptions, LineResult};

/// Options for creating a job
#[derive(Debug, Clone, Default)]
pub struct CreateJobOptions {
    /// Overwrite an existing job under the same key
    pub replace: bool,
    /// Per-job scheduling options; configuration defaults when absent
    pub job: Option<JobOptions>,
}

/// Options for a manual requeue
#[derive(Debug, Clone, Copy, Default)]
pub struct RequeueOptions {
    /// Discard lines produced so far
    pub clear_lines: bool,
}

/// What a worker reported for a chunk
#[derive(Debug, Clone)]
pub enum ChunkResult {
    Success(ChunkOutput),
    Failure(WorkerError),
}

/// Effect of applying a result to a chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Every line is terminal; the chunk is done
    Completed,
    /// Lines were stored but some are still missing
    Partial {
        lines_processed: usize,
        total_lines: usize,
    },
    /// Failed below the retry limit and went back to the queue front
    Requeued {
        retries: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// Failed at the retry limit
    Failed,
    /// The result no longer applies (chunk terminal or dispatch superseded)
    Ignored,
}

/// Why a claim produced nothing to dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleReason {
    JobTerminal,
    AtCapacity,
    QueueEmpty,
    /// Everything left in the queue is waiting out a backoff
    WaitingForRetry,
}

/// Result of a claim attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Dispatch(ChunkTask),
    Idle(IdleReason),
}

/// A claim, plus chunks found already done while popping the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub outcome: ClaimOutcome,
    pub auto_completed: Vec<u32>,
}

/// Creates jobs and applies chunk transitions through the job store
pub struct JobController {
    store: Arc<dyn JobStore>,
    chunker: LineChunker,
    retry: RetryConfig,
    default_options: JobOptions,
    max_cas_retries: u32,
    signal: Arc<TickSignal>,
}

impl JobController {
    /// Create a controller over a store
    pub fn new(store: Arc<dyn JobStore>, config: &JobsConfig) -> Self {
        Self {
            store,
            chunker: LineChunker::from_config(&config.chunking),
            retry: config.retry.clone(),
            default_options: JobOptions::from_config(&config.scheduler, &config.retry),
            max_cas_retries: config.scheduler.max_cas_retries.max(1),
            signal: Arc::new(TickSignal::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn chunker(&self) -> &LineChunker {
        &self.chunker
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn default_options(&self) -> &JobOptions {
        &self.default_options
    }

    /// Signal raised by [`enqueue`](Self::enqueue)
    pub fn signal(&self) -> &Arc<TickSignal> {
        &self.signal
    }

    /// Chunk a document and create its job
    pub async fn create_job(
        &self,
        key: &JobKey,
        text: &str,
        options: CreateJobOptions,
    ) -> Result<Job> {
        let chunks = self.chunker.chunk_text(text);
        self.create_job_from_chunks(key, text, chunks, options).await
    }

    /// Create a job from chunks produced elsewhere
    pub async fn create_job_from_chunks(
        &self,
        key: &JobKey,
        text: &str,
        chunks: Vec<TextChunk>,
        options: CreateJobOptions,
    ) -> Result<Job> {
        let job_options = options
            .job
            .clone()
            .unwrap_or_else(|| self.default_options.clone());
        if job_options.max_concurrent == 0 || job_options.max_chunks_per_tick == 0 {
            return Err(Error::invalid_input(
                "max_concurrent and max_chunks_per_tick must be positive",
            ));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = chunks.iter().find(|c| !seen.insert(c.index)) {
            return Err(Error::invalid_input(format!(
                "duplicate chunk index {}",
                dup.index
            )));
        }

        let now = Utc::now();
        let chunks: Vec<Chunk> = chunks
            .into_iter()
            .map(|c| Chunk::new(c.index, c.lines, job_options.max_retries))
            .collect();
        let mut job = Job::new(key.clone(), document_hash(text), chunks, job_options, now);
        // an empty document has nothing to do
        refresh_job_status(&mut job, now);

        for _ in 0..self.max_cas_retries {
            let expected = match self.store.load(key).await? {
                Some(_) if !options.replace => {
                    return Err(Error::JobAlreadyExists(key.to_string()));
                }
                Some(existing) => Some(existing.version),
                None => None,
            };

            match self.store.compare_and_swap(key, expected, &job).await? {
                CasResult::Success { .. } => {
                    tracing::info!(
                        "Created job {} with {} chunks ({} lines)",
                        key,
                        job.chunks.len(),
                        job.total_lines
                    );
                    return Ok(job);
                }
                CasResult::Conflict { actual } => {
                    tracing::debug!("Create of job {} raced (stored version {:?})", key, actual);
                }
            }
        }

        Err(Error::Contention {
            job_key: key.to_string(),
            attempts: self.max_cas_retries,
        })
    }

    /// Ask for a tick on this job. Does no processing itself.
    pub async fn enqueue(&self, key: &JobKey) -> Result<()> {
        let job = self.get_job(key).await?;
        if !job.status.is_terminal() {
            self.signal.raise(key);
        }
        Ok(())
    }

    /// Atomic read-modify-write of one job.
    ///
    /// `transform` runs against a fresh copy of the stored record and may run
    /// more than once. The job status is re-derived after every transform;
    /// unchanged records are not written.
    pub async fn update<T, F>(&self, key: &JobKey, mut transform: F) -> Result<T>
    where
        F: FnMut(&mut Job, DateTime<Utc>) -> Result<T> + Send,
        T: Send,
    {
        for attempt in 1..=self.max_cas_retries {
            let current = self
                .store
                .load(key)
                .await?
                .ok_or_else(|| Error::JobNotFound(key.to_string()))?;

            let now = Utc::now();
            let mut next = current.value.clone();
            let output = transform(&mut next, now)?;
            refresh_job_status(&mut next, now);

            if next == current.value {
                return Ok(output);
            }
            next.updated_at = now;

            match self
                .store
                .compare_and_swap(key, Some(current.version), &next)
                .await?
            {
                CasResult::Success { .. } => return Ok(output),
                CasResult::Conflict { actual: None } => {
                    return Err(Error::JobNotFound(key.to_string()));
                }
                CasResult::Conflict { actual: Some(version) } => {
                    tracing::debug!(
                        "Job {} changed underneath us (read v{}, now v{}), attempt {}",
                        key,
                        current.version,
                        version,
                        attempt
                    );
                }
            }
        }

        tracing::warn!(
            "Giving up on job {} after {} conflicting writes",
            key,
            self.max_cas_retries
        );
        Err(Error::Contention {
            job_key: key.to_string(),
            attempts: self.max_cas_retries,
        })
    }

    /// Apply a worker result to a chunk
    pub async fn apply_chunk_result(
        &self,
        key: &JobKey,
        index: u32,
        result: ChunkResult,
    ) -> Result<ChunkOutcome> {
        let outcome = self
            .update(key, |job, now| {
                let chunk = job
                    .chunk(index)
                    .ok_or_else(|| Error::chunk_not_found(key.as_str(), index))?;
                if chunk.status.is_terminal() {
                    return Ok(ChunkOutcome::Ignored);
                }
                Ok(apply_result(job, index, &result, &self.retry, now))
            })
            .await?;

        log_outcome(key, index, &outcome);
        Ok(outcome)
    }

    /// Apply the result of one dispatch.
    ///
    /// Ignored unless the job record is the one the chunk was claimed from
    /// and the chunk is still processing that same attempt. A
    /// dispatch that returns without covering every line counts as a failed
    /// attempt; the lines it did produce are kept.
    pub async fn apply_dispatch_result(
        &self,
        key: &JobKey,
        ticket: DispatchTicket,
        result: ChunkResult,
    ) -> Result<ChunkOutcome> {
        let index = ticket.chunk_index;
        let outcome = self
            .update(key, |job, now| {
                if job.generation != ticket.generation {
                    return Ok(ChunkOutcome::Ignored);
                }
                let current = match job.chunk(index) {
                    Some(chunk) => {
                        chunk.attempt == ticket.attempt
                            && chunk.status == ChunkStatus::Processing
                            && job.active.contains(&index)
                    }
                    None => false,
                };
                if !current {
                    return Ok(ChunkOutcome::Ignored);
                }

                match apply_result(job, index, &result, &self.retry, now) {
                    ChunkOutcome::Partial {
                        lines_processed,
                        total_lines,
                    } => Ok(fail_chunk(
                        job,
                        index,
                        "worker returned incomplete output".to_string(),
                        Some(format!("{} of {} lines", lines_processed, total_lines)),
                        &self.retry,
                        now,
                    )),
                    outcome => Ok(outcome),
                }
            })
            .await?;

        if outcome == ChunkOutcome::Ignored {
            tracing::debug!(
                "Discarded result for chunk {} of job {} (attempt {} superseded)",
                index,
                key,
                ticket.attempt
            );
        } else {
            log_outcome(key, index, &outcome);
        }
        Ok(outcome)
    }

    /// Operator recovery: put a chunk back at the head of the queue.
    ///
    /// Safe in any state. Resets retry bookkeeping and bumps the dispatch
    /// attempt so a result from an earlier dispatch is discarded.
    pub async fn requeue_chunk(
        &self,
        key: &JobKey,
        index: u32,
        options: RequeueOptions,
    ) -> Result<()> {
        self.update(key, |job, _now| {
            let chunk = job
                .chunk_mut(index)
                .ok_or_else(|| Error::chunk_not_found(key.as_str(), index))?;

            chunk.status = ChunkStatus::Queued;
            if options.clear_lines {
                chunk.clear_lines();
            }
            chunk.retries = 0;
            chunk.next_retry_at = None;
            chunk.completed_at = None;
            chunk.attempt += 1;
            job.push_front(index);
            Ok(())
        })
        .await?;

        tracing::info!(
            "Requeued chunk {} of job {} (clear_lines: {})",
            index,
            key,
            options.clear_lines
        );
        self.signal.raise(key);
        Ok(())
    }

    /// Atomically pick the next dispatchable chunk and mark it processing.
    ///
    /// Queue entries that are dangling, terminal or already active are
    /// dropped; entries whose work is already done are completed in place;
    /// entries still waiting out a backoff keep their queue position.
    pub async fn claim_next(&self, key: &JobKey) -> Result<Claim> {
        let claim = self
            .update(key, |job, now| Ok(claim_in(job, now)))
            .await?;

        for index in &claim.auto_completed {
            tracing::warn!(
                "Chunk {} of job {} was queued with all lines done; completed",
                index,
                key
            );
        }
        if let ClaimOutcome::Dispatch(task) = &claim.outcome {
            tracing::debug!(
                "Claimed chunk {} of job {} (attempt {}, {} lines)",
                task.chunk_index,
                key,
                task.attempt,
                task.lines.len()
            );
        }
        Ok(claim)
    }

    /// Load a job
    pub async fn get_job(&self, key: &JobKey) -> Result<Job> {
        self.store
            .load(key)
            .await?
            .map(|v| v.value)
            .ok_or_else(|| Error::JobNotFound(key.to_string()))
    }

    /// Progress snapshot of a job
    pub async fn get_summary(&self, key: &JobKey) -> Result<ProgressSummary> {
        Ok(ProgressSummary::from_job(&self.get_job(key).await?))
    }

    /// Snapshots of every stored job
    pub async fn list_jobs(&self) -> Result<Vec<ProgressSummary>> {
        let mut summaries = Vec::new();
        for key in self.store.list_keys().await? {
            if let Some(job) = self.store.load(&key).await? {
                summaries.push(ProgressSummary::from_job(&job.value));
            }
        }
        Ok(summaries)
    }

    /// Delete a job and its chunks
    pub async fn delete_job(&self, key: &JobKey) -> Result<()> {
        if !self.store.delete(key).await? {
            return Err(Error::JobNotFound(key.to_string()));
        }
        tracing::info!("Deleted job {}", key);
        Ok(())
    }
}

fn document_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn log_outcome(key: &JobKey, index: u32, outcome: &ChunkOutcome) {
    match outcome {
        ChunkOutcome::Completed => {
            tracing::info!("Chunk {} of job {} completed", index, key);
        }
        ChunkOutcome::Partial {
            lines_processed,
            total_lines,
        } => {
            tracing::debug!(
                "Chunk {} of job {}: {}/{} lines",
                index,
                key,
                lines_processed,
                total_lines
            );
        }
        ChunkOutcome::Requeued {
            retries,
            next_retry_at,
        } => {
            tracing::warn!(
                "Chunk {} of job {} failed, retry {} at {}",
                index,
                key,
                retries,
                next_retry_at
            );
        }
        ChunkOutcome::Failed => {
            tracing::error!("Chunk {} of job {} failed permanently", index, key);
        }
        ChunkOutcome::Ignored => {}
    }
}

/// Apply a result to a non-terminal chunk known to exist
fn apply_result(
    job: &mut Job,
    index: u32,
    result: &ChunkResult,
    retry: &RetryConfig,
    now: DateTime<Utc>,
) -> ChunkOutcome {
    match result {
        ChunkResult::Success(output) => {
            let Some(chunk) = job.chunk_mut(index) else {
                return ChunkOutcome::Ignored;
            };
            merge_lines(chunk, &output.lines);
            chunk.lines_processed = chunk.terminal_line_count();
            chunk.fallback_mode |= output.fallback_mode;

            if chunk_work_done(chunk) {
                mark_chunk_completed(job, index, now);
                ChunkOutcome::Completed
            } else {
                ChunkOutcome::Partial {
                    lines_processed: chunk.lines_processed,
                    total_lines: chunk.total_lines,
                }
            }
        }
        ChunkResult::Failure(err) => fail_chunk(
            job,
            index,
            err.message.clone(),
            err.details.clone(),
            retry,
            now,
        ),
    }
}

/// Merge new line results into a chunk, ordered by line index.
///
/// Results for lines outside the chunk's source span are dropped, and a
/// non-terminal result never replaces a terminal one.
fn merge_lines(chunk: &mut Chunk, incoming: &[LineResult]) {
    let allowed: BTreeSet<usize> = chunk.source.iter().map(|l| l.line_index).collect();
    let mut merged: BTreeMap<usize, LineResult> = chunk
        .lines
        .drain(..)
        .filter(|l| allowed.contains(&l.line_index))
        .map(|l| (l.line_index, l))
        .collect();

    for line in incoming {
        if !allowed.contains(&line.line_index) {
            continue;
        }
        let keep_existing = merged
            .get(&line.line_index)
            .map(|existing| existing.status.is_terminal() && !line.status.is_terminal())
            .unwrap_or(false);
        if !keep_existing {
            merged.insert(line.line_index, line.clone());
        }
    }

    chunk.lines = merged.into_values().collect();
}

/// Move a chunk to completed and out of queue/active
pub(crate) fn mark_chunk_completed(job: &mut Job, index: u32, now: DateTime<Utc>) {
    if let Some(chunk) = job.chunk_mut(index) {
        chunk.status = ChunkStatus::Completed;
        chunk.completed_at = Some(now);
        chunk.next_retry_at = None;
        chunk.lines_processed = chunk.terminal_line_count();
    }
    job.detach(index);
}

/// Failure path: requeue with backoff below the retry limit, else fail
pub(crate) fn fail_chunk(
    job: &mut Job,
    index: u32,
    message: String,
    details: Option<String>,
    retry: &RetryConfig,
    now: DateTime<Utc>,
) -> ChunkOutcome {
    let Some(chunk) = job.chunk_mut(index) else {
        return ChunkOutcome::Ignored;
    };
    chunk.record_error(message, details, now);

    if chunk.retries < chunk.max_retries {
        chunk.retries += 1;
        chunk.status = ChunkStatus::Queued;
        let next_retry_at = now + retry_delay(chunk.retries, retry);
        chunk.next_retry_at = Some(next_retry_at);
        let retries = chunk.retries;
        job.push_front(index);
        ChunkOutcome::Requeued {
            retries,
            next_retry_at,
        }
    } else {
        chunk.status = ChunkStatus::Failed;
        chunk.completed_at = Some(now);
        chunk.next_retry_at = None;
        job.detach(index);
        ChunkOutcome::Failed
    }
}

fn claim_in(job: &mut Job, now: DateTime<Utc>) -> Claim {
    let mut auto_completed = Vec::new();

    if job.status.is_terminal() {
        return Claim {
            outcome: ClaimOutcome::Idle(IdleReason::JobTerminal),
            auto_completed,
        };
    }
    if job.active.len() >= job.options.max_concurrent {
        return Claim {
            outcome: ClaimOutcome::Idle(IdleReason::AtCapacity),
            auto_completed,
        };
    }

    let mut deferred: Vec<u32> = Vec::new();
    let mut picked = None;

    while let Some(index) = job.queue.pop_front() {
        let (terminal, done, ready) = match job.chunk(index) {
            Some(chunk) => (
                chunk.status.is_terminal(),
                chunk_work_done(chunk),
                chunk.is_ready(now),
            ),
            None => continue,
        };
        if terminal || job.active.contains(&index) || deferred.contains(&index) {
            continue;
        }
        if done {
            mark_chunk_completed(job, index, now);
            auto_completed.push(index);
            continue;
        }
        if !ready {
            deferred.push(index);
            continue;
        }
        picked = Some(index);
        break;
    }

    for index in deferred.iter().rev() {
        job.queue.push_front(*index);
    }

    let Some(index) = picked else {
        let reason = if deferred.is_empty() {
            IdleReason::QueueEmpty
        } else {
            IdleReason::WaitingForRetry
        };
        return Claim {
            outcome: ClaimOutcome::Idle(reason),
            auto_completed,
        };
    };

    job.remove_from_queue(index);
    job.active.insert(index);
    if job.started_at.is_none() {
        job.started_at = Some(now);
    }

    let job_key = job.key.clone();
    let generation = job.generation;
    let Some(chunk) = job.chunk_mut(index) else {
        return Claim {
            outcome: ClaimOutcome::Idle(IdleReason::QueueEmpty),
            auto_completed,
        };
    };
    chunk.status = ChunkStatus::Processing;
    chunk.attempt += 1;
    chunk.started_at = Some(now);
    chunk.next_retry_at = None;

    Claim {
        outcome: ClaimOutcome::Dispatch(ChunkTask {
            job_key,
            generation,
            chunk_index: index,
            attempt: chunk.attempt,
            retries: chunk.retries,
            lines: chunk.source.clone(),
        }),
        auto_completed,
    }
}

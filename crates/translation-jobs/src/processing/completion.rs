//! Completion predicates shared by the controller, executor and reconciler
//!
//! Every "is this done" question in the pipeline goes through these
//! functions so that the answers never disagree.

use chrono::{DateTime, Utc};

use crate::types::{Chunk, ChunkStatus, Job, JobStatus};

/// A chunk's work is done: one result per source line, each terminal.
///
/// This says nothing about the chunk's status field; see [`is_stuck`].
pub fn chunk_work_done(chunk: &Chunk) -> bool {
    chunk.lines.len() == chunk.total_lines && chunk.lines.iter().all(|l| l.status.is_terminal())
}

/// Work is done but the status was never moved to a terminal state
pub fn is_stuck(chunk: &Chunk) -> bool {
    !chunk.status.is_terminal() && chunk_work_done(chunk)
}

/// Nothing left to dispatch or await, and no chunk is non-terminal
pub fn job_work_finished(job: &Job) -> bool {
    job.queue.is_empty()
        && job.active.is_empty()
        && job.chunks.values().all(|c| c.status.is_terminal())
}

/// Derive the job status from its chunks and structures
pub fn derive_job_status(job: &Job) -> JobStatus {
    if job_work_finished(job) {
        let any_failed = job.chunks.values().any(|c| c.status == ChunkStatus::Failed);
        if job.options.fail_on_chunk_failure && any_failed {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        }
    } else if job.started_at.is_some()
        || job.chunks.values().any(|c| c.status != ChunkStatus::Pending)
    {
        JobStatus::Processing
    } else {
        JobStatus::Pending
    }
}

/// Re-derive the job status in place; returns whether it changed
pub fn refresh_job_status(job: &mut Job, now: DateTime<Utc>) -> bool {
    let status = derive_job_status(job);
    let changed = status != job.status;
    job.status = status;

    if status.is_terminal() {
        if job.completed_at.is_none() {
            job.completed_at = Some(now);
        }
    } else {
        job.completed_at = None;
    }
    changed
}

//! Read-only progress view of a job

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Chunk, ChunkStatus, Job, JobKey, JobStatus};

/// Chunk counts by status; always sums to `total`
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub total: usize,
    pub completed: usize,
    pub processing: usize,
    pub queued: usize,
    pub pending: usize,
    pub failed: usize,
}

impl StatusCounts {
    fn add(&mut self, status: ChunkStatus) {
        self.total += 1;
        match status {
            ChunkStatus::Completed => self.completed += 1,
            ChunkStatus::Processing => self.processing += 1,
            ChunkStatus::Queued => self.queued += 1,
            ChunkStatus::Pending => self.pending += 1,
            ChunkStatus::Failed => self.failed += 1,
        }
    }

    /// Chunks in a terminal status
    pub fn terminal(&self) -> usize {
        self.completed + self.failed
    }
}

/// Display copy of one chunk, without its source text or line results
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkSnapshot {
    pub index: u32,
    pub status: ChunkStatus,
    pub lines_processed: usize,
    pub total_lines: usize,
    pub retries: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub fallback_mode: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Chunk> for ChunkSnapshot {
    fn from(chunk: &Chunk) -> Self {
        Self {
            index: chunk.index,
            status: chunk.status,
            lines_processed: chunk.lines_processed,
            total_lines: chunk.total_lines,
            retries: chunk.retries,
            max_retries: chunk.max_retries,
            next_retry_at: chunk.next_retry_at,
            error: chunk.error.clone(),
            fallback_mode: chunk.fallback_mode,
            started_at: chunk.started_at,
            completed_at: chunk.completed_at,
        }
    }
}

/// Progress of a job at one point in time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressSummary {
    pub job_key: JobKey,
    pub status: JobStatus,
    pub counts: StatusCounts,
    pub lines_processed: usize,
    pub total_lines: usize,
    pub queue_length: usize,
    pub active: usize,
    pub chunks: Vec<ChunkSnapshot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProgressSummary {
    /// Summarize a loaded job
    pub fn from_job(job: &Job) -> Self {
        let mut counts = StatusCounts::default();
        for chunk in job.chunks.values() {
            counts.add(chunk.status);
        }

        Self {
            job_key: job.key.clone(),
            status: job.status,
            counts,
            lines_processed: job.chunks.values().map(|c| c.lines_processed).sum(),
            total_lines: job.total_lines,
            queue_length: job.queue.len(),
            active: job.active.len(),
            chunks: job.chunks.values().map(ChunkSnapshot::from).collect(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }

    /// Terminal chunks as a percentage of all chunks
    pub fn percent_complete(&self) -> f64 {
        if self.counts.total == 0 {
            return if self.status.is_terminal() { 100.0 } else { 0.0 };
        }
        self.counts.terminal() as f64 / self.counts.total as f64 * 100.0
    }
}

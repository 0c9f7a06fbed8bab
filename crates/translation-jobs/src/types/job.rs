//! Job aggregate: the full state of translating one document

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use uuid::Uuid;

use super::chunk::{Chunk, ChunkStatus};
use crate::config::{RetryConfig, SchedulerConfig};

/// Opaque job identifier, one per document-processing context
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Job status, derived from chunk state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Per-job scheduling options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobOptions {
    /// Cap on chunks processed simultaneously
    pub max_concurrent: usize,
    /// Cap on chunks started by one tick
    pub max_chunks_per_tick: usize,
    /// Retries each chunk gets before it is marked failed
    pub max_retries: u32,
    /// Mark the job failed, rather than completed, when any chunk failed
    #[serde(default)]
    pub fail_on_chunk_failure: bool,
}

impl JobOptions {
    /// Options taken from the service configuration
    pub fn from_config(scheduler: &SchedulerConfig, retry: &RetryConfig) -> Self {
        Self {
            max_concurrent: scheduler.max_concurrent,
            max_chunks_per_tick: scheduler.max_chunks_per_tick,
            max_retries: retry.max_retries,
            fail_on_chunk_failure: false,
        }
    }
}

impl Default for JobOptions {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default(), &RetryConfig::default())
    }
}

/// Durable state of one job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub key: JobKey,
    /// Fresh for every created or replaced record under a key
    #[serde(default)]
    pub generation: Uuid,
    pub status: JobStatus,
    pub options: JobOptions,
    /// SHA-256 of the source text
    pub document_hash: String,
    /// Non-blank lines across all chunks
    pub total_lines: usize,
    /// Chunk indices awaiting dispatch; retries are pushed to the front
    pub queue: VecDeque<u32>,
    /// Chunk indices currently dispatched
    pub active: BTreeSet<u32>,
    /// Chunks keyed by index, in document order
    pub chunks: BTreeMap<u32, Chunk>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a job with every chunk pending and enqueued in order
    pub fn new(
        key: JobKey,
        document_hash: String,
        chunks: Vec<Chunk>,
        options: JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let total_lines = chunks.iter().map(|c| c.total_lines).sum();
        let queue = chunks.iter().map(|c| c.index).collect();
        let chunks = chunks.into_iter().map(|c| (c.index, c)).collect();

        Self {
            key,
            generation: Uuid::new_v4(),
            status: JobStatus::Pending,
            options,
            document_hash,
            total_lines,
            queue,
            active: BTreeSet::new(),
            chunks,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn chunk(&self, index: u32) -> Option<&Chunk> {
        self.chunks.get(&index)
    }

    pub fn chunk_mut(&mut self, index: u32) -> Option<&mut Chunk> {
        self.chunks.get_mut(&index)
    }

    /// Remove every occurrence of an index from the queue
    pub fn remove_from_queue(&mut self, index: u32) {
        self.queue.retain(|&i| i != index);
    }

    /// Take a chunk out of both queue and active
    pub fn detach(&mut self, index: u32) {
        self.remove_from_queue(index);
        self.active.remove(&index);
    }

    /// Put a chunk at the head of the queue, out of active
    pub fn push_front(&mut self, index: u32) {
        self.detach(index);
        self.queue.push_front(index);
    }

    /// Count of chunks in the given status
    pub fn count_status(&self, status: ChunkStatus) -> usize {
        self.chunks.values().filter(|c| c.status == status).count()
    }
}

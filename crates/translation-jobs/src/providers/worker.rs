//! Worker provider traits for chunk translation and alignment

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::processing::AlignmentKey;
use crate::types::{JobKey, LineResult, SourceLine};

/// A chunk handed to a worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkTask {
    pub job_key: JobKey,
    /// Generation of the job record the chunk was claimed from
    pub generation: Uuid,
    pub chunk_index: u32,
    /// Dispatch attempt this task belongs to
    pub attempt: u32,
    /// Failed attempts so far
    pub retries: u32,
    pub lines: Vec<SourceLine>,
}

impl ChunkTask {
    /// Identity of this dispatch
    pub fn ticket(&self) -> DispatchTicket {
        DispatchTicket {
            generation: self.generation,
            chunk_index: self.chunk_index,
            attempt: self.attempt,
        }
    }
}

/// Identifies one dispatch of one chunk
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DispatchTicket {
    pub generation: Uuid,
    pub chunk_index: u32,
    pub attempt: u32,
}

/// What a worker produced for a chunk
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkOutput {
    pub lines: Vec<LineResult>,
    /// Degraded processing was used
    #[serde(default)]
    pub fallback_mode: bool,
}

/// A worker failure. Always treated as transient by the pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct WorkerError {
    pub message: String,
    pub details: Option<String>,
}

impl WorkerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: Some(details.into()),
        }
    }
}

/// Trait for translating one chunk
///
/// Implementations:
/// - `HttpChunkWorker`: remote translation service
#[async_trait]
pub trait ChunkWorker: Send + Sync {
    /// Produce per-line results for a chunk
    async fn process(&self, task: ChunkTask) -> std::result::Result<ChunkOutput, WorkerError>;

    /// Get worker name for logging
    fn name(&self) -> &str;
}

/// Trait for low-priority alignment enrichment
///
/// Implementations:
/// - `HttpAlignmentWorker`: remote alignment service
#[async_trait]
pub trait AlignmentWorker: Send + Sync {
    /// Align one unit of work; failures are dropped by the queue
    async fn align(&self, key: &AlignmentKey) -> std::result::Result<(), WorkerError>;

    /// Get worker name for logging
    fn name(&self) -> &str;
}

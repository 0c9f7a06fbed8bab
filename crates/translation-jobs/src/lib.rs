//! translation-jobs: chunked background translation job pipeline
//!
//! Splits documents into line chunks, dispatches chunks to a translation
//! worker with bounded concurrency, retries failures with backoff, repairs
//! jobs that get stuck in a non-terminal state, and reports consistent
//! progress at any time. Job state lives in a versioned store and every
//! transition is an optimistic read-modify-write. A separate, low-priority
//! alignment queue runs enrichment work without touching the primary pipeline.

pub mod config;
pub mod error;
pub mod ingestion;
pub mod processing;
pub mod providers;
pub mod server;
pub mod storage;
pub mod types;

pub use config::JobsConfig;
pub use error::{Error, Result};
pub use ingestion::{LineChunker, TextChunk};
pub use processing::{
    AlignmentKey, AlignmentQueue, JobController, ProgressSummary, Reconciler, RepairReport,
    TickExecutor, TickOptions, TickResult,
};
pub use providers::{AlignmentWorker, ChunkOutput, ChunkTask, ChunkWorker, WorkerError};
pub use storage::{CasResult, JobStore, MemoryJobStore, SqliteJobStore, Versioned};
pub use types::{Chunk, ChunkStatus, Job, JobKey, JobOptions, JobStatus, LineResult, LineStatus};

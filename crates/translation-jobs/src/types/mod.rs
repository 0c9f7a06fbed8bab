//! Core types for jobs, chunks and line results

pub mod chunk;
pub mod job;

pub use chunk::{Chunk, ChunkStatus, ErrorRecord, LineResult, LineStatus, SourceLine};
pub use job::{Job, JobKey, JobOptions, JobStatus};

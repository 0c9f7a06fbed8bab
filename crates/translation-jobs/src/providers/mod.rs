//! External collaborators: the workers that translate and align chunks
//!
//! The pipeline only depends on the traits here; how a chunk is actually
//! translated is up to the implementation.

pub mod http;
pub mod worker;

pub use http::{HttpAlignmentWorker, HttpChunkWorker};
pub use worker::{
    AlignmentWorker, ChunkOutput, ChunkTask, ChunkWorker, DispatchTicket, WorkerError,
};

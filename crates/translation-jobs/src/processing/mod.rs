//! Job pipeline: controller, tick executor, reconciler and the alignment queue

pub mod alignment;
pub mod backoff;
pub mod completion;
pub mod controller;
pub mod executor;
pub mod reconciler;
pub mod scheduler;
pub mod summary;

pub use alignment::{AlignmentKey, AlignmentQueue, AlignmentStats};
pub use controller::{
    ChunkOutcome, ChunkResult, Claim, ClaimOutcome, CreateJobOptions, IdleReason, JobController,
    RequeueOptions,
};
pub use executor::{TickExecutor, TickOptions, TickResult};
pub use reconciler::{repair_job, Reconciler, RepairReport};
pub use scheduler::{TickScheduler, TickSignal};
pub use summary::{ChunkSnapshot, ProgressSummary, StatusCounts};

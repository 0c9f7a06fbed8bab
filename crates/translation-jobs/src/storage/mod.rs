//! Durable job state storage
//!
//! The whole job record is the unit of persistence. Writers never overwrite
//! blindly: every write names the version it read, and loses with
//! [`CasResult::Conflict`] if another writer got there first.

mod database;
mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Job, JobKey};

pub use database::SqliteJobStore;
pub use memory::MemoryJobStore;

/// A stored value with its write version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    /// Starts at 1 on insert, bumped by every successful swap
    pub version: u64,
    pub value: T,
}

/// Result of a compare-and-swap write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// Write applied; the record now has this version
    Success { version: u64 },
    /// The stored version was not the expected one (`None` = no record)
    Conflict { actual: Option<u64> },
}

impl CasResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Keyed store of job records with optimistic concurrency
///
/// Implementations:
/// - `MemoryJobStore`: process-local, for tests and ephemeral deployments
/// - `SqliteJobStore`: SQLite file
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Load a job with its version
    async fn load(&self, key: &JobKey) -> Result<Option<Versioned<Job>>>;

    /// Write `job` if the stored version equals `expected`.
    ///
    /// `expected = None` means "insert; there must be no record yet".
    async fn compare_and_swap(
        &self,
        key: &JobKey,
        expected: Option<u64>,
        job: &Job,
    ) -> Result<CasResult>;

    /// All stored job keys
    async fn list_keys(&self) -> Result<Vec<JobKey>>;

    /// Keys of jobs whose status is not terminal
    async fn list_unfinished(&self) -> Result<Vec<JobKey>> {
        let mut keys = Vec::new();
        for key in self.list_keys().await? {
            if let Some(job) = self.load(&key).await? {
                if !job.value.status.is_terminal() {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    /// Delete a job; returns whether it existed
    async fn delete(&self, key: &JobKey) -> Result<bool>;

    /// Store name for logging
    fn name(&self) -> &str;
}

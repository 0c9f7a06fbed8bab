//! In-memory job store

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{CasResult, JobStore, Versioned};
use crate::error::Result;
use crate::types::{Job, JobKey};

/// Process-local job store; swaps are atomic under the map's shard lock
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: DashMap<JobKey, Versioned<Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn load(&self, key: &JobKey) -> Result<Option<Versioned<Job>>> {
        Ok(self.jobs.get(key).map(|entry| entry.value().clone()))
    }

    async fn compare_and_swap(
        &self,
        key: &JobKey,
        expected: Option<u64>,
        job: &Job,
    ) -> Result<CasResult> {
        let result = match self.jobs.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let actual = entry.get().version;
                if expected == Some(actual) {
                    let version = actual + 1;
                    entry.insert(Versioned {
                        version,
                        value: job.clone(),
                    });
                    CasResult::Success { version }
                } else {
                    CasResult::Conflict {
                        actual: Some(actual),
                    }
                }
            }
            Entry::Vacant(entry) => {
                if expected.is_none() {
                    entry.insert(Versioned {
                        version: 1,
                        value: job.clone(),
                    });
                    CasResult::Success { version: 1 }
                } else {
                    CasResult::Conflict { actual: None }
                }
            }
        };
        Ok(result)
    }

    async fn list_keys(&self) -> Result<Vec<JobKey>> {
        let mut keys: Vec<JobKey> = self.jobs.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &JobKey) -> Result<bool> {
        Ok(self.jobs.remove(key).is_some())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

//! Stuck-state watchdog
//!
//! Detects and repairs job records that drifted out of a consistent state:
//! chunks whose work is done but whose status never moved, dispatches that
//! never reported back, and queue/active structures that disagree with chunk
//! statuses. The job status is re-derived on every pass, so a job with no
//! remaining work always converges to a terminal status in one call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use super::completion::{is_stuck, refresh_job_status};
use super::controller::{fail_chunk, mark_chunk_completed, ChunkOutcome, JobController};
use crate::config::{ReconcileConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::types::{ChunkStatus, Job, JobKey, JobStatus};

/// What one reconciliation pass changed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepairReport {
    pub job_key: JobKey,
    /// Non-terminal chunks with all lines done, forced to completed
    pub stuck_completed: Vec<u32>,
    /// Stale dispatches sent back to the queue
    pub stale_requeued: Vec<u32>,
    /// Stale dispatches that had no retries left
    pub stale_failed: Vec<u32>,
    /// Non-terminal chunks found outside queue and active, or active without
    /// being dispatched
    pub reenqueued: Vec<u32>,
    /// Queue entries removed (unknown, duplicate, terminal or also active)
    pub dropped_queue_entries: usize,
    /// Active entries removed (unknown or terminal)
    pub dropped_active_entries: usize,
    pub status_before: JobStatus,
    pub status_after: JobStatus,
}

impl RepairReport {
    /// Nothing was repaired
    pub fn is_clean(&self) -> bool {
        self.stuck_completed.is_empty()
            && self.stale_requeued.is_empty()
            && self.stale_failed.is_empty()
            && self.reenqueued.is_empty()
            && self.dropped_queue_entries == 0
            && self.dropped_active_entries == 0
            && self.status_before == self.status_after
    }
}

/// Repairs inconsistent job state through the controller
pub struct Reconciler {
    controller: Arc<JobController>,
    stale_after: chrono::Duration,
}

impl Reconciler {
    pub fn new(controller: Arc<JobController>, config: &ReconcileConfig) -> Self {
        Self {
            controller,
            stale_after: chrono::Duration::seconds(config.stale_after_secs.min(i64::MAX as u64) as i64),
        }
    }

    /// Run one repair pass over a job
    pub async fn reconcile(&self, key: &JobKey) -> Result<RepairReport> {
        let retry = self.controller.retry_config().clone();
        let stale_after = self.stale_after;

        let report = self
            .controller
            .update(key, |job, now| Ok(repair_job(job, now, stale_after, &retry)))
            .await?;

        if !report.stuck_completed.is_empty() {
            tracing::warn!(
                "Job {}: completed stuck chunks {:?}",
                key,
                report.stuck_completed
            );
        }
        if !report.stale_requeued.is_empty() || !report.stale_failed.is_empty() {
            tracing::warn!(
                "Job {}: reclaimed stale dispatches (requeued {:?}, failed {:?})",
                key,
                report.stale_requeued,
                report.stale_failed
            );
        }
        if !report.reenqueued.is_empty()
            || report.dropped_queue_entries > 0
            || report.dropped_active_entries > 0
        {
            tracing::warn!(
                "Job {}: repaired queue (re-enqueued {:?}, dropped {} queued / {} active entries)",
                key,
                report.reenqueued,
                report.dropped_queue_entries,
                report.dropped_active_entries
            );
        }
        if report.status_before != report.status_after {
            tracing::info!(
                "Job {}: status {:?} -> {:?}",
                key,
                report.status_before,
                report.status_after
            );
        }

        Ok(report)
    }

    /// Reconcile every stored job; jobs deleted mid-pass are skipped
    pub async fn reconcile_all(&self) -> Result<Vec<RepairReport>> {
        let mut reports = Vec::new();
        for key in self.controller.store().list_keys().await? {
            match self.reconcile(&key).await {
                Ok(report) => reports.push(report),
                Err(Error::JobNotFound(_)) => {}
                Err(e) => tracing::error!("Failed to reconcile job {}: {}", key, e),
            }
        }
        Ok(reports)
    }
}

/// Repair a job record in place
pub fn repair_job(
    job: &mut Job,
    now: DateTime<Utc>,
    stale_after: chrono::Duration,
    retry: &RetryConfig,
) -> RepairReport {
    let mut report = RepairReport {
        job_key: job.key.clone(),
        stuck_completed: Vec::new(),
        stale_requeued: Vec::new(),
        stale_failed: Vec::new(),
        reenqueued: Vec::new(),
        dropped_queue_entries: 0,
        dropped_active_entries: 0,
        status_before: job.status,
        status_after: job.status,
    };

    // Work done, status never updated
    let stuck: Vec<u32> = job
        .chunks
        .values()
        .filter(|c| is_stuck(c))
        .map(|c| c.index)
        .collect();
    for index in stuck {
        mark_chunk_completed(job, index, now);
        report.stuck_completed.push(index);
    }

    // Structural cleanup
    let chunks = &job.chunks;
    let active_before = job.active.len();
    job.active
        .retain(|i| chunks.get(i).is_some_and(|c| !c.status.is_terminal()));
    report.dropped_active_entries = active_before - job.active.len();

    let active = &job.active;
    let queue_before = job.queue.len();
    let mut seen = HashSet::new();
    job.queue.retain(|i| {
        chunks.get(i).is_some_and(|c| !c.status.is_terminal())
            && !active.contains(i)
            && seen.insert(*i)
    });
    report.dropped_queue_entries = queue_before - job.queue.len();

    // Dispatches that never reported back
    let stale: Vec<u32> = job
        .active
        .iter()
        .copied()
        .filter(|i| {
            job.chunk(*i).is_some_and(|c| {
                c.status == ChunkStatus::Processing
                    && c.started_at.map_or(true, |at| now - at >= stale_after)
            })
        })
        .collect();
    for index in stale {
        let message = match job.chunk_mut(index) {
            Some(chunk) => {
                // A late result from the lost dispatch must not apply
                chunk.attempt += 1;
                format!(
                    "dispatch stale: no result since {}",
                    chunk
                        .started_at
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_else(|| "an unknown time".to_string())
                )
            }
            None => continue,
        };
        match fail_chunk(job, index, message, None, retry, now) {
            ChunkOutcome::Failed => report.stale_failed.push(index),
            _ => report.stale_requeued.push(index),
        }
    }

    // Active but never dispatched: back to the queue head
    let undispatched: Vec<u32> = job
        .active
        .iter()
        .copied()
        .filter(|i| job.chunk(*i).is_some_and(|c| c.status != ChunkStatus::Processing))
        .collect();
    for index in undispatched.into_iter().rev() {
        if let Some(chunk) = job.chunk_mut(index) {
            chunk.status = ChunkStatus::Queued;
        }
        job.push_front(index);
        report.reenqueued.push(index);
    }

    // Queued entries still claiming to be processing
    let queued: HashSet<u32> = job.queue.iter().copied().collect();
    for chunk in job.chunks.values_mut() {
        if chunk.status == ChunkStatus::Processing && queued.contains(&chunk.index) {
            chunk.status = ChunkStatus::Queued;
        }
    }

    // Non-terminal chunks nobody will ever dispatch
    let orphans: Vec<u32> = job
        .chunks
        .values()
        .filter(|c| {
            !c.status.is_terminal() && !queued.contains(&c.index) && !job.active.contains(&c.index)
        })
        .map(|c| c.index)
        .collect();
    for index in orphans {
        if let Some(chunk) = job.chunk_mut(index) {
            if chunk.status == ChunkStatus::Processing {
                chunk.status = ChunkStatus::Queued;
            }
        }
        job.queue.push_back(index);
        report.reenqueued.push(index);
    }

    refresh_job_status(job, now);
    report.status_after = job.status;
    report
}

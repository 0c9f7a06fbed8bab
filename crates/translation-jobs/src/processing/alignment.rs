//! Secondary alignment queue
//!
//! Low-priority enrichment work keyed by `(job, chunk)`. It has its own lock,
//! its own concurrency cap and its own worker, and shares nothing with the
//! translation pipeline: a slow or failing aligner never delays a tick.
//! Failures are logged and dropped.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::providers::AlignmentWorker;
use crate::types::JobKey;

/// One unit of alignment work
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlignmentKey {
    pub job_key: JobKey,
    pub index: u32,
}

impl AlignmentKey {
    pub fn new(job_key: JobKey, index: u32) -> Self {
        Self { job_key, index }
    }
}

struct AlignmentState {
    /// Waiting units (FIFO)
    pending: VecDeque<AlignmentKey>,
    /// Dedup set of waiting units
    queued: HashSet<AlignmentKey>,
    /// Units handed to the worker
    active: HashSet<AlignmentKey>,
    total_enqueued: u64,
    total_deduped: u64,
}

/// Alignment queue statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlignmentStats {
    pub pending: usize,
    pub active: usize,
    pub max_concurrent: usize,
    pub total_enqueued: u64,
    pub total_deduped: u64,
    pub completed: u64,
    pub failed: u64,
}

/// De-duplicating queue for alignment work
pub struct AlignmentQueue {
    state: Mutex<AlignmentState>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    worker: Arc<dyn AlignmentWorker>,
    notify: Notify,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl AlignmentQueue {
    /// Create a queue running at most `max_concurrent` units at once
    pub fn new(worker: Arc<dyn AlignmentWorker>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            state: Mutex::new(AlignmentState {
                pending: VecDeque::new(),
                queued: HashSet::new(),
                active: HashSet::new(),
                total_enqueued: 0,
                total_deduped: 0,
            }),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            worker,
            notify: Notify::new(),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Add a unit of work.
    ///
    /// Returns `false` without queueing anything if the same unit is already
    /// pending or running.
    pub fn enqueue(&self, key: AlignmentKey) -> bool {
        {
            let mut state = self.state.lock();
            if state.queued.contains(&key) || state.active.contains(&key) {
                state.total_deduped += 1;
                return false;
            }
            state.queued.insert(key.clone());
            state.pending.push_back(key);
            state.total_enqueued += 1;
        }
        self.notify.notify_one();
        true
    }

    /// Drop the de-dupe marker for a unit, allowing it to be enqueued again.
    ///
    /// A unit still waiting is removed from the queue. Returns whether a
    /// marker existed.
    pub fn deactivate(&self, key: &AlignmentKey) -> bool {
        let mut state = self.state.lock();
        let was_queued = state.queued.remove(key);
        if was_queued {
            state.pending.retain(|k| k != key);
        }
        let was_active = state.active.remove(key);
        was_queued || was_active
    }

    /// Whether a unit is pending or running
    pub fn contains(&self, key: &AlignmentKey) -> bool {
        let state = self.state.lock();
        state.queued.contains(key) || state.active.contains(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    /// Start as many pending units as the concurrency cap allows
    pub fn dispatch_ready(self: &Arc<Self>) -> usize {
        let mut started = 0;

        loop {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            let key = {
                let mut state = self.state.lock();
                match state.pending.pop_front() {
                    Some(key) => {
                        state.queued.remove(&key);
                        state.active.insert(key.clone());
                        key
                    }
                    None => break,
                }
            };

            let unit = ActiveUnit {
                queue: Arc::clone(self),
                key: key.clone(),
                permit: Some(permit),
            };
            tokio::spawn(async move {
                let result = unit.queue.worker.align(&key).await;
                let queue = Arc::clone(&unit.queue);
                drop(unit);

                match result {
                    Ok(()) => {
                        tracing::debug!("Aligned chunk {} of job {}", key.index, key.job_key);
                        queue.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Alignment of chunk {} of job {} failed, dropping: {}",
                            key.index,
                            key.job_key,
                            e
                        );
                        queue.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
            started += 1;
        }

        started
    }

    /// Run [`dispatch_ready`](Self::dispatch_ready) whenever work arrives or a
    /// unit finishes
    pub fn spawn_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tracing::info!(
            "Alignment dispatcher started: worker {}, {} concurrent",
            queue.worker.name(),
            queue.max_concurrent
        );
        tokio::spawn(async move {
            loop {
                queue.dispatch_ready();
                queue.notify.notified().await;
            }
        })
    }

    pub fn stats(&self) -> AlignmentStats {
        let state = self.state.lock();
        AlignmentStats {
            pending: state.pending.len(),
            active: state.active.len(),
            max_concurrent: self.max_concurrent,
            total_enqueued: state.total_enqueued,
            total_deduped: state.total_deduped,
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// A running unit. Dropping it, on completion or on a worker panic, clears
/// the de-dupe marker and frees the concurrency slot.
struct ActiveUnit {
    queue: Arc<AlignmentQueue>,
    key: AlignmentKey,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for ActiveUnit {
    fn drop(&mut self) {
        self.queue.state.lock().active.remove(&self.key);
        drop(self.permit.take());
        if std::thread::panicking() {
            tracing::warn!(
                "Alignment worker panicked on chunk {} of job {}",
                self.key.index,
                self.key.job_key
            );
            self.queue.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.queue.notify.notify_one();
    }
}

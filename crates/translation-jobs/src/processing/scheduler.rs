//! Background tick scheduling
//!
//! `enqueue` only raises a [`TickSignal`]; the [`TickScheduler`] turns those
//! signals, plus a periodic sweep of unfinished jobs, into reconcile / tick /
//! reconcile passes. At most one pass runs per job at a time in this process.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::controller::JobController;
use super::executor::{TickExecutor, TickOptions, TickResult};
use super::reconciler::Reconciler;
use crate::error::Result;
use crate::types::JobKey;

/// Set of jobs that asked for a tick
#[derive(Default)]
pub struct TickSignal {
    pending: DashMap<JobKey, ()>,
    notify: Notify,
}

impl TickSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a tick; repeated requests collapse into one
    pub fn raise(&self, key: &JobKey) {
        self.pending.insert(key.clone(), ());
        self.notify.notify_one();
    }

    pub fn is_raised(&self, key: &JobKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Take every raised key
    pub fn drain(&self) -> Vec<JobKey> {
        let mut keys = Vec::new();
        self.pending.retain(|key, _| {
            keys.push(key.clone());
            false
        });
        keys
    }

    /// Wait until a key is raised
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Removes the in-flight marker when a pass ends, however it ends
struct InFlightGuard {
    in_flight: Arc<DashMap<JobKey, ()>>,
    key: JobKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

/// Drives ticks for every unfinished job
pub struct TickScheduler {
    controller: Arc<JobController>,
    executor: Arc<TickExecutor>,
    reconciler: Arc<Reconciler>,
    interval: Duration,
    in_flight: Arc<DashMap<JobKey, ()>>,
}

impl TickScheduler {
    pub fn new(
        controller: Arc<JobController>,
        executor: Arc<TickExecutor>,
        reconciler: Arc<Reconciler>,
        interval: Duration,
    ) -> Self {
        Self {
            controller,
            executor,
            reconciler,
            interval,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Reconcile, tick, reconcile.
    ///
    /// Returns `None` if a pass for this job is already running.
    pub async fn run_job(&self, key: &JobKey) -> Result<Option<TickResult>> {
        if self.in_flight.insert(key.clone(), ()).is_some() {
            tracing::debug!("Job {} already has a pass running", key);
            return Ok(None);
        }
        let _guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            key: key.clone(),
        };

        self.reconciler.reconcile(key).await?;
        let result = self.executor.run_tick(key, TickOptions::default()).await?;
        self.reconciler.reconcile(key).await?;

        // More to claim right away: don't wait for the next sweep
        if result.started > 0 && result.remaining_queue > 0 {
            self.controller.signal().raise(key);
        }
        Ok(Some(result))
    }

    /// Number of passes currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Start the scheduling loop
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tracing::info!(
            "Tick scheduler started (sweep every {}s)",
            self.interval.as_secs()
        );

        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(self.interval);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let signal = Arc::clone(self.controller.signal());

            loop {
                let keys = tokio::select! {
                    _ = sweep.tick() => match self.controller.store().list_unfinished().await {
                        Ok(keys) => keys,
                        Err(e) => {
                            tracing::error!("Failed to list unfinished jobs: {}", e);
                            continue;
                        }
                    },
                    _ = signal.wait() => signal.drain(),
                };

                for key in keys {
                    let scheduler = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = scheduler.run_job(&key).await {
                            tracing::warn!("Pass over job {} failed: {}", key, e);
                        }
                    });
                }
            }
        })
    }
}

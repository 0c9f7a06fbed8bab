//! Application state for the job server

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::{JobsConfig, StorageBackend};
use crate::error::{Error, Result};
use crate::processing::{AlignmentQueue, JobController, Reconciler, TickExecutor, TickScheduler};
use crate::providers::{AlignmentWorker, ChunkWorker, HttpAlignmentWorker, HttpChunkWorker};
use crate::storage::{JobStore, MemoryJobStore, SqliteJobStore};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Configuration
    config: JobsConfig,
    /// Job controller over the configured store
    controller: Arc<JobController>,
    /// Tick executor with the translation worker
    executor: Arc<TickExecutor>,
    /// Stuck-state watchdog
    reconciler: Arc<Reconciler>,
    /// Alignment queue (only when enabled)
    alignment: Option<Arc<AlignmentQueue>>,
    /// Background tick scheduler
    scheduler: Arc<TickScheduler>,
}

impl AppState {
    /// Create application state from configuration
    pub fn new(config: JobsConfig) -> Result<Self> {
        tracing::info!(
            "Initializing job service state (storage: {:?})...",
            config.storage.backend
        );

        let store: Arc<dyn JobStore> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryJobStore::new()),
            StorageBackend::Sqlite => {
                tracing::info!("Opening job database at {}", config.storage.path.display());
                Arc::new(SqliteJobStore::new(&config.storage.path)?)
            }
        };

        let worker: Arc<dyn ChunkWorker> = Arc::new(HttpChunkWorker::new(&config.worker)?);
        tracing::info!(
            "Translation worker: {} (timeout {}s)",
            config.worker.endpoint,
            config.worker.timeout_secs
        );

        let aligner: Option<Arc<dyn AlignmentWorker>> = if config.alignment.enabled {
            tracing::info!("Alignment worker: {}", config.alignment.endpoint);
            Some(Arc::new(HttpAlignmentWorker::new(
                &config.alignment,
                config.worker.timeout(),
            )?))
        } else {
            None
        };

        Ok(Self::with_components(config, store, worker, aligner))
    }

    /// Assemble state from explicit components
    pub fn with_components(
        config: JobsConfig,
        store: Arc<dyn JobStore>,
        worker: Arc<dyn ChunkWorker>,
        aligner: Option<Arc<dyn AlignmentWorker>>,
    ) -> Self {
        let controller = Arc::new(JobController::new(store, &config));

        let alignment = aligner
            .map(|worker| Arc::new(AlignmentQueue::new(worker, config.alignment.max_concurrent)));

        let mut executor = TickExecutor::new(Arc::clone(&controller), worker, &config);
        if let Some(queue) = &alignment {
            executor = executor.with_alignment(Arc::clone(queue));
        }
        let executor = Arc::new(executor);

        let reconciler = Arc::new(Reconciler::new(Arc::clone(&controller), &config.reconcile));
        let scheduler = Arc::new(TickScheduler::new(
            Arc::clone(&controller),
            Arc::clone(&executor),
            Arc::clone(&reconciler),
            std::time::Duration::from_secs(config.scheduler.tick_interval_secs.max(1)),
        ));

        Self {
            inner: Arc::new(AppStateInner {
                config,
                controller,
                executor,
                reconciler,
                alignment,
                scheduler,
            }),
        }
    }

    /// Start the tick scheduler and the alignment dispatcher
    pub fn start_background(&self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![Arc::clone(&self.inner.scheduler).spawn()];
        if let Some(queue) = &self.inner.alignment {
            handles.push(queue.spawn_dispatcher());
        }
        handles
    }

    /// Get configuration
    pub fn config(&self) -> &JobsConfig {
        &self.inner.config
    }

    pub fn controller(&self) -> &Arc<JobController> {
        &self.inner.controller
    }

    pub fn executor(&self) -> &Arc<TickExecutor> {
        &self.inner.executor
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.inner.reconciler
    }

    pub fn scheduler(&self) -> &Arc<TickScheduler> {
        &self.inner.scheduler
    }

    /// Alignment queue, or an error when it is disabled
    pub fn alignment(&self) -> Result<&Arc<AlignmentQueue>> {
        self.inner
            .alignment
            .as_ref()
            .ok_or_else(|| Error::Config("alignment queue is disabled".to_string()))
    }
}

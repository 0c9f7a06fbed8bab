//! Configuration for the translation job pipeline

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable naming a TOML config file
pub const CONFIG_ENV_VAR: &str = "TRANSLATION_JOBS_CONFIG";

/// Main pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobsConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Chunking configuration
    #[serde(default)]
    pub chunking: ChunkingConfig,
    /// Tick scheduling and concurrency caps
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Retry policy for failed chunks
    #[serde(default)]
    pub retry: RetryConfig,
    /// Reconciler thresholds
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// Translation worker endpoint
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Alignment (secondary) queue
    #[serde(default)]
    pub alignment: AlignmentConfig,
    /// Job state storage
    #[serde(default)]
    pub storage: StorageConfig,
}

impl JobsConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: JobsConfig = toml::from_str(&raw).map_err(|e| {
            Error::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the file named by `TRANSLATION_JOBS_CONFIG`, or defaults
    pub fn load() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => {
                tracing::info!("Loading configuration from {}", PathBuf::from(&path).display());
                Self::from_file(path)
            }
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Reject configurations the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        let c = &self.chunking;
        if c.min_lines == 0 || c.target_lines == 0 || c.max_lines == 0 {
            return Err(Error::Config("chunk line bounds must be positive".to_string()));
        }
        if !(c.min_lines <= c.target_lines && c.target_lines <= c.max_lines) {
            return Err(Error::Config(format!(
                "chunk bounds must satisfy min <= target <= max (got {} / {} / {})",
                c.min_lines, c.target_lines, c.max_lines
            )));
        }
        if self.scheduler.max_concurrent == 0 || self.scheduler.max_chunks_per_tick == 0 {
            return Err(Error::Config("scheduler caps must be positive".to_string()));
        }
        if self.scheduler.max_cas_retries == 0 {
            return Err(Error::Config("max_cas_retries must be positive".to_string()));
        }
        if self.retry.base_delay_ms == 0 || self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(Error::Config(
                "retry delays must satisfy 0 < base_delay_ms <= max_delay_ms".to_string(),
            ));
        }
        if self.alignment.max_concurrent == 0 {
            return Err(Error::Config("alignment.max_concurrent must be positive".to_string()));
        }
        if self.reconcile.stale_after_secs <= self.worker.timeout_secs {
            tracing::warn!(
                "reconcile.stale_after_secs ({}) does not exceed worker.timeout_secs ({}); \
                 slow chunks may be reclaimed while still running",
                self.reconcile.stale_after_secs,
                self.worker.timeout_secs
            );
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Enable CORS
    pub enable_cors: bool,
    /// Maximum request body size in bytes (default: 10MB)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            enable_cors: true,
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Line-based chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Preferred number of lines per chunk
    pub target_lines: usize,
    /// Soft minimum; shorter trailing chunks are merged backwards
    pub min_lines: usize,
    /// Hard maximum
    pub max_lines: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_lines: 4,
            min_lines: 2,
            max_lines: 6,
        }
    }
}

/// Tick scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Default cap on chunks processed simultaneously per job
    pub max_concurrent: usize,
    /// Default cap on chunks started by one tick
    pub max_chunks_per_tick: usize,
    /// Wall-clock budget of one tick in milliseconds
    pub tick_budget_ms: u64,
    /// Interval of the background tick sweep in seconds
    pub tick_interval_secs: u64,
    /// How many times a conflicting read-modify-write is retried
    pub max_cas_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_chunks_per_tick: 6,
            tick_budget_ms: 25_000,
            tick_interval_secs: 5,
            max_cas_retries: 16,
        }
    }
}

impl SchedulerConfig {
    /// Tick budget as a duration
    pub fn tick_budget(&self) -> Duration {
        Duration::from_millis(self.tick_budget_ms)
    }
}

/// Retry policy for failed chunks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries allowed before a chunk is marked failed
    pub max_retries: u32,
    /// Base delay of the exponential backoff (milliseconds)
    pub base_delay_ms: u64,
    /// Backoff cap (milliseconds)
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
        }
    }
}

/// Reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// An active chunk older than this is treated as a lost dispatch
    pub stale_after_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 600, // 10 minutes, well above the worker timeout
        }
    }
}

/// Translation worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Endpoint receiving chunk tasks as JSON
    pub endpoint: String,
    /// Per-dispatch timeout in seconds
    pub timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9090/translate".to_string(),
            timeout_secs: 120,
        }
    }
}

impl WorkerConfig {
    /// Worker timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Alignment queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentConfig {
    /// Enqueue alignment work for every completed chunk
    pub enabled: bool,
    /// Endpoint receiving alignment units as JSON
    pub endpoint: String,
    /// Concurrency cap, independent of the primary pipeline
    pub max_concurrent: usize,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:9090/align".to_string(),
            max_concurrent: 1,
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local map, lost on restart
    Memory,
    /// SQLite file
    #[default]
    Sqlite,
}

/// Job state storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend to use
    #[serde(default)]
    pub backend: StorageBackend,
    /// SQLite database path
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let path = dirs::data_local_dir()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")))
            .join("translation-jobs")
            .join("jobs.db");

        Self {
            backend: StorageBackend::Sqlite,
            path,
        }
    }
}

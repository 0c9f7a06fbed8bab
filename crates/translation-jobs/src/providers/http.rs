//! HTTP workers posting JSON to remote translation and alignment services

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use crate::config::{AlignmentConfig, WorkerConfig};
use crate::error::{Error, Result};
use crate::processing::AlignmentKey;

use super::worker::{AlignmentWorker, ChunkOutput, ChunkTask, WorkerError};

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(5)
        .build()
        .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))
}

/// Map a non-success response to a worker error carrying the body
async fn error_from_response(response: reqwest::Response) -> WorkerError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    WorkerError::with_details(format!("worker returned HTTP {}", status), body)
}

/// Chunk worker backed by a remote translation endpoint
///
/// POSTs the [`ChunkTask`] as JSON and expects a [`ChunkOutput`] back.
pub struct HttpChunkWorker {
    client: Client,
    endpoint: String,
}

impl HttpChunkWorker {
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.timeout())?,
            endpoint: config.endpoint.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl super::ChunkWorker for HttpChunkWorker {
    async fn process(&self, task: ChunkTask) -> std::result::Result<ChunkOutput, WorkerError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&task)
            .send()
            .await
            .map_err(|e| WorkerError::new(format!("request to {} failed: {}", self.endpoint, e)))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        response
            .json::<ChunkOutput>()
            .await
            .map_err(|e| WorkerError::new(format!("invalid worker response: {}", e)))
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Alignment worker backed by a remote endpoint
pub struct HttpAlignmentWorker {
    client: Client,
    endpoint: String,
}

impl HttpAlignmentWorker {
    pub fn new(config: &AlignmentConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: config.endpoint.clone(),
        })
    }
}

#[async_trait]
impl AlignmentWorker for HttpAlignmentWorker {
    async fn align(&self, key: &AlignmentKey) -> std::result::Result<(), WorkerError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(key)
            .send()
            .await
            .map_err(|e| WorkerError::new(format!("request to {} failed: {}", self.endpoint, e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_from_response(response).await)
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}

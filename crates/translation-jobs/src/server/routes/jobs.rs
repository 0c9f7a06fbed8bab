//! Job lifecycle, tick and progress endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::processing::{
    CreateJobOptions, ProgressSummary, RepairReport, RequeueOptions, TickOptions, TickResult,
};
use crate::server::state::AppState;
use crate::types::{JobKey, JobOptions, JobStatus};

/// Request to create a job
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub key: String,
    pub text: String,
    #[serde(default)]
    pub replace: bool,
    #[serde(default)]
    pub options: Option<JobOptionsRequest>,
}

/// Per-job overrides of the configured scheduling options
#[derive(Debug, Default, Deserialize)]
pub struct JobOptionsRequest {
    pub max_concurrent: Option<usize>,
    pub max_chunks_per_tick: Option<usize>,
    pub max_retries: Option<u32>,
    pub fail_on_chunk_failure: Option<bool>,
}

impl JobOptionsRequest {
    fn apply(&self, defaults: &JobOptions) -> JobOptions {
        JobOptions {
            max_concurrent: self.max_concurrent.unwrap_or(defaults.max_concurrent),
            max_chunks_per_tick: self
                .max_chunks_per_tick
                .unwrap_or(defaults.max_chunks_per_tick),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            fail_on_chunk_failure: self
                .fail_on_chunk_failure
                .unwrap_or(defaults.fail_on_chunk_failure),
        }
    }
}

/// Response from job creation
#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_key: JobKey,
    pub chunks: usize,
    pub total_lines: usize,
    pub status: JobStatus,
    pub message: String,
}

/// Manual requeue options
#[derive(Debug, Default, Deserialize)]
pub struct RequeueRequest {
    #[serde(default)]
    pub clear_lines: bool,
}

/// POST /api/jobs - Chunk a document and create its job
pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>)> {
    if request.key.trim().is_empty() {
        return Err(Error::invalid_input("job key must not be empty"));
    }

    let controller = state.controller();
    let key = JobKey::new(request.key);
    let options = CreateJobOptions {
        replace: request.replace,
        job: request
            .options
            .as_ref()
            .map(|o| o.apply(controller.default_options())),
    };

    let job = controller.create_job(&key, &request.text, options).await?;
    controller.enqueue(&key).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            chunks: job.chunks.len(),
            total_lines: job.total_lines,
            status: job.status,
            message: format!("Job created. Use /api/jobs/{} to check progress.", key),
            job_key: key,
        }),
    ))
}

/// GET /api/jobs - Progress of every job
pub async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<ProgressSummary>>> {
    Ok(Json(state.controller().list_jobs().await?))
}

/// GET /api/jobs/:key - Progress snapshot
pub async fn get_job(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ProgressSummary>> {
    Ok(Json(state.controller().get_summary(&JobKey::new(key)).await?))
}

/// DELETE /api/jobs/:key
pub async fn delete_job(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<StatusCode> {
    state.controller().delete_job(&JobKey::new(key)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/jobs/:key/enqueue - Ask for a tick
pub async fn enqueue_job(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<StatusCode> {
    state.controller().enqueue(&JobKey::new(key)).await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /api/jobs/:key/tick - Run one tick now
pub async fn run_tick(
    State(state): State<AppState>,
    Path(key): Path<String>,
    options: Option<Json<TickOptions>>,
) -> Result<Json<TickResult>> {
    let options = options.map(|Json(o)| o).unwrap_or_default();
    let result = state
        .executor()
        .run_tick(&JobKey::new(key), options)
        .await?;
    Ok(Json(result))
}

/// POST /api/jobs/:key/reconcile - Run one repair pass
pub async fn reconcile_job(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<RepairReport>> {
    Ok(Json(state.reconciler().reconcile(&JobKey::new(key)).await?))
}

/// POST /api/jobs/:key/chunks/:index/requeue - Operator recovery
pub async fn requeue_chunk(
    State(state): State<AppState>,
    Path((key, index)): Path<(String, u32)>,
    request: Option<Json<RequeueRequest>>,
) -> Result<Json<ProgressSummary>> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let key = JobKey::new(key);
    let controller = state.controller();

    controller
        .requeue_chunk(
            &key,
            index,
            RequeueOptions {
                clear_lines: request.clear_lines,
            },
        )
        .await?;
    Ok(Json(controller.get_summary(&key).await?))
}

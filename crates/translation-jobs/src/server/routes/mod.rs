//! API routes for the job server

pub mod alignment;
pub mod jobs;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use crate::server::state::AppState;

/// Build all API routes
pub fn api_routes(max_body_size: usize) -> Router<AppState> {
    Router::new()
        // Jobs
        .route(
            "/jobs",
            post(jobs::create_job).layer(DefaultBodyLimit::max(max_body_size)),
        )
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/:key", get(jobs::get_job))
        .route("/jobs/:key", delete(jobs::delete_job))
        // Scheduling and recovery
        .route("/jobs/:key/enqueue", post(jobs::enqueue_job))
        .route("/jobs/:key/tick", post(jobs::run_tick))
        .route("/jobs/:key/reconcile", post(jobs::reconcile_job))
        .route("/jobs/:key/chunks/:index/requeue", post(jobs::requeue_chunk))
        // Alignment queue
        .route("/alignment", post(alignment::enqueue))
        .route("/alignment", get(alignment::stats))
        .route("/alignment/:key/:index", delete(alignment::deactivate))
        // Info
        .route("/info", get(info))
}

/// API info endpoint
async fn info() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "name": "translation-jobs",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Chunked background translation jobs with retries and stuck-state repair",
        "endpoints": {
            "POST /api/jobs": "Chunk a document and create its job",
            "GET /api/jobs": "Progress of every job",
            "GET /api/jobs/:key": "Progress snapshot of one job",
            "DELETE /api/jobs/:key": "Delete a job",
            "POST /api/jobs/:key/enqueue": "Ask the scheduler for a tick",
            "POST /api/jobs/:key/tick": "Run one tick now",
            "POST /api/jobs/:key/reconcile": "Repair stuck state",
            "POST /api/jobs/:key/chunks/:index/requeue": "Requeue a chunk",
            "POST /api/alignment": "Enqueue alignment work",
            "DELETE /api/alignment/:key/:index": "Release an alignment unit",
            "GET /api/alignment": "Alignment queue statistics"
        }
    }))
}

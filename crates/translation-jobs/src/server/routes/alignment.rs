//! Alignment queue endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};

use crate::error::Result;
use crate::processing::{AlignmentKey, AlignmentStats};
use crate::server::state::AppState;
use crate::types::JobKey;

/// POST /api/alignment - Enqueue one unit (no-op if already queued)
pub async fn enqueue(
    State(state): State<AppState>,
    Json(key): Json<AlignmentKey>,
) -> Result<Json<Value>> {
    let queued = state.alignment()?.enqueue(key);
    Ok(Json(json!({ "queued": queued })))
}

/// DELETE /api/alignment/:key/:index - Drop the de-dupe marker
pub async fn deactivate(
    State(state): State<AppState>,
    Path((key, index)): Path<(String, u32)>,
) -> Result<Json<Value>> {
    let removed = state
        .alignment()?
        .deactivate(&AlignmentKey::new(JobKey::new(key), index));
    Ok(Json(json!({ "removed": removed })))
}

/// GET /api/alignment - Queue statistics
pub async fn stats(State(state): State<AppState>) -> Result<Json<AlignmentStats>> {
    Ok(Json(state.alignment()?.stats()))
}

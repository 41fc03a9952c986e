//! Work claiming for agents when no broker is deployed.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use stagehand_core::pipeline::Platform;
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Hand the oldest queued job for a platform to the calling agent, or
/// answer `204 No Content` when there is none.
pub async fn claim_job(
    State(state): State<Arc<AppState>>,
    Path(platform): Path<Platform>,
) -> ApiResult<Response> {
    let queue = state.queue.as_ref().ok_or_else(|| {
        ApiError::NotFound("Jobs are dispatched over NATS in this deployment".to_string())
    })?;

    Ok(match queue.claim(platform) {
        Some(request) => Json(request).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

//! Job instance handlers, including the HTTP channel for agent reports.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use stagehand_core::ids::JobInstanceId;
use stagehand_core::instance::{JobInstance, JobState};
use std::sync::Arc;

use crate::error::{ApiResult, parse_id};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StateReportRequest {
    pub state: JobState,
    /// Agent-side timestamp in epoch millis; defaults to receipt time.
    pub epoch: Option<i64>,
    pub message: Option<String>,
}

pub async fn get_job_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobInstance>> {
    let job_id: JobInstanceId = parse_id(&id, "job instance")?;
    Ok(Json(state.scheduler.store().job_instance(job_id).await?))
}

/// Accept a state report. Stale and duplicate reports are accepted too;
/// they just change nothing.
pub async fn report_state(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(report): Json<StateReportRequest>,
) -> ApiResult<StatusCode> {
    let job_id: JobInstanceId = parse_id(&id, "job instance")?;
    let epoch = report
        .epoch
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

    state
        .scheduler
        .report_state(job_id, report.state, epoch, report.message)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

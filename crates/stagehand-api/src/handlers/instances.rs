//! Pipeline instance handlers: trigger, inspect, approve, cancel.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagehand_core::ids::{PipelineId, PipelineInstanceId, StageId};
use stagehand_core::instance::{JobInstance, PipelineInstance, PipelineInstanceState};
use stagehand_scheduler::StageView;
use std::sync::Arc;

use crate::error::{ApiResult, parse_id};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct InstanceSummary {
    pub id: PipelineInstanceId,
    pub pipeline_id: PipelineId,
    pub run_number: u64,
    pub state: PipelineInstanceState,
    pub triggered_by: Option<String>,
    pub cancelled_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&PipelineInstance> for InstanceSummary {
    fn from(i: &PipelineInstance) -> Self {
        Self {
            id: i.id,
            pipeline_id: i.pipeline_id,
            run_number: i.run_number,
            state: i.state,
            triggered_by: i.triggered_by.clone(),
            cancelled_by: i.cancelled_by.clone(),
            created_at: i.created_at,
            completed_at: i.completed_at,
        }
    }
}

/// Instance plus the derived status of each stage.
#[derive(Debug, Serialize)]
pub struct InstanceDetail {
    #[serde(flatten)]
    pub instance: InstanceSummary,
    pub stages: Vec<StageView>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    pub triggered_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub approver_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub actor: Option<String>,
}

pub async fn list_instances(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<InstanceSummary>>> {
    let pipeline_id: PipelineId = parse_id(&id, "pipeline")?;
    state.scheduler.catalog().get(pipeline_id).await?;

    let instances = state
        .scheduler
        .store()
        .list_instances(Some(pipeline_id))
        .await;
    Ok(Json(instances.iter().map(InstanceSummary::from).collect()))
}

pub async fn start_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<StartRequest>>,
) -> ApiResult<(StatusCode, Json<PipelineInstance>)> {
    let pipeline_id: PipelineId = parse_id(&id, "pipeline")?;
    let Json(request) = body.unwrap_or_default();

    let instance = state
        .scheduler
        .start(pipeline_id, request.triggered_by)
        .await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

pub async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<InstanceDetail>> {
    let instance_id: PipelineInstanceId = parse_id(&id, "pipeline instance")?;
    let instance = state.scheduler.store().instance(instance_id).await?;
    let stages = state.scheduler.stage_statuses(instance_id).await?;

    Ok(Json(InstanceDetail {
        instance: InstanceSummary::from(&instance),
        stages,
    }))
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<JobInstance>>> {
    let instance_id: PipelineInstanceId = parse_id(&id, "pipeline instance")?;
    Ok(Json(state.scheduler.instance_jobs(instance_id).await?))
}

pub async fn approve_stage(
    State(state): State<Arc<AppState>>,
    Path((pipeline_id, instance_id, stage_id)): Path<(String, String, String)>,
    Json(request): Json<ApproveRequest>,
) -> ApiResult<Json<PipelineInstance>> {
    let pipeline_id: PipelineId = parse_id(&pipeline_id, "pipeline")?;
    let instance_id: PipelineInstanceId = parse_id(&instance_id, "pipeline instance")?;
    let stage_id = StageId::new(stage_id);

    let instance = state
        .scheduler
        .approve(pipeline_id, instance_id, &stage_id, &request.approver_id)
        .await?;
    Ok(Json(instance))
}

pub async fn cancel_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> ApiResult<Json<PipelineInstance>> {
    let instance_id: PipelineInstanceId = parse_id(&id, "pipeline instance")?;
    let Json(request) = body.unwrap_or_default();

    Ok(Json(state.scheduler.cancel(instance_id, request.actor).await?))
}

//! Pipeline definition handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use stagehand_core::ids::PipelineId;
use stagehand_core::pipeline::{Pipeline, PipelineDefinition};
use std::sync::Arc;

use crate::error::{ApiResult, parse_id};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct PipelineSummary {
    pub id: PipelineId,
    pub label: String,
    pub description: Option<String>,
    pub revision: u64,
    pub stages: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Pipeline> for PipelineSummary {
    fn from(p: &Pipeline) -> Self {
        Self {
            id: p.id,
            label: p.label.clone(),
            description: p.definition.description.clone(),
            revision: p.revision,
            stages: p.definition.stages.len(),
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

pub async fn list_pipelines(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<PipelineSummary>>> {
    let pipelines = state.scheduler.catalog().list().await?;
    Ok(Json(pipelines.iter().map(PipelineSummary::from).collect()))
}

/// Create a pipeline, or replace it when the body carries a known id.
pub async fn save_pipeline(
    State(state): State<Arc<AppState>>,
    Json(definition): Json<PipelineDefinition>,
) -> ApiResult<(StatusCode, Json<Pipeline>)> {
    let pipeline = state.scheduler.catalog().save(definition).await?;
    let status = if pipeline.revision == 1 {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(pipeline)))
}

pub async fn replace_pipeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut definition): Json<PipelineDefinition>,
) -> ApiResult<Json<Pipeline>> {
    let pipeline_id: PipelineId = parse_id(&id, "pipeline")?;
    state.scheduler.catalog().get(pipeline_id).await?;

    definition.id = pipeline_id;
    Ok(Json(state.scheduler.catalog().save(definition).await?))
}

pub async fn get_pipeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Pipeline>> {
    let pipeline_id: PipelineId = parse_id(&id, "pipeline")?;
    Ok(Json(state.scheduler.catalog().get(pipeline_id).await?))
}

pub async fn delete_pipeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let pipeline_id: PipelineId = parse_id(&id, "pipeline")?;
    state.scheduler.catalog().delete(pipeline_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

use axum::Json;
use schemars::schema::RootSchema;
use schemars::schema_for;
use stagehand_core::pipeline::PipelineDefinition;

/// JSON Schema of a pipeline definition, for editors and validation.
pub async fn pipeline_schema() -> Json<RootSchema> {
    Json(schema_for!(PipelineDefinition))
}

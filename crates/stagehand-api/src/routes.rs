//! API route definitions.

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers::{agents, health, instances, jobs, pipelines, schema};
use crate::middleware::{cors_layer, request_id};
use crate::state::AppState;
use crate::ws;

/// Routes without cross-cutting layers.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/v1", api_routes())
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// The full application: routes plus tracing, CORS and request ids.
pub fn build_app(state: Arc<AppState>) -> Router {
    create_router(state)
        .layer(axum_middleware::from_fn(request_id))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/pipelines", pipeline_routes())
        .nest("/instances", instance_routes())
        .route("/job-instances/{id}", get(jobs::get_job_instance))
        .route("/job-instances/{id}/state", post(jobs::report_state))
        .route("/agents/{platform}/claim", post(agents::claim_job))
        .route("/schema/pipeline", get(schema::pipeline_schema))
}

fn pipeline_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/",
            get(pipelines::list_pipelines).post(pipelines::save_pipeline),
        )
        .route(
            "/{id}",
            get(pipelines::get_pipeline)
                .put(pipelines::replace_pipeline)
                .delete(pipelines::delete_pipeline),
        )
        .route(
            "/{id}/instances",
            get(instances::list_instances).post(instances::start_instance),
        )
        .route(
            "/{id}/instances/{instance_id}/stages/{stage_id}/approve",
            post(instances::approve_stage),
        )
}

fn instance_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/{id}", get(instances::get_instance))
        .route("/{id}/jobs", get(instances::list_jobs))
        .route("/{id}/cancel", post(instances::cancel_instance))
}

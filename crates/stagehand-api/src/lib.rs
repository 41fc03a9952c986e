//! HTTP/WebSocket control surface for Stagehand.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod queue;
pub mod routes;
pub mod state;
pub mod telemetry;
pub mod ws;

pub use config::ServerConfig;
pub use error::{ApiError, ApiResult};
pub use queue::QueueDispatch;
pub use routes::{build_app, create_router};
pub use state::AppState;

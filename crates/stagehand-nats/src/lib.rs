//! NATS adapters for Stagehand.
//!
//! One [`NatsConnection`] is shared by three adapters: the live event bus,
//! agent dispatch over request/reply, and the listener for agent state
//! reports.

pub mod bus;
pub mod config;
mod connection;
pub mod dispatch;
pub mod health;
pub mod metrics;
pub mod reports;
pub mod subjects;

pub use bus::NatsEventBus;
pub use config::NatsConfig;
pub use connection::NatsConnection;
pub use dispatch::NatsAgentDispatch;
pub use health::{HealthCheck, HealthStatus};
pub use metrics::{MetricsSnapshot, NatsMetrics};
pub use reports::{NatsReportListener, ReportStream};
pub use subjects::Subjects;

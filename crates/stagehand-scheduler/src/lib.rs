//! Pipeline orchestration engine for Stagehand.
//!
//! The scheduler reacts to trigger, approval and job-outcome events. It never
//! blocks on job execution: dispatch is handed to agents and progress resumes
//! when their state reports arrive.

pub mod approval;
pub mod bus;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod graph;
pub mod scheduler;
pub mod sources;
pub mod store;
pub mod watchdog;

pub use approval::{ApprovalError, ApprovalGateManager};
pub use bus::InMemoryEventBus;
pub use catalog::{InMemoryPipelineRepository, PipelineCatalog};
pub use config::{DispatchConfig, SchedulerConfig, WatchdogConfig};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use graph::{GraphError, StageGraph, StageJobs};
pub use scheduler::{Scheduler, StageView};
pub use sources::GitSourceResolver;
pub use store::{InstanceStateStore, JobUpdate, Registration, UpdateOutcome};
pub use watchdog::Watchdog;

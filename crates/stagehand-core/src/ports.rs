//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the orchestration engine and
//! its external collaborators: execution agents, source checkout, the live
//! event transport, and definition storage.

use crate::Result;
use crate::events::{Entity, LiveEvent};
use crate::ids::*;
use crate::instance::{JobInstance, JobState};
use crate::pipeline::{JobDefinition, Pipeline, PipelineDefinition, SourceDefinition};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Stream of live events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<LiveEvent>> + Send>>;

/// Fan-out of live deltas to subscribers.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event. Delivery is best-effort.
    async fn publish(&self, event: LiveEvent) -> Result<()>;

    /// Subscribe to the given entity streams. Dropping the stream ends the
    /// subscription.
    async fn subscribe(&self, entities: &[Entity]) -> Result<EventStream>;
}

/// Everything an agent needs to run one job instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub job_instance: JobInstance,
    pub job: JobDefinition,
    pub sources: Vec<ResolvedSource>,
}

/// Agent acknowledgement of a dispatch request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub accepted: bool,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Ack {
    pub fn accepted(agent: impl Into<String>) -> Self {
        Self {
            accepted: true,
            agent: Some(agent.into()),
            message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            agent: None,
            message: Some(message.into()),
        }
    }
}

/// Hands job instances to remote execution agents.
#[async_trait]
pub trait AgentDispatch: Send + Sync {
    /// Submit a job instance. Returns once the agent acknowledged receipt.
    async fn dispatch(&self, request: &DispatchRequest) -> Result<Ack>;

    /// Best-effort cancellation of an in-flight job instance.
    async fn cancel(&self, job_instance_id: JobInstanceId) -> Result<()>;
}

/// A source checked out and ready for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSource {
    pub url: String,
    pub path: String,
    #[serde(default)]
    pub revision: Option<String>,
}

/// Resolves a pipeline's configured sources before dispatch.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(
        &self,
        instance_id: PipelineInstanceId,
        sources: &[SourceDefinition],
    ) -> Result<Vec<ResolvedSource>>;
}

/// State report sent back by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateReport {
    pub job_instance_id: JobInstanceId,
    pub state: JobState,
    pub epoch: i64,
    #[serde(default)]
    pub message: Option<String>,
}

/// Storage for pipeline definitions.
#[async_trait]
pub trait PipelineRepository: Send + Sync {
    /// Store a new pipeline.
    async fn create(&self, definition: &PipelineDefinition) -> Result<Pipeline>;

    /// Get a pipeline by ID.
    async fn get(&self, id: PipelineId) -> Result<Option<Pipeline>>;

    /// List all pipelines.
    async fn list(&self) -> Result<Vec<Pipeline>>;

    /// Replace a pipeline's definition, bumping its revision.
    async fn update(&self, definition: &PipelineDefinition) -> Result<Pipeline>;

    /// Delete a pipeline, returning the removed record.
    async fn delete(&self, id: PipelineId) -> Result<Option<Pipeline>>;
}

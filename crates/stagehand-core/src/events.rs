//! Live event envelope pushed to connected clients.
//!
//! Every state mutation is published as a `{ entity, action, result }` delta.
//! Clients pull a snapshot when they connect; the bus carries no history.

use crate::Result;
use crate::instance::{JobInstance, PipelineInstance};
use crate::pipeline::Pipeline;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity stream an event belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Pipeline,
    PipelineInstance,
    JobInstance,
}

impl Entity {
    pub const ALL: [Entity; 3] = [Entity::Pipeline, Entity::PipelineInstance, Entity::JobInstance];

    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Pipeline => "pipeline",
            Entity::PipelineInstance => "pipeline_instance",
            Entity::JobInstance => "job_instance",
        }
    }

    /// Socket channel name, e.g. `live:job_instance`.
    pub fn channel(&self) -> &'static str {
        match self {
            Entity::Pipeline => "live:pipeline",
            Entity::PipelineInstance => "live:pipeline_instance",
            Entity::JobInstance => "live:job_instance",
        }
    }

    pub fn from_channel(channel: &str) -> Option<Entity> {
        Entity::ALL.into_iter().find(|e| e.channel() == channel)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "CREATE",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LiveEvent {
    pub entity: Entity,
    pub action: Action,
    pub result: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
}

impl LiveEvent {
    pub fn new<T: Serialize>(entity: Entity, action: Action, result: &T) -> Result<Self> {
        Ok(Self {
            entity,
            action,
            result: serde_json::to_value(result)?,
            emitted_at: Utc::now(),
        })
    }

    pub fn pipeline(action: Action, pipeline: &Pipeline) -> Result<Self> {
        Self::new(Entity::Pipeline, action, pipeline)
    }

    pub fn pipeline_instance(action: Action, instance: &PipelineInstance) -> Result<Self> {
        Self::new(Entity::PipelineInstance, action, instance)
    }

    pub fn job_instance(action: Action, job: &JobInstance) -> Result<Self> {
        Self::new(Entity::JobInstance, action, job)
    }

    pub fn channel(&self) -> &'static str {
        self.entity.channel()
    }

    /// Subject suffix used by message brokers, e.g. `job_instance.update`.
    pub fn subject(&self) -> String {
        format!(
            "{}.{}",
            self.entity.as_str(),
            self.action.as_str().to_lowercase()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{JobId, PipelineId, PipelineInstanceId, StageId};

    #[test]
    fn test_job_instance_event_shape() {
        let job = JobInstance::new(
            PipelineId::new(),
            PipelineInstanceId::new(),
            StageId::new("build"),
            JobId::new("compile"),
        );
        let event = LiveEvent::job_instance(Action::Update, &job).unwrap();

        assert_eq!(event.channel(), "live:job_instance");
        assert_eq!(event.subject(), "job_instance.update");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["action"], "UPDATE");
        assert_eq!(json["entity"], "job_instance");
        assert_eq!(json["result"]["state"], "pending");
    }

    #[test]
    fn test_entity_from_channel() {
        assert_eq!(
            Entity::from_channel("live:pipeline_instance"),
            Some(Entity::PipelineInstance)
        );
        assert_eq!(Entity::from_channel("live:unknown"), None);
    }
}

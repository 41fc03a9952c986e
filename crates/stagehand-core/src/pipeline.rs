//! Pipeline definition types.
//!
//! These types represent the user-authored pipeline template. A definition is
//! mutable through the catalog; every triggered run freezes a copy of it.

use crate::Result;
use crate::ids::{JobId, PipelineId, StageId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineDefinition {
    #[serde(default)]
    pub id: PipelineId,
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
    pub stages: Vec<StageDefinition>,
    #[serde(default)]
    pub sources: Vec<SourceDefinition>,
}

impl PipelineDefinition {
    /// Parse a definition from YAML.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn stage(&self, id: &StageId) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| &s.id == id)
    }

    /// Stages sorted by ascending `order`, ties broken by id.
    pub fn stages_in_order(&self) -> Vec<&StageDefinition> {
        let mut stages: Vec<_> = self.stages.iter().collect();
        stages.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        stages
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StageDefinition {
    pub id: StageId,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
    /// Predecessor stages. A stage with no triggers is a root.
    #[serde(default)]
    pub stage_trigger: BTreeSet<StageId>,
    #[serde(default)]
    pub required_approvals: u32,
    #[serde(default)]
    pub webhooks: Vec<WebhookDefinition>,
}

impl StageDefinition {
    pub fn requires_approval(&self) -> bool {
        self.required_approvals > 0
    }

    pub fn is_root(&self) -> bool {
        self.stage_trigger.is_empty()
    }

    /// Jobs sorted by ascending `order`.
    pub fn jobs_in_order(&self) -> Vec<&JobDefinition> {
        let mut jobs: Vec<_> = self.jobs.iter().collect();
        jobs.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        jobs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobDefinition {
    pub id: JobId,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub task_groups: Vec<TaskGroupDefinition>,
    #[serde(default)]
    pub platform: Platform,
}

/// Execution backend a job is dispatched to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    #[default]
    Docker,
    Kubernetes,
    Shell,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Docker => "docker",
            Platform::Kubernetes => "kubernetes",
            Platform::Shell => "shell",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskGroupDefinition {
    pub id: String,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskDefinition {
    pub id: String,
    #[serde(default)]
    pub order: u32,
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

/// A source checked out before a job runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceDefinition {
    Git(GitSource),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GitSource {
    pub url: String,
    pub target_path: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub depth: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WebhookDefinition {
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// A stored pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Pipeline {
    pub id: PipelineId,
    pub label: String,
    pub revision: u64,
    pub definition: PipelineDefinition,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const YAML: &str = r#"
label: web
sources:
  - type: git
    url: https://example.com/web.git
    target_path: web
    depth: 1
stages:
  - id: deploy
    order: 2
    required_approvals: 1
    stage_trigger: [build]
  - id: build
    order: 1
    jobs:
      - id: compile
        task_groups:
          - id: main
            tasks:
              - id: make
                command: make
                arguments: ["all"]
"#;

    #[test]
    fn test_parse_yaml_with_defaults() {
        let def = PipelineDefinition::from_yaml(YAML).unwrap();
        assert_eq!(def.label, "web");
        assert_eq!(def.stages.len(), 2);

        let build = def.stage(&StageId::new("build")).unwrap();
        assert!(build.is_root());
        assert!(!build.requires_approval());
        assert_eq!(build.jobs[0].platform, Platform::Docker);

        let deploy = def.stage(&StageId::new("deploy")).unwrap();
        assert!(deploy.stage_trigger.contains(&StageId::new("build")));
        assert!(deploy.jobs.is_empty());

        match &def.sources[0] {
            SourceDefinition::Git(git) => {
                assert_eq!(git.depth, Some(1));
                assert_eq!(git.branch, None);
            }
        }
    }

    #[test]
    fn test_stages_in_order() {
        let def = PipelineDefinition::from_yaml(YAML).unwrap();
        let ids: Vec<_> = def
            .stages_in_order()
            .iter()
            .map(|s| s.id.as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["build", "deploy"]);
    }
}

//! Pipeline definition catalog.
//!
//! Definitions are validated on save, so a cyclic or dangling stage graph
//! never reaches the scheduler.

use crate::graph::StageGraph;
use crate::sources::validate_url;
use async_trait::async_trait;
use chrono::Utc;
use stagehand_core::events::{Action, LiveEvent};
use stagehand_core::ids::PipelineId;
use stagehand_core::pipeline::{Pipeline, PipelineDefinition, SourceDefinition};
use stagehand_core::ports::{EventBus, PipelineRepository};
use stagehand_core::{Error, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Pipeline repository kept in memory.
#[derive(Default)]
pub struct InMemoryPipelineRepository {
    pipelines: RwLock<HashMap<PipelineId, Pipeline>>,
}

impl InMemoryPipelineRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineRepository for InMemoryPipelineRepository {
    async fn create(&self, definition: &PipelineDefinition) -> Result<Pipeline> {
        let mut pipelines = self.pipelines.write().await;
        if pipelines.contains_key(&definition.id) {
            return Err(Error::InvalidPipeline(format!(
                "pipeline {} already exists",
                definition.id
            )));
        }

        let now = Utc::now();
        let pipeline = Pipeline {
            id: definition.id,
            label: definition.label.clone(),
            revision: 1,
            definition: definition.clone(),
            created_at: now,
            updated_at: now,
        };
        pipelines.insert(pipeline.id, pipeline.clone());
        Ok(pipeline)
    }

    async fn get(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        Ok(self.pipelines.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Pipeline>> {
        let mut pipelines: Vec<_> = self.pipelines.read().await.values().cloned().collect();
        pipelines.sort_by(|a, b| a.label.cmp(&b.label).then(a.id.cmp(&b.id)));
        Ok(pipelines)
    }

    async fn update(&self, definition: &PipelineDefinition) -> Result<Pipeline> {
        let mut pipelines = self.pipelines.write().await;
        let pipeline = pipelines
            .get_mut(&definition.id)
            .ok_or_else(|| Error::PipelineNotFound(definition.id.to_string()))?;

        pipeline.label = definition.label.clone();
        pipeline.definition = definition.clone();
        pipeline.revision += 1;
        pipeline.updated_at = Utc::now();
        Ok(pipeline.clone())
    }

    async fn delete(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        Ok(self.pipelines.write().await.remove(&id))
    }
}

/// Validating front of a `PipelineRepository` that publishes
/// `live:pipeline` deltas.
pub struct PipelineCatalog {
    repository: Arc<dyn PipelineRepository>,
    event_bus: Arc<dyn EventBus>,
}

impl PipelineCatalog {
    pub fn new(repository: Arc<dyn PipelineRepository>, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            repository,
            event_bus,
        }
    }

    /// Validate and store a definition, creating or replacing it.
    pub async fn save(&self, definition: PipelineDefinition) -> Result<Pipeline> {
        StageGraph::validate(&definition)?;
        validate_sources(&definition)?;

        let (pipeline, action) = match self.repository.get(definition.id).await? {
            Some(_) => (self.repository.update(&definition).await?, Action::Update),
            None => (self.repository.create(&definition).await?, Action::Create),
        };

        info!(
            pipeline_id = %pipeline.id,
            label = %pipeline.label,
            revision = pipeline.revision,
            stages = pipeline.definition.stages.len(),
            "Pipeline saved"
        );
        self.publish(action, &pipeline).await;
        Ok(pipeline)
    }

    pub async fn get(&self, id: PipelineId) -> Result<Pipeline> {
        self.repository
            .get(id)
            .await?
            .ok_or_else(|| Error::PipelineNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Pipeline>> {
        self.repository.list().await
    }

    pub async fn delete(&self, id: PipelineId) -> Result<Pipeline> {
        let pipeline = self
            .repository
            .delete(id)
            .await?
            .ok_or_else(|| Error::PipelineNotFound(id.to_string()))?;

        info!(pipeline_id = %id, "Pipeline deleted");
        self.publish(Action::Delete, &pipeline).await;
        Ok(pipeline)
    }

    /// Load every `*.yaml` / `*.yml` definition in a directory.
    pub async fn load_dir(&self, dir: &Path) -> Result<Vec<Pipeline>> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if is_yaml {
                paths.push(path);
            }
        }
        paths.sort();

        let mut loaded = Vec::with_capacity(paths.len());
        for path in paths {
            let contents = tokio::fs::read_to_string(&path).await?;
            let definition = PipelineDefinition::from_yaml(&contents).map_err(|e| {
                Error::InvalidPipeline(format!("{}: {}", path.display(), e))
            })?;
            debug!(path = %path.display(), "Loaded pipeline definition");
            loaded.push(self.save(definition).await?);
        }
        Ok(loaded)
    }

    async fn publish(&self, action: Action, pipeline: &Pipeline) {
        let result = match LiveEvent::pipeline(action, pipeline) {
            Ok(event) => self.event_bus.publish(event).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(pipeline_id = %pipeline.id, error = %e, "Failed to publish pipeline event");
        }
    }
}

fn validate_sources(definition: &PipelineDefinition) -> Result<()> {
    for source in &definition.sources {
        match source {
            SourceDefinition::Git(git) => validate_url(&git.url)
                .map_err(|_| Error::InvalidPipeline(format!("invalid git url '{}'", git.url)))?,
        }
    }
    Ok(())
}

//! Stage graph built from `stage_trigger` predecessor edges.

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use stagehand_core::Error;
use stagehand_core::ids::StageId;
use stagehand_core::instance::{CompositeState, JobState};
use stagehand_core::pipeline::{PipelineDefinition, StageDefinition};
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Cycle detected in stage triggers at stage {0}")]
    CycleDetected(StageId),
    #[error("Stage {stage} is triggered by unknown stage {trigger}")]
    UnknownTrigger { stage: StageId, trigger: StageId },
    #[error("Duplicate stage id: {0}")]
    DuplicateStage(StageId),
    #[error("Unknown stage: {0}")]
    UnknownStage(StageId),
    #[error("Pipeline has no stages")]
    EmptyPipeline,
}

impl From<GraphError> for Error {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::CycleDetected(stage) => Error::CycleDetected(stage.to_string()),
            GraphError::UnknownStage(stage) => Error::UnknownStage(stage.to_string()),
            other => Error::InvalidPipeline(other.to_string()),
        }
    }
}

/// Job states of one pipeline instance, grouped by stage.
#[derive(Debug, Clone, Default)]
pub struct StageJobs {
    started: HashSet<StageId>,
    states: HashMap<StageId, Vec<JobState>>,
}

impl StageJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a stage's jobs have been created.
    pub fn mark_started(&mut self, stage: StageId) {
        self.started.insert(stage);
    }

    pub fn push(&mut self, stage: StageId, state: JobState) {
        self.states.entry(stage).or_default().push(state);
    }

    pub fn is_started(&self, stage: &StageId) -> bool {
        self.started.contains(stage)
    }

    pub fn states(&self, stage: &StageId) -> &[JobState] {
        self.states.get(stage).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn composite(&self, stage: &StageId) -> CompositeState {
        CompositeState::derive(self.states(stage).iter().copied())
    }
}

/// Directed acyclic graph of a pipeline's stages. Edges point from a
/// predecessor to the stage it triggers.
#[derive(Debug)]
pub struct StageGraph {
    graph: DiGraph<StageDefinition, ()>,
    index: HashMap<StageId, NodeIndex>,
}

impl StageGraph {
    /// Build and validate the graph of a definition.
    pub fn build(definition: &PipelineDefinition) -> Result<Self, GraphError> {
        if definition.stages.is_empty() {
            return Err(GraphError::EmptyPipeline);
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for stage in &definition.stages {
            if index.contains_key(&stage.id) {
                return Err(GraphError::DuplicateStage(stage.id.clone()));
            }
            let idx = graph.add_node(stage.clone());
            index.insert(stage.id.clone(), idx);
        }

        for stage in &definition.stages {
            let stage_idx = index[&stage.id];
            for trigger in &stage.stage_trigger {
                let trigger_idx = index.get(trigger).ok_or_else(|| GraphError::UnknownTrigger {
                    stage: stage.id.clone(),
                    trigger: trigger.clone(),
                })?;
                graph.add_edge(*trigger_idx, stage_idx, ());
            }
        }

        let dag = StageGraph { graph, index };
        dag.topological_order()?;
        Ok(dag)
    }

    /// Validate a definition without keeping the graph.
    pub fn validate(definition: &PipelineDefinition) -> Result<(), GraphError> {
        Self::build(definition).map(|_| ())
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn stage(&self, id: &StageId) -> Option<&StageDefinition> {
        self.index.get(id).and_then(|&idx| self.graph.node_weight(idx))
    }

    /// All stages in ascending `order`.
    pub fn stages(&self) -> Vec<&StageDefinition> {
        let mut stages: Vec<_> = self.graph.node_weights().collect();
        sort_by_order(&mut stages);
        stages
    }

    /// Stages with no triggers.
    pub fn root_stages(&self) -> Vec<&StageDefinition> {
        self.stages().into_iter().filter(|s| s.is_root()).collect()
    }

    /// Direct predecessors of a stage.
    pub fn predecessors(&self, id: &StageId) -> Vec<&StageDefinition> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Stages directly triggered by a stage.
    pub fn successors(&self, id: &StageId) -> Vec<&StageDefinition> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Transitive predecessors of a stage.
    ///
    /// The walk keeps an explicit on-path set and fails on a back edge instead
    /// of truncating, and its depth can never exceed the stage count.
    pub fn ancestors_of(&self, id: &StageId) -> Result<BTreeSet<StageId>, GraphError> {
        let start = *self
            .index
            .get(id)
            .ok_or_else(|| GraphError::UnknownStage(id.clone()))?;

        let mut on_path = HashSet::new();
        let mut visited = HashSet::new();
        let mut ancestors = BTreeSet::new();
        self.walk_ancestors(start, 0, &mut on_path, &mut visited, &mut ancestors)?;
        Ok(ancestors)
    }

    fn walk_ancestors(
        &self,
        node: NodeIndex,
        depth: usize,
        on_path: &mut HashSet<NodeIndex>,
        visited: &mut HashSet<NodeIndex>,
        ancestors: &mut BTreeSet<StageId>,
    ) -> Result<(), GraphError> {
        if depth > self.graph.node_count() || !on_path.insert(node) {
            return Err(GraphError::CycleDetected(self.graph[node].id.clone()));
        }

        for pred in self.graph.neighbors_directed(node, Direction::Incoming) {
            if on_path.contains(&pred) {
                return Err(GraphError::CycleDetected(self.graph[pred].id.clone()));
            }
            if visited.insert(pred) {
                ancestors.insert(self.graph[pred].id.clone());
                self.walk_ancestors(pred, depth + 1, on_path, visited, ancestors)?;
            }
        }

        on_path.remove(&node);
        Ok(())
    }

    /// Topologically sorted stages.
    pub fn topological_order(&self) -> Result<Vec<&StageDefinition>, GraphError> {
        toposort(&self.graph, None)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|&idx| self.graph.node_weight(idx))
                    .collect()
            })
            .map_err(|cycle| GraphError::CycleDetected(self.graph[cycle.node_id()].id.clone()))
    }

    /// Whether every job of a started stage has succeeded.
    ///
    /// A started stage without jobs counts as succeeded.
    pub fn is_succeeded(&self, stage: &StageDefinition, jobs: &StageJobs) -> bool {
        if !jobs.is_started(&stage.id) {
            return false;
        }
        let states = jobs.states(&stage.id);
        states.len() >= stage.jobs.len() && states.iter().all(|s| *s == JobState::Succeeded)
    }

    /// Whether all direct predecessors of a stage have succeeded.
    pub fn predecessors_succeeded(&self, stage: &StageDefinition, jobs: &StageJobs) -> bool {
        self.predecessors(&stage.id)
            .iter()
            .all(|pred| self.is_succeeded(pred, jobs))
    }

    /// Stages that can start: not started yet and every direct predecessor
    /// has succeeded. Returned in ascending `order`.
    pub fn ready_stages(&self, jobs: &StageJobs) -> Vec<&StageDefinition> {
        self.stages()
            .into_iter()
            .filter(|stage| !jobs.is_started(&stage.id))
            .filter(|stage| self.predecessors_succeeded(stage, jobs))
            .collect()
    }

    /// Whether an unstarted stage can never run because an ancestor failed
    /// or was cancelled.
    pub fn is_blocked(&self, id: &StageId, jobs: &StageJobs) -> Result<bool, GraphError> {
        if jobs.is_started(id) {
            return Ok(false);
        }
        let ancestors = self.ancestors_of(id)?;
        Ok(ancestors.iter().any(|ancestor| {
            matches!(
                jobs.composite(ancestor),
                CompositeState::Failed | CompositeState::Cancelled
            )
        }))
    }

    fn neighbors(&self, id: &StageId, direction: Direction) -> Vec<&StageDefinition> {
        let mut stages: Vec<_> = self
            .index
            .get(id)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, direction)
                    .filter_map(|n| self.graph.node_weight(n))
                    .collect()
            })
            .unwrap_or_default();
        sort_by_order(&mut stages);
        stages
    }
}

fn sort_by_order(stages: &mut [&StageDefinition]) {
    stages.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
}

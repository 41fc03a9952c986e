//! Pipeline and job instance types.
//!
//! A `PipelineInstance` is one triggered run of a frozen definition snapshot.
//! Each job of a started stage gets exactly one `JobInstance`.

use crate::ids::{JobId, JobInstanceId, PipelineId, PipelineInstanceId, StageId};
use crate::pipeline::PipelineDefinition;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Lifecycle state of a job instance.
///
/// Transitions follow `pending -> building -> {succeeded | failed | cancelled}`
/// with an optional `building <-> frozen` pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Building,
    Frozen,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Transition rank. A report may never move a job to a lower rank.
    pub fn rank(&self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Building | JobState::Frozen => 1,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled => 2,
        }
    }

    /// Whether `next` is reachable from `self` in the state machine.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (JobState::Pending, JobState::Frozen) => false,
            (from, to) => to.rank() >= from.rank() && *from != to,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Building => "building",
            JobState::Frozen => "frozen",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason code attached to a failed or cancelled job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    AgentReported,
    Timeout,
    DispatchError,
    SourceResolutionError,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobInstance {
    pub id: JobInstanceId,
    pub job: JobId,
    pub stage: StageId,
    pub pipeline: PipelineId,
    pub pipeline_instance: PipelineInstanceId,
    pub state: JobState,
    pub reason: Option<FailureReason>,
    pub message: Option<String>,
    pub start_epoch: Option<i64>,
    pub end_epoch: Option<i64>,
    /// Epoch of the last accepted report.
    pub last_epoch: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobInstance {
    pub fn new(
        pipeline: PipelineId,
        pipeline_instance: PipelineInstanceId,
        stage: StageId,
        job: JobId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobInstanceId::new(),
            job,
            stage,
            pipeline,
            pipeline_instance,
            state: JobState::Pending,
            reason: None,
            message: None,
            start_epoch: None,
            end_epoch: None,
            last_epoch: now.timestamp_millis(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Overall state of a pipeline instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PipelineInstanceState {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl PipelineInstanceState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PipelineInstanceState::Running)
    }
}

/// Per-run approval gate record for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StageApproval {
    pub stage_id: StageId,
    pub instance_id: PipelineInstanceId,
    pub approval_count: u32,
    pub required_approvals: u32,
    pub approver_ids: BTreeSet<String>,
    pub ready_for_approval: bool,
}

impl StageApproval {
    pub fn new(stage_id: StageId, instance_id: PipelineInstanceId, required_approvals: u32) -> Self {
        Self {
            stage_id,
            instance_id,
            approval_count: 0,
            required_approvals,
            approver_ids: BTreeSet::new(),
            ready_for_approval: false,
        }
    }

    pub fn is_satisfied(&self) -> bool {
        self.approval_count >= self.required_approvals
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PipelineInstanceStatus {
    pub job_instances: Vec<JobInstanceId>,
    pub stage_approvals: Vec<StageApproval>,
    /// Stages whose jobs have been created.
    pub started_stages: BTreeSet<StageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineInstance {
    pub id: PipelineInstanceId,
    pub pipeline_id: PipelineId,
    pub run_number: u64,
    /// Definition snapshot taken at trigger time.
    pub spec: PipelineDefinition,
    pub status: PipelineInstanceStatus,
    pub state: PipelineInstanceState,
    pub triggered_by: Option<String>,
    pub cancelled_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineInstance {
    pub fn new(spec: PipelineDefinition, run_number: u64, triggered_by: Option<String>) -> Self {
        Self {
            id: PipelineInstanceId::new(),
            pipeline_id: spec.id,
            run_number,
            spec,
            status: PipelineInstanceStatus::default(),
            state: PipelineInstanceState::Running,
            triggered_by,
            cancelled_by: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Aggregate state of a stage, derived from its job states.
///
/// Variants are declared in ascending precedence; the highest present wins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum CompositeState {
    Pending,
    Succeeded,
    Building,
    Frozen,
    Cancelled,
    Failed,
}

impl CompositeState {
    /// Derive the composite state from job states. No jobs means `Pending`.
    pub fn derive<I>(states: I) -> CompositeState
    where
        I: IntoIterator<Item = JobState>,
    {
        states
            .into_iter()
            .map(CompositeState::from)
            .max()
            .unwrap_or(CompositeState::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CompositeState::Succeeded | CompositeState::Failed | CompositeState::Cancelled
        )
    }
}

impl From<JobState> for CompositeState {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Pending => CompositeState::Pending,
            JobState::Building => CompositeState::Building,
            JobState::Frozen => CompositeState::Frozen,
            JobState::Succeeded => CompositeState::Succeeded,
            JobState::Failed => CompositeState::Failed,
            JobState::Cancelled => CompositeState::Cancelled,
        }
    }
}

/// Scheduling view of a stage inside one pipeline instance. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    AwaitingApproval,
    Building,
    Frozen,
    Succeeded,
    Failed,
    Cancelled,
    Blocked,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded
                | StageStatus::Failed
                | StageStatus::Cancelled
                | StageStatus::Blocked
        )
    }
}

impl From<CompositeState> for StageStatus {
    fn from(state: CompositeState) -> Self {
        match state {
            CompositeState::Pending => StageStatus::Pending,
            CompositeState::Succeeded => StageStatus::Succeeded,
            CompositeState::Building => StageStatus::Building,
            CompositeState::Frozen => StageStatus::Frozen,
            CompositeState::Cancelled => StageStatus::Cancelled,
            CompositeState::Failed => StageStatus::Failed,
        }
    }
}

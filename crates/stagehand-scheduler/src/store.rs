//! Authoritative state of pipeline and job instances.
//!
//! Every record sits behind its own mutex. Reports for one job instance are
//! serialized; reports for different jobs never contend.

use chrono::{DateTime, Utc};
use stagehand_core::events::{Action, LiveEvent};
use stagehand_core::ids::{JobId, JobInstanceId, PipelineId, PipelineInstanceId, StageId};
use stagehand_core::instance::{FailureReason, JobInstance, JobState, PipelineInstance};
use stagehand_core::pipeline::PipelineDefinition;
use stagehand_core::ports::EventBus;
use stagehand_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Result of applying a job update.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// The update changed the stored record.
    Applied(JobInstance),
    /// The job is already in the reported state.
    Duplicate,
    /// The update regresses or reorders the stored state and was dropped.
    Stale { current: JobState, reason: String },
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied(_))
    }

    pub fn applied(&self) -> Option<&JobInstance> {
        match self {
            UpdateOutcome::Applied(job) => Some(job),
            _ => None,
        }
    }
}

/// A requested job state change.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub state: JobState,
    /// Reporter clock in epoch milliseconds.
    pub epoch: i64,
    pub reason: Option<FailureReason>,
    pub message: Option<String>,
}

impl JobUpdate {
    /// An update reported by an agent.
    pub fn reported(state: JobState, epoch: i64) -> Self {
        Self {
            state,
            epoch,
            reason: None,
            message: None,
        }
    }

    pub fn building() -> Self {
        Self::reported(JobState::Building, now_epoch())
    }

    pub fn failed(reason: FailureReason) -> Self {
        Self {
            reason: Some(reason),
            ..Self::reported(JobState::Failed, now_epoch())
        }
    }

    pub fn cancelled() -> Self {
        Self {
            reason: Some(FailureReason::Cancelled),
            ..Self::reported(JobState::Cancelled, now_epoch())
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Outcome of registering a job instance.
#[derive(Debug, Clone)]
pub enum Registration {
    Created(JobInstance),
    /// A job instance already exists for this (instance, stage, job).
    Existing(JobInstance),
}

impl Registration {
    pub fn is_created(&self) -> bool {
        matches!(self, Registration::Created(_))
    }

    pub fn into_inner(self) -> JobInstance {
        match self {
            Registration::Created(job) | Registration::Existing(job) => job,
        }
    }
}

type JobKey = (PipelineInstanceId, StageId, JobId);

pub struct InstanceStateStore {
    instances: RwLock<HashMap<PipelineInstanceId, Arc<Mutex<PipelineInstance>>>>,
    jobs: RwLock<HashMap<JobInstanceId, Arc<Mutex<JobInstance>>>>,
    job_index: Mutex<HashMap<JobKey, JobInstanceId>>,
    run_numbers: Mutex<HashMap<PipelineId, u64>>,
    /// Last repeated report per running job, newer than its `updated_at`.
    heartbeats: Mutex<HashMap<JobInstanceId, DateTime<Utc>>>,
    event_bus: Arc<dyn EventBus>,
}

impl InstanceStateStore {
    pub fn new(event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            jobs: RwLock::new(HashMap::new()),
            job_index: Mutex::new(HashMap::new()),
            run_numbers: Mutex::new(HashMap::new()),
            heartbeats: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    /// Create a pipeline instance from a definition snapshot.
    pub async fn create_instance(
        &self,
        spec: PipelineDefinition,
        triggered_by: Option<String>,
    ) -> Result<PipelineInstance> {
        let run_number = {
            let mut run_numbers = self.run_numbers.lock().await;
            let next = run_numbers.entry(spec.id).or_insert(0);
            *next += 1;
            *next
        };

        let instance = PipelineInstance::new(spec, run_number, triggered_by);
        self.instances
            .write()
            .await
            .insert(instance.id, Arc::new(Mutex::new(instance.clone())));

        info!(
            instance_id = %instance.id,
            pipeline_id = %instance.pipeline_id,
            run_number,
            "Pipeline instance created"
        );
        self.publish(LiveEvent::pipeline_instance(Action::Create, &instance))
            .await;
        Ok(instance)
    }

    pub async fn instance(&self, id: PipelineInstanceId) -> Result<PipelineInstance> {
        let record = self.instance_record(id).await?;
        let instance = record.lock().await.clone();
        Ok(instance)
    }

    /// Instances, optionally of one pipeline, newest first.
    pub async fn list_instances(&self, pipeline_id: Option<PipelineId>) -> Vec<PipelineInstance> {
        let records: Vec<_> = self.instances.read().await.values().cloned().collect();

        let mut instances = Vec::with_capacity(records.len());
        for record in records {
            let instance = record.lock().await;
            if pipeline_id.is_none_or(|id| instance.pipeline_id == id) {
                instances.push(instance.clone());
            }
        }
        instances.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        instances
    }

    /// Mutate an instance. The closure returns whether it changed anything;
    /// changes are published.
    pub async fn update_instance<F>(&self, id: PipelineInstanceId, f: F) -> Result<PipelineInstance>
    where
        F: FnOnce(&mut PipelineInstance) -> bool,
    {
        let record = self.instance_record(id).await?;
        let mut instance = record.lock().await;
        if f(&mut *instance) {
            self.publish(LiveEvent::pipeline_instance(Action::Update, &instance))
                .await;
        }
        Ok(instance.clone())
    }

    /// Register the job instance for one job of a stage. Registering the same
    /// job twice returns the existing record.
    pub async fn create_job_instance(
        &self,
        instance_id: PipelineInstanceId,
        pipeline_id: PipelineId,
        stage: &StageId,
        job: &JobId,
    ) -> Result<Registration> {
        let mut index = self.job_index.lock().await;
        let key = (instance_id, stage.clone(), job.clone());
        if let Some(existing) = index.get(&key) {
            return self.job_instance(*existing).await.map(Registration::Existing);
        }

        let job_instance = JobInstance::new(pipeline_id, instance_id, stage.clone(), job.clone());
        self.jobs
            .write()
            .await
            .insert(job_instance.id, Arc::new(Mutex::new(job_instance.clone())));
        index.insert(key, job_instance.id);
        drop(index);

        debug!(
            job_instance_id = %job_instance.id,
            instance_id = %instance_id,
            stage = %stage,
            job = %job,
            "Job instance created"
        );
        self.publish(LiveEvent::job_instance(Action::Create, &job_instance))
            .await;
        Ok(Registration::Created(job_instance))
    }

    pub async fn job_instance(&self, id: JobInstanceId) -> Result<JobInstance> {
        let record = self.job_record(id).await?;
        let job = record.lock().await.clone();
        Ok(job)
    }

    /// Job instances of a pipeline instance in creation order.
    pub async fn jobs_for_instance(&self, instance_id: PipelineInstanceId) -> Vec<JobInstance> {
        let records: Vec<_> = self.jobs.read().await.values().cloned().collect();

        let mut jobs = Vec::new();
        for record in records {
            let job = record.lock().await;
            if job.pipeline_instance == instance_id {
                jobs.push(job.clone());
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    /// Apply a state change to a job instance.
    ///
    /// Regressions and reports for terminal jobs are dropped. Moves between
    /// `building` and `frozen` are ordered by epoch; an older epoch loses.
    pub async fn apply_job_update(
        &self,
        id: JobInstanceId,
        update: JobUpdate,
    ) -> Result<UpdateOutcome> {
        let record = self.job_record(id).await?;
        let mut job = record.lock().await;
        let current = job.state;

        if current == update.state {
            if !current.is_terminal() {
                self.heartbeats.lock().await.insert(id, Utc::now());
            }
            debug!(job_instance_id = %id, state = %current, "Duplicate job update ignored");
            return Ok(UpdateOutcome::Duplicate);
        }

        let stale_reason = if !current.can_transition_to(update.state) {
            Some(format!("cannot move from {} to {}", current, update.state))
        } else if current.rank() == update.state.rank() && update.epoch <= job.last_epoch {
            Some(format!(
                "epoch {} is not newer than {}",
                update.epoch, job.last_epoch
            ))
        } else {
            None
        };

        if let Some(reason) = stale_reason {
            debug!(
                job_instance_id = %id,
                current = %current,
                reported = %update.state,
                epoch = update.epoch,
                reason = %reason,
                "Stale job update dropped"
            );
            return Ok(UpdateOutcome::Stale { current, reason });
        }

        job.state = update.state;
        job.last_epoch = job.last_epoch.max(update.epoch);
        job.updated_at = Utc::now();
        self.heartbeats.lock().await.remove(&id);
        if update.state == JobState::Building && job.start_epoch.is_none() {
            job.start_epoch = Some(update.epoch);
        }
        if update.state.is_terminal() {
            job.end_epoch = Some(update.epoch);
            job.reason = update.reason.or(match update.state {
                JobState::Failed => Some(FailureReason::AgentReported),
                JobState::Cancelled => Some(FailureReason::Cancelled),
                _ => None,
            });
        }
        if update.message.is_some() {
            job.message = update.message;
        }

        info!(
            job_instance_id = %id,
            instance_id = %job.pipeline_instance,
            stage = %job.stage,
            from = %current,
            to = %job.state,
            "Job state changed"
        );
        self.publish(LiveEvent::job_instance(Action::Update, &job))
            .await;
        Ok(UpdateOutcome::Applied(job.clone()))
    }

    /// Non-terminal, non-frozen jobs with no report since `cutoff`. A
    /// repeated report counts even though it leaves the record unchanged.
    pub async fn stale_jobs(&self, cutoff: DateTime<Utc>) -> Vec<JobInstance> {
        let records: Vec<_> = self.jobs.read().await.values().cloned().collect();

        let mut stale = Vec::new();
        for record in records {
            let job = record.lock().await;
            if job.is_terminal() || job.state == JobState::Frozen {
                continue;
            }
            let heartbeat = self.heartbeats.lock().await.get(&job.id).copied();
            let last_seen = heartbeat.map_or(job.updated_at, |at| at.max(job.updated_at));
            if last_seen < cutoff {
                stale.push(job.clone());
            }
        }
        stale
    }

    async fn instance_record(&self, id: PipelineInstanceId) -> Result<Arc<Mutex<PipelineInstance>>> {
        self.instances
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))
    }

    async fn job_record(&self, id: JobInstanceId) -> Result<Arc<Mutex<JobInstance>>> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::JobInstanceNotFound(id.to_string()))
    }

    async fn publish(&self, event: Result<LiveEvent>) {
        let result = match event {
            Ok(event) => self.event_bus.publish(event).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to publish live event");
        }
    }
}

pub(crate) fn now_epoch() -> i64 {
    Utc::now().timestamp_millis()
}

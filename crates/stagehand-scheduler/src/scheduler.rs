//! Reactive pipeline controller.
//!
//! The scheduler runs on two kinds of events: a trigger starting a pipeline
//! instance, and a job outcome reported for one of its job instances. Each
//! run recomputes which stages are ready, releases those whose approval gate
//! is satisfied, and hands their jobs to agents without waiting on them.
//! Runs for one instance are serialized behind a per-instance lock; separate
//! instances proceed in parallel.

use crate::approval::ApprovalGateManager;
use crate::catalog::PipelineCatalog;
use crate::config::SchedulerConfig;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::graph::{StageGraph, StageJobs};
use crate::store::{InstanceStateStore, JobUpdate, UpdateOutcome};
use chrono::Utc;
use serde::Serialize;
use stagehand_core::ids::{JobInstanceId, PipelineId, PipelineInstanceId, StageId};
use stagehand_core::instance::{
    FailureReason, JobInstance, JobState, PipelineInstance, PipelineInstanceState, StageApproval,
    StageStatus,
};
use stagehand_core::pipeline::{JobDefinition, StageDefinition};
use stagehand_core::ports::{AgentDispatch, DispatchRequest, ResolvedSource, SourceResolver};
use stagehand_core::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OnceCell, OwnedMutexGuard, RwLock};
use tracing::{debug, error, info, warn};

type SourceCell = Arc<OnceCell<std::result::Result<Vec<ResolvedSource>, String>>>;

/// Derived view of one stage in a pipeline instance.
#[derive(Debug, Clone, Serialize)]
pub struct StageView {
    pub stage_id: StageId,
    pub label: Option<String>,
    pub order: u32,
    pub status: StageStatus,
    pub required_approvals: u32,
    pub approval: Option<StageApproval>,
    pub job_instances: Vec<JobInstance>,
}

pub struct Scheduler {
    catalog: Arc<PipelineCatalog>,
    store: Arc<InstanceStateStore>,
    approvals: Arc<ApprovalGateManager>,
    dispatcher: Dispatcher,
    sources: Arc<dyn SourceResolver>,
    config: SchedulerConfig,
    graphs: RwLock<HashMap<PipelineInstanceId, Arc<StageGraph>>>,
    locks: StdMutex<HashMap<PipelineInstanceId, Arc<Mutex<()>>>>,
    resolved: StdMutex<HashMap<PipelineInstanceId, SourceCell>>,
}

impl Scheduler {
    pub fn new(
        catalog: Arc<PipelineCatalog>,
        store: Arc<InstanceStateStore>,
        approvals: Arc<ApprovalGateManager>,
        agent: Arc<dyn AgentDispatch>,
        sources: Arc<dyn SourceResolver>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            store,
            approvals,
            dispatcher: Dispatcher::new(agent, config.dispatch.clone()),
            sources,
            config,
            graphs: RwLock::new(HashMap::new()),
            locks: StdMutex::new(HashMap::new()),
            resolved: StdMutex::new(HashMap::new()),
        })
    }

    pub fn catalog(&self) -> &Arc<PipelineCatalog> {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<InstanceStateStore> {
        &self.store
    }

    pub fn approvals(&self) -> &Arc<ApprovalGateManager> {
        &self.approvals
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Trigger a new run of a pipeline. Root stages are released before this
    /// returns; their jobs are dispatched in the background.
    pub async fn start(
        self: &Arc<Self>,
        pipeline_id: PipelineId,
        triggered_by: Option<String>,
    ) -> Result<PipelineInstance> {
        let pipeline = self.catalog.get(pipeline_id).await?;
        let graph = Arc::new(StageGraph::build(&pipeline.definition)?);

        let instance = self
            .store
            .create_instance(pipeline.definition, triggered_by)
            .await?;
        for stage in graph.stages() {
            self.approvals
                .open(instance.id, &stage.id, stage.required_approvals)
                .await;
        }
        self.graphs.write().await.insert(instance.id, graph);

        info!(
            instance_id = %instance.id,
            pipeline_id = %pipeline_id,
            run_number = instance.run_number,
            "Pipeline run started"
        );
        self.evaluate(instance.id).await
    }

    /// Record an approval for a gated stage and release it once satisfied.
    pub async fn approve(
        self: &Arc<Self>,
        pipeline_id: PipelineId,
        instance_id: PipelineInstanceId,
        stage_id: &StageId,
        approver_id: &str,
    ) -> Result<PipelineInstance> {
        let instance = self.store.instance(instance_id).await?;
        if instance.pipeline_id != pipeline_id {
            return Err(Error::InstanceNotFound(instance_id.to_string()));
        }
        if instance.is_terminal() {
            return Err(Error::InstanceTerminated(instance_id.to_string()));
        }
        if instance.spec.stage(stage_id).is_none() {
            return Err(Error::StageNotFound {
                instance: instance_id.to_string(),
                stage: stage_id.to_string(),
            });
        }

        self.approvals
            .record_approval(instance_id, stage_id, approver_id)
            .await?;
        self.evaluate(instance_id).await
    }

    /// Apply a state report from an agent and advance the instance.
    pub async fn report_state(
        self: &Arc<Self>,
        job_instance_id: JobInstanceId,
        state: JobState,
        epoch: i64,
        message: Option<String>,
    ) -> Result<UpdateOutcome> {
        let mut update = JobUpdate::reported(state, epoch);
        update.message = message;

        let outcome = self.store.apply_job_update(job_instance_id, update).await?;
        if let UpdateOutcome::Applied(job) = &outcome {
            self.evaluate(job.pipeline_instance).await?;
        }
        Ok(outcome)
    }

    /// Cancel a running instance. No further jobs are created, in-flight jobs
    /// get a best-effort cancel request and every non-terminal job is marked
    /// `cancelled`.
    pub async fn cancel(
        self: &Arc<Self>,
        instance_id: PipelineInstanceId,
        actor: Option<String>,
    ) -> Result<PipelineInstance> {
        if self.store.instance(instance_id).await?.is_terminal() {
            return Err(Error::InstanceTerminated(instance_id.to_string()));
        }
        let _guard = self.lock_instance(instance_id).await;

        let instance = self.store.instance(instance_id).await?;
        if instance.is_terminal() {
            self.forget_lock(instance_id);
            return Err(Error::InstanceTerminated(instance_id.to_string()));
        }

        let approvals = self.approvals.list(instance_id).await;
        let instance = self
            .store
            .update_instance(instance_id, |instance| {
                instance.state = PipelineInstanceState::Cancelled;
                instance.cancelled_by = actor.clone();
                instance.completed_at = Some(Utc::now());
                instance.status.stage_approvals = approvals;
                true
            })
            .await?;

        let mut cancelled = 0usize;
        for job in self.job_instances(&instance).await? {
            if job.is_terminal() {
                continue;
            }
            let id = job.id;
            let scheduler = Arc::clone(self);
            tokio::spawn(async move { scheduler.dispatcher.cancel(id).await });

            let outcome = self
                .store
                .apply_job_update(id, JobUpdate::cancelled())
                .await?;
            if outcome.is_applied() {
                cancelled += 1;
            }
        }
        self.dispatcher.interrupt_backoff();

        info!(
            instance_id = %instance_id,
            actor = ?actor,
            cancelled_jobs = cancelled,
            "Pipeline run cancelled"
        );
        self.finish(instance_id).await;
        Ok(instance)
    }

    /// Derived status of every stage, in ascending `order`.
    pub async fn stage_statuses(&self, instance_id: PipelineInstanceId) -> Result<Vec<StageView>> {
        let instance = self.store.instance(instance_id).await?;
        let graph = self.graph_for(&instance).await?;
        let jobs = self.job_instances(&instance).await?;
        let stage_jobs = stage_jobs(&instance, &jobs);

        let mut views = Vec::new();
        for stage in graph.stages() {
            let approval = match self.approvals.get(instance_id, &stage.id).await {
                Some(approval) => Some(approval),
                None => instance
                    .status
                    .stage_approvals
                    .iter()
                    .find(|a| a.stage_id == stage.id)
                    .cloned(),
            };
            let status = stage_status(&graph, stage, &stage_jobs, approval.as_ref())?;
            views.push(StageView {
                stage_id: stage.id.clone(),
                label: stage.label.clone(),
                order: stage.order,
                status,
                required_approvals: stage.required_approvals,
                approval,
                job_instances: jobs.iter().filter(|j| j.stage == stage.id).cloned().collect(),
            });
        }
        Ok(views)
    }

    /// Job instances of an instance, in creation order.
    pub async fn instance_jobs(&self, instance_id: PipelineInstanceId) -> Result<Vec<JobInstance>> {
        let instance = self.store.instance(instance_id).await?;
        self.job_instances(&instance).await
    }

    /// Fail every job that has not reported within the configured timeout.
    /// Returns the number of jobs failed.
    pub async fn expire_stale_jobs(self: &Arc<Self>) -> Result<usize> {
        let timeout = self.config.watchdog.job_timeout();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(timeout)
                .map_err(|e| Error::Internal(format!("invalid job timeout: {}", e)))?;

        let mut expired = 0;
        for job in self.store.stale_jobs(cutoff).await {
            warn!(
                job_instance_id = %job.id,
                instance_id = %job.pipeline_instance,
                state = %job.state,
                "Job timed out without a state report"
            );
            let message = format!("no state update within {}s", timeout.as_secs());
            if self
                .fail_job(job.id, FailureReason::Timeout, message)
                .await?
            {
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn evaluate(self: &Arc<Self>, instance_id: PipelineInstanceId) -> Result<PipelineInstance> {
        let instance = self.store.instance(instance_id).await?;
        if instance.is_terminal() {
            return Ok(instance);
        }
        let _guard = self.lock_instance(instance_id).await;
        let instance = self.evaluate_locked(instance_id).await?;
        if instance.is_terminal() {
            self.forget_lock(instance_id);
        }
        Ok(instance)
    }

    async fn evaluate_locked(
        self: &Arc<Self>,
        instance_id: PipelineInstanceId,
    ) -> Result<PipelineInstance> {
        let mut instance = self.store.instance(instance_id).await?;
        if instance.is_terminal() {
            return Ok(instance);
        }
        let graph = self.graph_for(&instance).await?;

        loop {
            let jobs = self.job_instances(&instance).await?;
            let stage_jobs = stage_jobs(&instance, &jobs);

            let mut released = false;
            for stage in graph.ready_stages(&stage_jobs) {
                if stage.requires_approval() {
                    self.approvals
                        .open(instance_id, &stage.id, stage.required_approvals)
                        .await;
                    self.approvals.mark_ready(instance_id, &stage.id).await;
                    if !self.approvals.is_satisfied(instance_id, &stage.id).await {
                        debug!(
                            instance_id = %instance_id,
                            stage = %stage.id,
                            "Stage awaiting approval"
                        );
                        continue;
                    }
                }
                self.release_stage(&instance, stage).await?;
                released = true;
            }

            instance = self.store.instance(instance_id).await?;
            if !released {
                break;
            }
        }

        self.settle(instance, &graph).await
    }

    /// Create the stage's job instances, move them to `building` and dispatch
    /// them in the background.
    async fn release_stage(
        self: &Arc<Self>,
        instance: &PipelineInstance,
        stage: &StageDefinition,
    ) -> Result<()> {
        let mut created = Vec::new();
        for job in stage.jobs_in_order() {
            let registration = self
                .store
                .create_job_instance(instance.id, instance.pipeline_id, &stage.id, &job.id)
                .await?;
            if registration.is_created() {
                created.push((registration.into_inner(), job.clone()));
            }
        }

        let stage_id = stage.id.clone();
        let job_ids: Vec<_> = created.iter().map(|(j, _)| j.id).collect();
        self.store
            .update_instance(instance.id, move |instance| {
                instance.status.started_stages.insert(stage_id);
                instance.status.job_instances.extend(job_ids);
                true
            })
            .await?;

        info!(
            instance_id = %instance.id,
            stage = %stage.id,
            jobs = created.len(),
            "Stage released"
        );

        for (job_instance, job) in created {
            let outcome = self
                .store
                .apply_job_update(job_instance.id, JobUpdate::building())
                .await?;
            let job_instance = outcome.applied().cloned().unwrap_or(job_instance);
            self.spawn_dispatch(job_instance, job);
        }
        Ok(())
    }

    fn spawn_dispatch(self: &Arc<Self>, job_instance: JobInstance, job: JobDefinition) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let id = job_instance.id;
            if let Err(e) = scheduler.run_dispatch(job_instance, job).await {
                error!(job_instance_id = %id, error = %e, "Dispatch task failed");
            }
        });
    }

    async fn run_dispatch(self: &Arc<Self>, job_instance: JobInstance, job: JobDefinition) -> Result<()> {
        let id = job_instance.id;
        let instance = self.store.instance(job_instance.pipeline_instance).await?;

        if self.store.job_instance(id).await?.is_terminal() {
            debug!(job_instance_id = %id, "Skipping dispatch of finished job");
            return Ok(());
        }

        let resolved = self.resolve_sources(&instance).await;
        if self.store.instance(instance.id).await?.is_terminal() {
            self.forget_sources(instance.id);
        }
        let sources = match resolved {
            Ok(sources) => sources,
            Err(message) => {
                warn!(job_instance_id = %id, error = %message, "Source resolution failed");
                self.fail_job(id, FailureReason::SourceResolutionError, message)
                    .await?;
                return Ok(());
            }
        };

        let current = self.store.job_instance(id).await?;
        if current.is_terminal() {
            debug!(job_instance_id = %id, state = %current.state, "Skipping dispatch of finished job");
            return Ok(());
        }

        let request = DispatchRequest {
            job_instance: current,
            job,
            sources,
        };
        let store = Arc::clone(&self.store);
        let wanted = || {
            let store = Arc::clone(&store);
            async move {
                store
                    .job_instance(id)
                    .await
                    .map(|job| !job.is_terminal())
                    .unwrap_or(false)
            }
        };
        match self.dispatcher.submit_while(&request, wanted).await {
            DispatchOutcome::Accepted(_) | DispatchOutcome::AlreadyInFlight => {}
            DispatchOutcome::Withdrawn { attempts } => {
                debug!(job_instance_id = %id, attempts, "Dispatch withdrawn");
            }
            DispatchOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                let message = format!("dispatch failed after {} attempts: {}", attempts, last_error);
                self.fail_job(id, FailureReason::DispatchError, message)
                    .await?;
            }
        }
        Ok(())
    }

    /// Sources are resolved once per instance and shared by all its jobs.
    async fn resolve_sources(
        &self,
        instance: &PipelineInstance,
    ) -> std::result::Result<Vec<ResolvedSource>, String> {
        if instance.spec.sources.is_empty() {
            return Ok(Vec::new());
        }

        let cell = {
            let mut resolved = self.resolved.lock().unwrap_or_else(|e| e.into_inner());
            resolved.entry(instance.id).or_default().clone()
        };
        cell.get_or_init(|| async {
            self.sources
                .resolve(instance.id, &instance.spec.sources)
                .await
                .map_err(|e| e.to_string())
        })
        .await
        .clone()
    }

    /// Force a job to `failed`. Returns whether the update was applied.
    async fn fail_job(
        self: &Arc<Self>,
        id: JobInstanceId,
        reason: FailureReason,
        message: String,
    ) -> Result<bool> {
        let update = JobUpdate::failed(reason).with_message(message);
        match self.store.apply_job_update(id, update).await? {
            UpdateOutcome::Applied(job) => {
                self.evaluate(job.pipeline_instance).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Refresh the approval snapshot and close the instance once every stage
    /// and job is terminal.
    async fn settle(
        &self,
        instance: PipelineInstance,
        graph: &StageGraph,
    ) -> Result<PipelineInstance> {
        let jobs = self.job_instances(&instance).await?;
        let stage_jobs = stage_jobs(&instance, &jobs);

        let mut statuses = Vec::new();
        for stage in graph.stages() {
            let approval = self.approvals.get(instance.id, &stage.id).await;
            statuses.push(stage_status(graph, stage, &stage_jobs, approval.as_ref())?);
        }

        let finished =
            statuses.iter().all(StageStatus::is_terminal) && jobs.iter().all(JobInstance::is_terminal);
        let final_state = finished.then(|| {
            if statuses.iter().all(|s| *s == StageStatus::Succeeded) {
                PipelineInstanceState::Succeeded
            } else {
                PipelineInstanceState::Failed
            }
        });

        let approvals = self.approvals.list(instance.id).await;
        let instance = self
            .store
            .update_instance(instance.id, |instance| {
                let mut changed = false;
                if instance.status.stage_approvals != approvals {
                    instance.status.stage_approvals = approvals;
                    changed = true;
                }
                if let Some(state) = final_state {
                    instance.state = state;
                    instance.completed_at = Some(Utc::now());
                    changed = true;
                }
                changed
            })
            .await?;

        if let Some(state) = final_state {
            info!(instance_id = %instance.id, state = ?state, "Pipeline run finished");
            self.finish(instance.id).await;
        }
        Ok(instance)
    }

    async fn finish(&self, instance_id: PipelineInstanceId) {
        self.approvals.close_instance(instance_id).await;
        self.graphs.write().await.remove(&instance_id);
        self.forget_sources(instance_id);
        self.forget_lock(instance_id);
    }

    fn forget_sources(&self, instance_id: PipelineInstanceId) {
        self.resolved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&instance_id);
    }

    fn forget_lock(&self, instance_id: PipelineInstanceId) {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&instance_id);
    }

    async fn job_instances(&self, instance: &PipelineInstance) -> Result<Vec<JobInstance>> {
        let mut jobs = Vec::with_capacity(instance.status.job_instances.len());
        for id in &instance.status.job_instances {
            jobs.push(self.store.job_instance(*id).await?);
        }
        Ok(jobs)
    }

    async fn graph_for(&self, instance: &PipelineInstance) -> Result<Arc<StageGraph>> {
        if let Some(graph) = self.graphs.read().await.get(&instance.id) {
            return Ok(graph.clone());
        }
        let graph = Arc::new(StageGraph::build(&instance.spec)?);
        if !instance.is_terminal() {
            self.graphs.write().await.insert(instance.id, graph.clone());
        }
        Ok(graph)
    }

    async fn lock_instance(&self, instance_id: PipelineInstanceId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(instance_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

fn stage_jobs(instance: &PipelineInstance, jobs: &[JobInstance]) -> StageJobs {
    let mut stage_jobs = StageJobs::new();
    for stage in &instance.status.started_stages {
        stage_jobs.mark_started(stage.clone());
    }
    for job in jobs {
        stage_jobs.push(job.stage.clone(), job.state);
    }
    stage_jobs
}

fn stage_status(
    graph: &StageGraph,
    stage: &StageDefinition,
    jobs: &StageJobs,
    approval: Option<&StageApproval>,
) -> Result<StageStatus> {
    if jobs.is_started(&stage.id) {
        if graph.is_succeeded(stage, jobs) {
            return Ok(StageStatus::Succeeded);
        }
        return Ok(match StageStatus::from(jobs.composite(&stage.id)) {
            StageStatus::Succeeded => StageStatus::Building,
            status => status,
        });
    }

    if graph.is_blocked(&stage.id, jobs)? {
        return Ok(StageStatus::Blocked);
    }

    let gated = approval.is_some_and(|a| !a.is_satisfied());
    if stage.requires_approval() && gated && graph.predecessors_succeeded(stage, jobs) {
        return Ok(StageStatus::AwaitingApproval);
    }
    Ok(StageStatus::Pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use crate::catalog::InMemoryPipelineRepository;
    use async_trait::async_trait;
    use stagehand_core::ids::JobId;
    use stagehand_core::pipeline::{JobDefinition, PipelineDefinition, Platform, SourceDefinition};
    use stagehand_core::ports::Ack;

    struct AcceptingAgent;

    #[async_trait]
    impl AgentDispatch for AcceptingAgent {
        async fn dispatch(&self, _request: &DispatchRequest) -> Result<Ack> {
            Ok(Ack::accepted("test-agent"))
        }

        async fn cancel(&self, _id: JobInstanceId) -> Result<()> {
            Ok(())
        }
    }

    struct NoSources;

    #[async_trait]
    impl SourceResolver for NoSources {
        async fn resolve(
            &self,
            _instance_id: PipelineInstanceId,
            _sources: &[SourceDefinition],
        ) -> Result<Vec<ResolvedSource>> {
            Ok(Vec::new())
        }
    }

    fn scheduler() -> Arc<Scheduler> {
        let bus = Arc::new(InMemoryEventBus::new(64));
        let catalog = Arc::new(PipelineCatalog::new(
            Arc::new(InMemoryPipelineRepository::new()),
            bus.clone(),
        ));
        Scheduler::new(
            catalog,
            Arc::new(InstanceStateStore::new(bus)),
            Arc::new(ApprovalGateManager::new()),
            Arc::new(AcceptingAgent),
            Arc::new(NoSources),
            SchedulerConfig::default(),
        )
    }

    fn definition() -> PipelineDefinition {
        PipelineDefinition {
            id: PipelineId::new(),
            label: "web".to_string(),
            description: None,
            stages: vec![StageDefinition {
                id: StageId::new("build"),
                label: None,
                order: 0,
                jobs: vec![JobDefinition {
                    id: JobId::new("compile"),
                    label: None,
                    order: 0,
                    task_groups: vec![],
                    platform: Platform::Shell,
                }],
                stage_trigger: Default::default(),
                required_approvals: 0,
                webhooks: vec![],
            }],
            sources: vec![],
        }
    }

    fn tracked(scheduler: &Scheduler) -> (usize, usize) {
        let locks = scheduler.locks.lock().unwrap().len();
        let resolved = scheduler.resolved.lock().unwrap().len();
        (locks, resolved)
    }

    #[tokio::test]
    async fn test_finished_instances_hold_no_locks() {
        let scheduler = scheduler();
        let pipeline = scheduler.catalog().save(definition()).await.unwrap();

        let cancelled = scheduler.start(pipeline.id, None).await.unwrap();
        scheduler.cancel(cancelled.id, None).await.unwrap();
        assert_eq!(tracked(&scheduler), (0, 0));

        let err = scheduler.cancel(cancelled.id, None).await.unwrap_err();
        assert!(matches!(err, Error::InstanceTerminated(_)));
        assert_eq!(tracked(&scheduler), (0, 0));

        let finished = scheduler.start(pipeline.id, None).await.unwrap();
        let job = scheduler.instance_jobs(finished.id).await.unwrap().remove(0);
        let epoch = Utc::now().timestamp_millis();
        scheduler
            .report_state(job.id, JobState::Succeeded, epoch, None)
            .await
            .unwrap();
        scheduler
            .report_state(job.id, JobState::Failed, epoch + 1, None)
            .await
            .unwrap();
        assert!(scheduler.store().instance(finished.id).await.unwrap().is_terminal());
        assert_eq!(tracked(&scheduler), (0, 0));
    }
}

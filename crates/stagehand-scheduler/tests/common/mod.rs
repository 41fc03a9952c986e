//! Shared fixtures and port doubles for engine tests.

#![allow(dead_code)]

use async_trait::async_trait;
use stagehand_core::ids::{JobId, JobInstanceId, PipelineId, PipelineInstanceId, StageId};
use stagehand_core::instance::{JobInstance, JobState};
use stagehand_core::pipeline::{
    GitSource, JobDefinition, Pipeline, PipelineDefinition, Platform, SourceDefinition,
    StageDefinition,
};
use stagehand_core::ports::{Ack, AgentDispatch, DispatchRequest, ResolvedSource, SourceResolver};
use stagehand_core::{Error, Result};
use stagehand_scheduler::{
    ApprovalGateManager, InMemoryEventBus, InMemoryPipelineRepository, InstanceStateStore,
    PipelineCatalog, Scheduler, SchedulerConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,stagehand_scheduler=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Accepts every dispatch and records it.
#[derive(Default)]
pub struct RecordingAgent {
    requests: Mutex<Vec<DispatchRequest>>,
    cancelled: Mutex<Vec<JobInstanceId>>,
}

impl RecordingAgent {
    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<JobInstanceId> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentDispatch for RecordingAgent {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<Ack> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(Ack::accepted("recording-agent"))
    }

    async fn cancel(&self, job_instance_id: JobInstanceId) -> Result<()> {
        self.cancelled.lock().unwrap().push(job_instance_id);
        Ok(())
    }
}

/// Rejects every dispatch.
#[derive(Default)]
pub struct UnreachableAgent {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl AgentDispatch for UnreachableAgent {
    async fn dispatch(&self, _request: &DispatchRequest) -> Result<Ack> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(Error::Dispatch("agent unreachable".to_string()))
    }

    async fn cancel(&self, _job_instance_id: JobInstanceId) -> Result<()> {
        Err(Error::Dispatch("agent unreachable".to_string()))
    }
}

/// Fails the first dispatch and accepts the rest.
#[derive(Default)]
pub struct FailsOnceAgent {
    pub dispatches: AtomicUsize,
    cancelled: Mutex<Vec<JobInstanceId>>,
}

impl FailsOnceAgent {
    pub fn cancelled(&self) -> Vec<JobInstanceId> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentDispatch for FailsOnceAgent {
    async fn dispatch(&self, _request: &DispatchRequest) -> Result<Ack> {
        if self.dispatches.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(Error::Dispatch("agent busy".to_string()));
        }
        Ok(Ack::accepted("fails-once-agent"))
    }

    async fn cancel(&self, job_instance_id: JobInstanceId) -> Result<()> {
        self.cancelled.lock().unwrap().push(job_instance_id);
        Ok(())
    }
}

/// Resolves every source to a fixed checkout, or fails when configured to.
#[derive(Default)]
pub struct StaticResolver {
    pub fail: bool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl SourceResolver for StaticResolver {
    async fn resolve(
        &self,
        instance_id: PipelineInstanceId,
        sources: &[SourceDefinition],
    ) -> Result<Vec<ResolvedSource>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::SourceResolution("repository not found".to_string()));
        }
        Ok(sources
            .iter()
            .map(|SourceDefinition::Git(git)| ResolvedSource {
                url: git.url.clone(),
                path: format!("/workspace/{}/{}", instance_id, git.target_path),
                revision: Some("abc123".to_string()),
            })
            .collect())
    }
}

pub struct Engine {
    pub scheduler: Arc<Scheduler>,
    pub bus: Arc<InMemoryEventBus>,
}

impl Engine {
    pub fn new(agent: Arc<dyn AgentDispatch>, resolver: Arc<dyn SourceResolver>) -> Self {
        Self::with_config(agent, resolver, fast_config())
    }

    pub fn with_config(
        agent: Arc<dyn AgentDispatch>,
        resolver: Arc<dyn SourceResolver>,
        config: SchedulerConfig,
    ) -> Self {
        init_test_logging();
        let bus = Arc::new(InMemoryEventBus::new(1024));
        let catalog = Arc::new(PipelineCatalog::new(
            Arc::new(InMemoryPipelineRepository::new()),
            bus.clone(),
        ));
        let store = Arc::new(InstanceStateStore::new(bus.clone()));
        let scheduler = Scheduler::new(
            catalog,
            store,
            Arc::new(ApprovalGateManager::new()),
            agent,
            resolver,
            config,
        );
        Self { scheduler, bus }
    }

    pub async fn save(&self, definition: PipelineDefinition) -> Pipeline {
        self.scheduler
            .catalog()
            .save(definition)
            .await
            .expect("save pipeline")
    }

    pub async fn jobs_in_stage(&self, instance: PipelineInstanceId, stage: &str) -> Vec<JobInstance> {
        self.scheduler
            .instance_jobs(instance)
            .await
            .expect("instance jobs")
            .into_iter()
            .filter(|j| j.stage.as_str() == stage)
            .collect()
    }

    /// Report a state for every job of a stage.
    pub async fn report_stage(&self, instance: PipelineInstanceId, stage: &str, state: JobState) {
        for job in self.jobs_in_stage(instance, stage).await {
            self.scheduler
                .report_state(job.id, state, now_epoch(), None)
                .await
                .expect("report state");
        }
    }
}

pub fn fast_config() -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    config.dispatch.max_attempts = 3;
    config.dispatch.initial_backoff_ms = 1;
    config.dispatch.max_backoff_ms = 5;
    config.dispatch.ack_timeout_ms = 500;
    config
}

pub fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn job(id: &str) -> JobDefinition {
    JobDefinition {
        id: JobId::new(id),
        label: None,
        order: 0,
        task_groups: vec![],
        platform: Platform::Shell,
    }
}

pub fn stage(id: &str, order: u32, triggers: &[&str], approvals: u32, jobs: &[&str]) -> StageDefinition {
    StageDefinition {
        id: StageId::new(id),
        label: None,
        order,
        jobs: jobs.iter().map(|j| job(j)).collect(),
        stage_trigger: triggers.iter().map(|t| StageId::new(*t)).collect(),
        required_approvals: approvals,
        webhooks: vec![],
    }
}

pub fn pipeline(stages: Vec<StageDefinition>) -> PipelineDefinition {
    PipelineDefinition {
        id: PipelineId::new(),
        label: "service".to_string(),
        description: None,
        stages,
        sources: vec![],
    }
}

pub fn git_source() -> SourceDefinition {
    SourceDefinition::Git(GitSource {
        url: "https://example.com/service.git".to_string(),
        target_path: "service".to_string(),
        branch: Some("main".to_string()),
        depth: Some(1),
    })
}

/// Poll until the condition holds or the timeout expires.
pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

//! Dispatch failures, source failures, watchdog timeouts and cancellation.

mod common;

use common::*;
use stagehand_core::Error;
use stagehand_core::ids::StageId;
use stagehand_core::instance::{FailureReason, JobState, PipelineInstanceState, StageStatus};
use stagehand_scheduler::{SchedulerConfig, Watchdog};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn test_dispatch_exhaustion_fails_job_and_blocks_downstream() {
    let agent = Arc::new(UnreachableAgent::default());
    let engine = Engine::new(agent.clone(), Arc::new(StaticResolver::default()));
    let pipeline = engine
        .save(pipeline(vec![
            stage("build", 0, &[], 0, &["compile"]),
            stage("deploy", 1, &["build"], 0, &["ship"]),
        ]))
        .await;
    let instance = engine.scheduler.start(pipeline.id, None).await.unwrap();

    let instance_id = instance.id;
    let scheduler = engine.scheduler.clone();
    let finished = wait_for(Duration::from_secs(5), || {
        let scheduler = scheduler.clone();
        async move {
            scheduler
                .store()
                .instance(instance_id)
                .await
                .map(|i| i.is_terminal())
                .unwrap_or(false)
        }
    })
    .await;
    assert!(finished, "run should fail after dispatch retries");

    let job = engine.jobs_in_stage(instance.id, "build").await.remove(0);
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.reason, Some(FailureReason::DispatchError));
    assert!(job.message.unwrap().contains("agent unreachable"));
    assert_eq!(agent.attempts.load(Ordering::SeqCst), 3);

    let views = engine.scheduler.stage_statuses(instance.id).await.unwrap();
    assert_eq!(views[1].status, StageStatus::Blocked);
    let stored = engine.scheduler.store().instance(instance.id).await.unwrap();
    assert_eq!(stored.state, PipelineInstanceState::Failed);
}

#[tokio::test]
async fn test_source_resolution_failure_fails_jobs() {
    let resolver = Arc::new(StaticResolver {
        fail: true,
        ..Default::default()
    });
    let agent = Arc::new(RecordingAgent::default());
    let engine = Engine::new(agent.clone(), resolver.clone());
    let mut definition = pipeline(vec![stage("build", 0, &[], 0, &["compile", "docs"])]);
    definition.sources.push(git_source());
    let pipeline = engine.save(definition).await;

    let instance = engine.scheduler.start(pipeline.id, None).await.unwrap();

    let instance_id = instance.id;
    let scheduler = engine.scheduler.clone();
    let failed = wait_for(Duration::from_secs(5), || {
        let scheduler = scheduler.clone();
        async move {
            scheduler
                .store()
                .instance(instance_id)
                .await
                .map(|i| i.state == PipelineInstanceState::Failed)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(failed);

    for job in engine.jobs_in_stage(instance.id, "build").await {
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.reason, Some(FailureReason::SourceResolutionError));
    }
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    assert!(agent.requests().is_empty());
}

#[tokio::test]
async fn test_resolved_sources_attached_to_dispatch() {
    let agent = Arc::new(RecordingAgent::default());
    let engine = Engine::new(agent.clone(), Arc::new(StaticResolver::default()));
    let mut definition = pipeline(vec![stage("build", 0, &[], 0, &["compile"])]);
    definition.sources.push(git_source());
    let pipeline = engine.save(definition).await;

    engine.scheduler.start(pipeline.id, None).await.unwrap();

    let dispatched = wait_for(Duration::from_secs(2), || {
        let agent = agent.clone();
        async move { !agent.requests().is_empty() }
    })
    .await;
    assert!(dispatched);

    let request = agent.requests().remove(0);
    assert_eq!(request.job.id.as_str(), "compile");
    assert_eq!(request.sources.len(), 1);
    assert_eq!(request.sources[0].url, "https://example.com/service.git");
    assert_eq!(request.sources[0].revision.as_deref(), Some("abc123"));
}

#[tokio::test]
async fn test_watchdog_times_out_silent_jobs() {
    let mut config = fast_config();
    config.watchdog.job_timeout_secs = 0;
    let engine = Engine::with_config(
        Arc::new(RecordingAgent::default()),
        Arc::new(StaticResolver::default()),
        config,
    );
    let pipeline = engine
        .save(pipeline(vec![
            stage("build", 0, &[], 0, &["compile"]),
            stage("pause", 1, &[], 0, &["hold"]),
        ]))
        .await;
    let instance = engine.scheduler.start(pipeline.id, None).await.unwrap();

    let hold = engine.jobs_in_stage(instance.id, "pause").await.remove(0);
    engine
        .scheduler
        .report_state(hold.id, JobState::Frozen, now_epoch() + 1_000, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let watchdog = Watchdog::new(engine.scheduler.clone());
    assert_eq!(watchdog.scan().await, 1);

    let compile = engine.jobs_in_stage(instance.id, "build").await.remove(0);
    assert_eq!(compile.state, JobState::Failed);
    assert_eq!(compile.reason, Some(FailureReason::Timeout));

    let hold = engine.scheduler.store().job_instance(hold.id).await.unwrap();
    assert_eq!(hold.state, JobState::Frozen);
    let stored = engine.scheduler.store().instance(instance.id).await.unwrap();
    assert_eq!(stored.state, PipelineInstanceState::Running);
}

#[tokio::test]
async fn test_watchdog_loop_stops_on_shutdown() {
    let mut config = SchedulerConfig::default();
    config.watchdog.scan_interval_secs = 1;
    let engine = Engine::with_config(
        Arc::new(RecordingAgent::default()),
        Arc::new(StaticResolver::default()),
        config,
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = Watchdog::new(engine.scheduler.clone()).spawn(shutdown_rx);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("watchdog stops")
        .unwrap();
}

#[tokio::test]
async fn test_cancel_during_dispatch_backoff_stops_retries() {
    let agent = Arc::new(FailsOnceAgent::default());
    let mut config = fast_config();
    config.dispatch.initial_backoff_ms = 300;
    config.dispatch.max_backoff_ms = 300;
    let engine = Engine::with_config(agent.clone(), Arc::new(StaticResolver::default()), config);
    let pipeline = engine
        .save(pipeline(vec![stage("build", 0, &[], 0, &["compile"])]))
        .await;
    let instance = engine.scheduler.start(pipeline.id, None).await.unwrap();

    let first_attempt = wait_for(Duration::from_secs(2), || {
        let agent = agent.clone();
        async move { agent.dispatches.load(Ordering::SeqCst) == 1 }
    })
    .await;
    assert!(first_attempt);

    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.scheduler.cancel(instance.id, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(agent.dispatches.load(Ordering::SeqCst), 1);
    assert_eq!(agent.cancelled().len(), 1);
    let job = engine.jobs_in_stage(instance.id, "build").await.remove(0);
    assert_eq!(job.state, JobState::Cancelled);
}

#[tokio::test]
async fn test_cancel_marks_jobs_and_stops_progress() {
    let agent = Arc::new(RecordingAgent::default());
    let engine = Engine::new(agent.clone(), Arc::new(StaticResolver::default()));
    let pipeline = engine
        .save(pipeline(vec![
            stage("build", 0, &[], 0, &["compile", "assets"]),
            stage("deploy", 1, &["build"], 1, &["ship"]),
        ]))
        .await;
    let instance = engine.scheduler.start(pipeline.id, None).await.unwrap();

    let cancelled = engine
        .scheduler
        .cancel(instance.id, Some("alice".to_string()))
        .await
        .unwrap();
    assert_eq!(cancelled.state, PipelineInstanceState::Cancelled);
    assert_eq!(cancelled.cancelled_by.as_deref(), Some("alice"));

    let jobs = engine.jobs_in_stage(instance.id, "build").await;
    assert_eq!(jobs.len(), 2);
    for job in &jobs {
        assert_eq!(job.state, JobState::Cancelled);
        assert_eq!(job.reason, Some(FailureReason::Cancelled));
    }

    // Late reports and approvals change nothing.
    let outcome = engine
        .scheduler
        .report_state(jobs[0].id, JobState::Succeeded, now_epoch(), None)
        .await
        .unwrap();
    assert!(!outcome.is_applied());
    let err = engine
        .scheduler
        .approve(pipeline.id, instance.id, &StageId::new("deploy"), "bob")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InstanceTerminated(_)));
    assert!(engine.jobs_in_stage(instance.id, "deploy").await.is_empty());

    let err = engine.scheduler.cancel(instance.id, None).await.unwrap_err();
    assert!(matches!(err, Error::InstanceTerminated(_)));

    let requested = wait_for(Duration::from_secs(2), || {
        let agent = agent.clone();
        async move { agent.cancelled().len() == 2 }
    })
    .await;
    assert!(requested, "agent should receive cancel requests");

    let views = engine.scheduler.stage_statuses(instance.id).await.unwrap();
    assert_eq!(views[0].status, StageStatus::Cancelled);
    assert_eq!(views[1].status, StageStatus::Blocked);
}

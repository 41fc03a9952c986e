//! Integration tests against a real NATS server.
//!
//! Requires docker. Run with: `cargo test -p stagehand-nats --features integration`

#![cfg(feature = "integration")]

use futures::StreamExt;
use stagehand_core::events::{Action, Entity, LiveEvent};
use stagehand_core::ids::{JobId, PipelineId, PipelineInstanceId, StageId};
use stagehand_core::instance::{JobInstance, JobState};
use stagehand_core::pipeline::{JobDefinition, Platform};
use stagehand_core::ports::{Ack, AgentDispatch, DispatchRequest, EventBus, StateReport};
use stagehand_nats::{
    NatsAgentDispatch, NatsConfig, NatsConnection, NatsEventBus, NatsReportListener,
};
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;
use tokio_test::{assert_err, assert_ok};

struct Server {
    _container: ContainerAsync<Nats>,
    url: String,
}

async fn start_server() -> Server {
    let container = Nats::default()
        .with_tag("2.10-alpine")
        .start()
        .await
        .expect("start nats container");
    let host = container.get_host().await.expect("host");
    let port = container.get_host_port_ipv4(4222).await.expect("port");
    Server {
        _container: container,
        url: format!("nats://{}:{}", host, port),
    }
}

async fn connect(server: &Server) -> NatsConnection {
    let config = NatsConfig::new(&server.url)
        .with_subject_prefix("test")
        .with_request_timeout(Duration::from_millis(500));
    NatsConnection::connect_with_config(config)
        .await
        .expect("connect")
}

fn job_instance() -> JobInstance {
    JobInstance::new(
        PipelineId::new(),
        PipelineInstanceId::new(),
        StageId::new("build"),
        JobId::new("compile"),
    )
}

fn dispatch_request() -> DispatchRequest {
    DispatchRequest {
        job_instance: job_instance(),
        job: JobDefinition {
            id: JobId::new("compile"),
            label: None,
            order: 0,
            task_groups: vec![],
            platform: Platform::Docker,
        },
        sources: vec![],
    }
}

/// Answer every dispatch on the docker subject with the given ack.
async fn spawn_agent(connection: &NatsConnection, ack: Ack) {
    let client = connection.client().clone();
    let mut requests = client
        .queue_subscribe("test.dispatch.docker".to_string(), "agents".to_string())
        .await
        .expect("agent subscribe");
    client.flush().await.expect("flush");
    tokio::spawn(async move {
        while let Some(message) = requests.next().await {
            if let Some(reply) = message.reply {
                let payload = serde_json::to_vec(&ack).unwrap();
                let _ = client.publish(reply, payload.into()).await;
            }
        }
    });
}

#[tokio::test]
async fn test_live_events_filtered_by_entity() {
    let server = start_server().await;
    let bus = NatsEventBus::new(connect(&server).await);

    let mut jobs = bus.subscribe(&[Entity::JobInstance]).await.expect("subscribe");
    bus.connection().client().flush().await.expect("flush");

    let job = job_instance();
    let pipeline_event = LiveEvent::new(Entity::Pipeline, Action::Create, &serde_json::json!({}))
        .unwrap();
    bus.publish(pipeline_event).await.expect("publish pipeline");
    bus.publish(LiveEvent::job_instance(Action::Update, &job).unwrap())
        .await
        .expect("publish job");

    let received = tokio::time::timeout(Duration::from_secs(5), jobs.next())
        .await
        .expect("event within timeout")
        .expect("stream open")
        .expect("decodes");
    assert_eq!(received.entity, Entity::JobInstance);
    assert_eq!(received.action, Action::Update);
    assert_eq!(received.result["id"], job.id.as_uuid().to_string());

    assert_eq!(bus.metrics().snapshot().events_published, 2);
    assert!(bus.health_check().status.is_healthy());
}

#[tokio::test]
async fn test_dispatch_acknowledged_by_agent() {
    let server = start_server().await;
    let connection = connect(&server).await;
    spawn_agent(&connection, Ack::accepted("docker-agent-1")).await;

    let dispatch = NatsAgentDispatch::new(connection.clone());
    let ack = assert_ok!(dispatch.dispatch(&dispatch_request()).await);
    assert!(ack.accepted);
    assert_eq!(ack.agent.as_deref(), Some("docker-agent-1"));
    assert_eq!(connection.metrics().snapshot().dispatch_failures, 0);
}

#[tokio::test]
async fn test_dispatch_rejected_or_unanswered() {
    let server = start_server().await;
    let connection = connect(&server).await;
    let dispatch = NatsAgentDispatch::new(connection.clone());

    // Nobody listening yet.
    assert_err!(dispatch.dispatch(&dispatch_request()).await);

    spawn_agent(&connection, Ack::rejected("no capacity")).await;
    let err = dispatch.dispatch(&dispatch_request()).await.unwrap_err();
    assert!(err.to_string().contains("no capacity"));

    let snapshot = connection.metrics().snapshot();
    assert_eq!(snapshot.dispatch_requests, 2);
    assert_eq!(snapshot.dispatch_failures, 2);
}

#[tokio::test]
async fn test_reports_reach_listener() {
    let server = start_server().await;
    let connection = connect(&server).await;
    let listener = NatsReportListener::new(connection.clone());
    let mut reports = listener.subscribe().await.expect("subscribe");
    connection.client().flush().await.expect("flush");

    let job = job_instance();
    let subjects = connection.subjects().clone();
    let client = connection.client().clone();

    // Malformed first; the listener must skip it.
    client
        .publish(subjects.report(job.id), "not json".into())
        .await
        .unwrap();
    let report = StateReport {
        job_instance_id: job.id,
        state: JobState::Succeeded,
        epoch: 42,
        message: Some("done".to_string()),
    };
    client
        .publish(subjects.report(job.id), serde_json::to_vec(&report).unwrap().into())
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), reports.next())
        .await
        .expect("report within timeout")
        .expect("stream open");
    assert_eq!(received.job_instance_id, job.id);
    assert_eq!(received.epoch, 42);
    assert_eq!(connection.metrics().snapshot().reports_malformed, 1);
}

#[tokio::test]
async fn test_shutdown_stops_publishing() {
    let server = start_server().await;
    let bus = NatsEventBus::new(connect(&server).await);

    assert_ok!(bus.shutdown().await);
    let event = LiveEvent::job_instance(Action::Update, &job_instance()).unwrap();
    assert_err!(bus.publish(event).await);
}

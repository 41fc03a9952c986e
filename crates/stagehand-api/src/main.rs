//! `stagehandd`: the Stagehand orchestration server.

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use stagehand_api::config::EventBusKind;
use stagehand_api::{AppState, QueueDispatch, ServerConfig, build_app, telemetry};
use stagehand_core::ports::{AgentDispatch, EventBus};
use stagehand_nats::{
    NatsAgentDispatch, NatsConnection, NatsEventBus, NatsReportListener, ReportStream,
};
use stagehand_scheduler::{
    ApprovalGateManager, GitSourceResolver, InMemoryEventBus, InMemoryPipelineRepository,
    InstanceStateStore, PipelineCatalog, Scheduler, Watchdog,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "stagehandd")]
#[command(author, version, about = "Stagehand pipeline orchestrator", long_about = None)]
struct Cli {
    /// Config file (YAML or TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Address to listen on, overriding the config file.
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = ServerConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    telemetry::init_tracing(&config.log_level, config.log_format);

    let (event_bus, agent, queue, nats): (
        Arc<dyn EventBus>,
        Arc<dyn AgentDispatch>,
        Option<Arc<QueueDispatch>>,
        Option<NatsConnection>,
    ) = match config.event_bus {
        EventBusKind::Memory => {
            let queue = Arc::new(QueueDispatch::new());
            (
                Arc::new(InMemoryEventBus::new(config.scheduler.event_capacity())),
                queue.clone(),
                Some(queue),
                None,
            )
        }
        EventBusKind::Nats => {
            let connection = NatsConnection::connect_with_config(config.nats.to_nats_config())
                .await
                .context("connecting to NATS")?;
            (
                Arc::new(NatsEventBus::new(connection.clone())),
                Arc::new(NatsAgentDispatch::new(connection.clone())),
                None,
                Some(connection),
            )
        }
    };

    let catalog = Arc::new(PipelineCatalog::new(
        Arc::new(InMemoryPipelineRepository::new()),
        event_bus.clone(),
    ));
    let scheduler = Scheduler::new(
        catalog.clone(),
        Arc::new(InstanceStateStore::new(event_bus.clone())),
        Arc::new(ApprovalGateManager::new()),
        agent,
        Arc::new(GitSourceResolver::new(&config.workspace_dir)),
        config.scheduler.clone(),
    );

    if let Some(dir) = &config.pipelines_dir {
        let loaded = catalog
            .load_dir(dir)
            .await
            .with_context(|| format!("loading pipelines from {}", dir.display()))?;
        info!(count = loaded.len(), dir = %dir.display(), "Pipelines loaded");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watchdog = Watchdog::new(scheduler.clone()).spawn(shutdown_rx.clone());

    let mut state = AppState::new(scheduler.clone(), event_bus);
    if let Some(queue) = queue {
        state = state.with_queue(queue);
    }
    let reports = match &nats {
        Some(connection) => {
            state = state.with_nats(connection.clone());
            let stream = NatsReportListener::new(connection.clone())
                .subscribe()
                .await
                .context("subscribing to agent reports")?;
            Some(tokio::spawn(forward_reports(
                stream,
                scheduler.clone(),
                shutdown_rx.clone(),
            )))
        }
        None => None,
    };

    let app = build_app(Arc::new(state));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, bus = ?config.event_bus, "Stagehand listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    let _ = watchdog.await;
    if let Some(reports) = reports {
        let _ = reports.await;
    }
    if let Some(connection) = nats {
        connection.shutdown().await?;
    }
    Ok(())
}

/// Apply agent reports received over NATS until shutdown.
async fn forward_reports(
    mut reports: ReportStream,
    scheduler: Arc<Scheduler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            report = reports.next() => {
                let Some(report) = report else {
                    warn!("Agent report subscription closed");
                    break;
                };
                if let Err(e) = scheduler
                    .report_state(report.job_instance_id, report.state, report.epoch, report.message)
                    .await
                {
                    warn!(
                        job_instance_id = %report.job_instance_id,
                        error = %e,
                        "Failed to apply agent report"
                    );
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

use crate::config::NatsConfig;
use crate::health::HealthCheck;
use crate::metrics::NatsMetrics;
use crate::subjects::Subjects;
use stagehand_core::{Error, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

/// A NATS client plus the settings and counters every adapter shares.
#[derive(Clone)]
pub struct NatsConnection {
    client: async_nats::Client,
    config: Arc<NatsConfig>,
    subjects: Subjects,
    metrics: Arc<NatsMetrics>,
}

impl NatsConnection {
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(NatsConfig::new(url)).await
    }

    pub async fn connect_with_config(config: NatsConfig) -> Result<Self> {
        let urls = config.server_list();
        info!(urls = %urls, prefix = %config.subject_prefix, "Connecting to NATS");

        let metrics = NatsMetrics::new();
        let events = metrics.clone();
        let reconnect_wait = config.reconnect_wait;

        let client = async_nats::ConnectOptions::new()
            .name(&config.client_name)
            .connection_timeout(config.connection_timeout)
            .request_timeout(Some(config.request_timeout))
            .max_reconnects(config.max_reconnect_attempts)
            .reconnect_delay_callback(move |attempts| reconnect_wait * attempts.min(5) as u32)
            .event_callback(move |event| {
                let metrics = events.clone();
                async move {
                    match event {
                        async_nats::Event::Connected => {
                            metrics.set_connected(true);
                            info!("NATS connection established");
                        }
                        async_nats::Event::Disconnected => {
                            metrics.set_connected(false);
                            metrics.record_reconnect();
                            warn!("NATS connection lost, reconnecting");
                        }
                        other => warn!(event = ?other, "NATS client event"),
                    }
                }
            })
            .retry_on_initial_connect()
            .connect(&urls)
            .await
            .map_err(|e| Error::EventBus(format!("Failed to connect to NATS: {}", e)))?;

        metrics.set_connected(true);
        info!("Connected to NATS");

        Ok(Self {
            client,
            subjects: Subjects::new(config.subject_prefix.clone()),
            config: Arc::new(config),
            metrics,
        })
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    pub fn subjects(&self) -> &Subjects {
        &self.subjects
    }

    pub fn metrics(&self) -> &Arc<NatsMetrics> {
        &self.metrics
    }

    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    pub fn health_check(&self) -> HealthCheck {
        HealthCheck::from_metrics(&self.metrics, self.is_connected())
    }

    /// Flush pending publishes and close the connection.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Draining NATS connection");
        if let Err(e) = self.client.drain().await {
            error!("Error draining NATS connection: {}", e);
        }
        self.metrics.set_connected(false);
        Ok(())
    }
}

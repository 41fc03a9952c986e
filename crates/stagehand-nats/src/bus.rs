//! Live event bus on core NATS subjects.
//!
//! Live deltas are fire-and-forget: clients fetch a snapshot when they
//! connect, so nothing is persisted and no stream is created.

use crate::connection::NatsConnection;
use crate::health::HealthCheck;
use crate::metrics::NatsMetrics;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use stagehand_core::events::{Entity, LiveEvent};
use stagehand_core::ports::{EventBus, EventStream};
use stagehand_core::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

#[derive(Clone)]
pub struct NatsEventBus {
    connection: NatsConnection,
    shutdown: Arc<AtomicBool>,
}

impl NatsEventBus {
    pub fn new(connection: NatsConnection) -> Self {
        Self {
            connection,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        Ok(Self::new(NatsConnection::connect(url).await?))
    }

    pub fn connection(&self) -> &NatsConnection {
        &self.connection
    }

    pub fn metrics(&self) -> &Arc<NatsMetrics> {
        self.connection.metrics()
    }

    pub fn health_check(&self) -> HealthCheck {
        self.connection.health_check()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stop publishing and drain the underlying connection.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.connection.shutdown().await
    }
}

#[async_trait]
impl EventBus for NatsEventBus {
    async fn publish(&self, event: LiveEvent) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::EventBus(
                "Cannot publish: shutdown in progress".to_string(),
            ));
        }

        let subject = self.connection.subjects().live(&event);
        let payload = serde_json::to_vec(&event)?;
        let payload_len = payload.len() as u64;
        debug!(subject = %subject, "Publishing live event");

        match self
            .connection
            .client()
            .publish(subject.clone(), payload.into())
            .await
        {
            Ok(()) => {
                self.metrics().record_publish(payload_len);
                Ok(())
            }
            Err(e) => {
                self.metrics().record_publish_failure();
                Err(Error::EventBus(format!(
                    "Failed to publish to {}: {}",
                    subject, e
                )))
            }
        }
    }

    async fn subscribe(&self, entities: &[Entity]) -> Result<EventStream> {
        let entities = if entities.is_empty() {
            &Entity::ALL[..]
        } else {
            entities
        };

        let mut streams: Vec<BoxStream<'static, async_nats::Message>> = Vec::new();
        for entity in entities {
            let subject = self.connection.subjects().live_entity(*entity);
            debug!(subject = %subject, "Subscribing to live events");
            let subscriber = self
                .connection
                .client()
                .subscribe(subject.clone())
                .await
                .map_err(|e| Error::EventBus(format!("Failed to subscribe to {}: {}", subject, e)))?;
            streams.push(subscriber.boxed());
        }

        let metrics = self.metrics().clone();
        let shutdown = self.shutdown.clone();
        let events = stream::select_all(streams)
            .take_while(move |_| {
                let running = !shutdown.load(Ordering::SeqCst);
                async move { running }
            })
            .map(move |message| {
                metrics.record_receive(message.payload.len() as u64);
                serde_json::from_slice::<LiveEvent>(&message.payload).map_err(Error::from)
            });

        Ok(Box::pin(events))
    }
}

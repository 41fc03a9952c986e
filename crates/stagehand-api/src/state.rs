//! Application state shared across handlers.

use crate::queue::QueueDispatch;
use stagehand_core::ports::EventBus;
use stagehand_nats::{HealthCheck, NatsConnection};
use stagehand_scheduler::Scheduler;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub event_bus: Arc<dyn EventBus>,
    /// Present when agents pull work over HTTP.
    pub queue: Option<Arc<QueueDispatch>>,
    /// Present when running against NATS.
    pub nats: Option<NatsConnection>,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            scheduler,
            event_bus,
            queue: None,
            nats: None,
        }
    }

    pub fn with_queue(mut self, queue: Arc<QueueDispatch>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_nats(mut self, connection: NatsConnection) -> Self {
        self.nats = Some(connection);
        self
    }

    pub fn nats_health(&self) -> Option<HealthCheck> {
        self.nats.as_ref().map(NatsConnection::health_check)
    }
}

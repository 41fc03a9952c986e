//! In-process event bus backed by a tokio broadcast channel.

use async_trait::async_trait;
use stagehand_core::events::{Entity, LiveEvent};
use stagehand_core::ports::{EventBus, EventStream};
use stagehand_core::{Error, Result};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Event bus for a single process. Slow subscribers skip missed events
/// rather than blocking publishers.
pub struct InMemoryEventBus {
    sender: Mutex<Option<broadcast::Sender<LiveEvent>>>,
}

impl InMemoryEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Close the bus. Open subscriptions end once drained.
    pub fn close(&self) {
        self.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock()
            .as_ref()
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, Option<broadcast::Sender<LiveEvent>>> {
        self.sender.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: LiveEvent) -> Result<()> {
        let guard = self.lock();
        let sender = guard
            .as_ref()
            .ok_or_else(|| Error::EventBus("event bus is closed".to_string()))?;

        let subject = event.subject();
        match sender.send(event) {
            Ok(receivers) => debug!(subject = %subject, receivers, "Published event"),
            Err(_) => debug!(subject = %subject, "Published event with no subscribers"),
        }
        Ok(())
    }

    async fn subscribe(&self, entities: &[Entity]) -> Result<EventStream> {
        let receiver = self
            .lock()
            .as_ref()
            .map(|s| s.subscribe())
            .ok_or_else(|| Error::EventBus("event bus is closed".to_string()))?;
        let entities = entities.to_vec();

        let stream = futures::stream::unfold(receiver, move |mut receiver| {
            let entities = entities.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) if entities.is_empty() || entities.contains(&event.entity) => {
                            return Some((Ok(event), receiver));
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Subscriber lagged, events dropped");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

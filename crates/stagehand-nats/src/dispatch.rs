//! Agent dispatch over NATS request/reply.
//!
//! Agents for a platform form a queue group on `<prefix>.dispatch.<platform>`
//! and answer each request with an [`Ack`]. A rejected, unanswered or
//! undecodable reply counts as a failed attempt; retrying is left to the
//! caller.

use crate::connection::NatsConnection;
use crate::metrics::LatencyTimer;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagehand_core::ids::JobInstanceId;
use stagehand_core::ports::{Ack, AgentDispatch, DispatchRequest};
use stagehand_core::{Error, Result};
use tracing::{debug, info, warn};

/// Payload published on `<prefix>.cancel.<job_instance_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub job_instance_id: JobInstanceId,
    pub requested_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone)]
pub struct NatsAgentDispatch {
    connection: NatsConnection,
}

impl NatsAgentDispatch {
    pub fn new(connection: NatsConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl AgentDispatch for NatsAgentDispatch {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<Ack> {
        let subject = self.connection.subjects().dispatch(request.job.platform);
        let payload = serde_json::to_vec(request)?;
        let metrics = self.connection.metrics();
        metrics.record_dispatch(payload.len() as u64);

        let timer = LatencyTimer::start();
        let reply = match self
            .connection
            .client()
            .request(subject.clone(), payload.into())
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                metrics.record_dispatch_failure();
                return Err(Error::Dispatch(format!(
                    "No acknowledgement on {}: {}",
                    subject, e
                )));
            }
        };

        let ack: Ack = match serde_json::from_slice(&reply.payload) {
            Ok(ack) => ack,
            Err(e) => {
                metrics.record_dispatch_failure();
                return Err(Error::Dispatch(format!("Malformed acknowledgement: {}", e)));
            }
        };

        if !ack.accepted {
            metrics.record_dispatch_failure();
            let reason = ack.message.unwrap_or_else(|| "no reason given".to_string());
            warn!(
                job_instance_id = %request.job_instance.id,
                subject = %subject,
                reason = %reason,
                "Agent rejected dispatch"
            );
            return Err(Error::Dispatch(format!("Agent rejected job: {}", reason)));
        }

        debug!(
            job_instance_id = %request.job_instance.id,
            agent = ?ack.agent,
            latency_ms = timer.elapsed_ms(),
            "Dispatch acknowledged"
        );
        Ok(ack)
    }

    async fn cancel(&self, job_instance_id: JobInstanceId) -> Result<()> {
        let subject = self.connection.subjects().cancel(job_instance_id);
        let payload = serde_json::to_vec(&CancelRequest {
            job_instance_id,
            requested_at: chrono::Utc::now(),
        })?;

        self.connection
            .client()
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| Error::Dispatch(format!("Failed to publish to {}: {}", subject, e)))?;

        info!(job_instance_id = %job_instance_id, "Cancel requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_request_shape() {
        let id = JobInstanceId::new();
        let json = serde_json::to_value(CancelRequest {
            job_instance_id: id,
            requested_at: chrono::Utc::now(),
        })
        .unwrap();
        assert_eq!(json["job_instance_id"], id.as_uuid().to_string());
    }
}

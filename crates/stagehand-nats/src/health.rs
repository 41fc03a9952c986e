//! Readiness of the NATS connection.

use crate::metrics::NatsMetrics;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Connected, but publishes or dispatches have been failing.
    Degraded { reason: String },
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Healthy or degraded.
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    #[serde(flatten)]
    pub status: HealthStatus,
    pub connected: bool,
    pub reconnects: u64,
    pub publish_failures: u64,
    pub dispatch_failures: u64,
}

impl HealthCheck {
    pub fn from_metrics(metrics: &Arc<NatsMetrics>, connected: bool) -> Self {
        let snapshot = metrics.snapshot();

        let status = if !connected {
            HealthStatus::Unhealthy {
                reason: "Not connected to NATS".to_string(),
            }
        } else if snapshot.publish_failures > 0 {
            HealthStatus::Degraded {
                reason: format!("{} publish failures recorded", snapshot.publish_failures),
            }
        } else if snapshot.dispatch_requests > 0
            && snapshot.dispatch_failures == snapshot.dispatch_requests
        {
            HealthStatus::Degraded {
                reason: "No agent has acknowledged a dispatch".to_string(),
            }
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            connected,
            reconnects: snapshot.reconnects,
            publish_failures: snapshot.publish_failures,
            dispatch_failures: snapshot.dispatch_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnected_is_unhealthy() {
        let health = HealthCheck::from_metrics(&NatsMetrics::new(), false);
        assert!(!health.status.is_operational());
    }

    #[test]
    fn test_publish_failures_degrade() {
        let metrics = NatsMetrics::new();
        metrics.record_publish(1);
        assert!(HealthCheck::from_metrics(&metrics, true).status.is_healthy());

        metrics.record_publish_failure();
        let health = HealthCheck::from_metrics(&metrics, true);
        assert!(!health.status.is_healthy());
        assert!(health.status.is_operational());
    }

    #[test]
    fn test_all_dispatches_failing_degrades() {
        let metrics = NatsMetrics::new();
        metrics.record_dispatch(1);
        metrics.record_dispatch_failure();
        let health = HealthCheck::from_metrics(&metrics, true);
        assert!(matches!(health.status, HealthStatus::Degraded { .. }));

        metrics.record_dispatch(1);
        assert!(HealthCheck::from_metrics(&metrics, true).status.is_healthy());
    }

    #[test]
    fn test_serializes_flat() {
        let health = HealthCheck::from_metrics(&NatsMetrics::new(), true);
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["connected"], true);
    }
}

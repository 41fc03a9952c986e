//! Counters for the NATS adapters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct NatsMetrics {
    pub events_published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub events_received: AtomicU64,
    /// Dispatch requests sent to agents.
    pub dispatch_requests: AtomicU64,
    /// Requests that timed out, found no responder or were rejected.
    pub dispatch_failures: AtomicU64,
    pub reports_received: AtomicU64,
    /// Reports dropped because the payload did not decode.
    pub reports_malformed: AtomicU64,
    pub reconnects: AtomicU64,
    /// 0 = disconnected, 1 = connected.
    pub connected: AtomicU64,
    pub bytes_published: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl NatsMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_publish(&self, bytes: u64) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        self.bytes_published.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_receive(&self, bytes: u64) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self, bytes: u64) {
        self.dispatch_requests.fetch_add(1, Ordering::Relaxed);
        self.bytes_published.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_dispatch_failure(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_report(&self, bytes: u64) {
        self.reports_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_malformed_report(&self) {
        self.reports_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_published: self.events_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            dispatch_requests: self.dispatch_requests.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            reports_received: self.reports_received.load(Ordering::Relaxed),
            reports_malformed: self.reports_malformed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed) == 1,
            bytes_published: self.bytes_published.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`NatsMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub events_published: u64,
    pub publish_failures: u64,
    pub events_received: u64,
    pub dispatch_requests: u64,
    pub dispatch_failures: u64,
    pub reports_received: u64,
    pub reports_malformed: u64,
    pub reconnects: u64,
    pub connected: bool,
    pub bytes_published: u64,
    pub bytes_received: u64,
}

/// Measures request round-trips.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

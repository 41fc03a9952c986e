//! Connection settings for the NATS adapters.

use std::time::Duration;

/// Configuration for the NATS connection shared by all adapters.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// Server URLs; more than one for a cluster.
    pub urls: Vec<String>,
    /// Root token of every subject, e.g. `stagehand.live.job_instance.update`.
    pub subject_prefix: String,
    /// Client name reported to the server.
    pub client_name: String,
    /// Maximum reconnection attempts. `None` retries forever.
    pub max_reconnect_attempts: Option<usize>,
    pub reconnect_wait: Duration,
    pub connection_timeout: Duration,
    /// Upper bound on waiting for a request/reply answer.
    pub request_timeout: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            urls: vec!["nats://localhost:4222".to_string()],
            subject_prefix: "stagehand".to_string(),
            client_name: "stagehandd".to_string(),
            max_reconnect_attempts: None,
            reconnect_wait: Duration::from_secs(2),
            connection_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl NatsConfig {
    /// Create a new config with a single URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    /// Set multiple server URLs for cluster support.
    pub fn with_urls(mut self, urls: Vec<String>) -> Self {
        self.urls = urls;
        self
    }

    pub fn with_subject_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.subject_prefix = prefix.into();
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    /// Set max reconnection attempts.
    pub fn with_max_reconnects(mut self, max: usize) -> Self {
        self.max_reconnect_attempts = Some(max);
        self
    }

    pub fn with_reconnect_wait(mut self, wait: Duration) -> Self {
        self.reconnect_wait = wait;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Comma-joined server list as accepted by `async_nats`.
    pub fn server_list(&self) -> String {
        self.urls.join(",")
    }
}

//! Server configuration.
//!
//! Values are layered: built-in defaults, then an optional config file
//! (YAML or TOML, picked by extension), then `STAGEHAND__*` environment
//! variables, e.g. `STAGEHAND__NATS__URLS=nats://a:4222,nats://b:4222`.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use stagehand_nats::NatsConfig;
use stagehand_scheduler::SchedulerConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Default filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub log_format: LogFormat,
    pub event_bus: EventBusKind,
    pub nats: NatsSettings,
    pub scheduler: SchedulerConfig,
    /// Directory of YAML pipeline definitions loaded at startup.
    pub pipelines_dir: Option<PathBuf>,
    /// Root for source checkouts.
    pub workspace_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            event_bus: EventBusKind::Memory,
            nats: NatsSettings::default(),
            scheduler: SchedulerConfig::default(),
            pipelines_dir: None,
            workspace_dir: PathBuf::from("/var/lib/stagehand/workspace"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Transport for live events and agent traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventBusKind {
    /// In-process bus; agents pull work over HTTP.
    #[default]
    Memory,
    Nats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsSettings {
    pub urls: Vec<String>,
    pub subject_prefix: String,
    pub request_timeout_ms: u64,
    pub max_reconnects: Option<usize>,
}

impl Default for NatsSettings {
    fn default() -> Self {
        let defaults = NatsConfig::default();
        Self {
            urls: defaults.urls,
            subject_prefix: defaults.subject_prefix,
            request_timeout_ms: defaults.request_timeout.as_millis() as u64,
            max_reconnects: defaults.max_reconnect_attempts,
        }
    }
}

impl NatsSettings {
    pub fn to_nats_config(&self) -> NatsConfig {
        let mut config = NatsConfig::default()
            .with_urls(self.urls.clone())
            .with_subject_prefix(&self.subject_prefix)
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms));
        if let Some(max) = self.max_reconnects {
            config = config.with_max_reconnects(max);
        }
        config
    }
}

impl ServerConfig {
    /// Load defaults, the optional file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&ServerConfig::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder
            .add_source(
                Environment::with_prefix("STAGEHAND")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("nats.urls"),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.event_bus, EventBusKind::Memory);
        assert_eq!(config.scheduler.dispatch.max_attempts, 5);
        assert_eq!(config.nats.subject_prefix, "stagehand");
    }

    #[test]
    fn test_load_yaml_file_over_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "listen_addr: 127.0.0.1:9000\nlog_format: json\nevent_bus: nats\nnats:\n  subject_prefix: ci\nscheduler:\n  dispatch:\n    max_attempts: 2\n  watchdog:\n    job_timeout_secs: 60\npipelines_dir: /etc/stagehand/pipelines"
        )
        .unwrap();

        let config = ServerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.event_bus, EventBusKind::Nats);
        assert_eq!(config.nats.subject_prefix, "ci");
        assert_eq!(config.nats.urls, vec!["nats://localhost:4222".to_string()]);
        assert_eq!(config.scheduler.dispatch.max_attempts, 2);
        assert_eq!(config.scheduler.dispatch.ack_timeout_ms, 5_000);
        assert_eq!(config.scheduler.watchdog.job_timeout_secs, 60);
        assert_eq!(
            config.pipelines_dir,
            Some(PathBuf::from("/etc/stagehand/pipelines"))
        );
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(ServerConfig::load(Some(Path::new("/nonexistent/stagehand.yaml"))).is_err());
    }

    #[test]
    fn test_nats_settings_conversion() {
        let settings = NatsSettings {
            urls: vec!["nats://a:4222".to_string()],
            subject_prefix: "ci".to_string(),
            request_timeout_ms: 250,
            max_reconnects: Some(3),
        };
        let config = settings.to_nats_config();
        assert_eq!(config.server_list(), "nats://a:4222");
        assert_eq!(config.subject_prefix, "ci");
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.max_reconnect_attempts, Some(3));
    }
}

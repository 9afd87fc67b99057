//! YAML configuration for the sensor agent and the server.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Sensor agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub sensor_id: String,

    pub control: ControlClientConfig,

    pub ingest: IngestClientConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: f64,

    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,

    #[serde(default = "default_software_version")]
    pub software_version: String,

    #[serde(default)]
    pub time_sync: TimeSyncConfig,

    /// Bearer token presented on both the control and ingest channels.
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlClientConfig {
    /// WebSocket URL of the server control endpoint.
    pub url: String,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default = "default_ping_interval")]
    pub ping_interval: f64,

    #[serde(default = "default_ping_interval")]
    pub ping_timeout: f64,

    #[serde(default)]
    pub tls: TlsClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestClientConfig {
    /// HTTP URL of the chunk ingest endpoint.
    pub url: String,

    #[serde(default = "default_ingest_timeout")]
    pub timeout: f64,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub tls: TlsClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsClientConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Extra root certificate (PEM) trusted for this endpoint.
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,

    /// Accept any server certificate. Test rigs only.
    #[serde(default)]
    pub skip_verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_path")]
    pub path: PathBuf,

    #[serde(default = "default_retention_hours")]
    pub retention_hours: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: default_queue_path(),
            retention_hours: default_retention_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSyncConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_ntp_server")]
    pub ntp_server: String,

    #[serde(default)]
    pub fallback_skew_ms: f64,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ntp_server: default_ntp_server(),
            fallback_skew_ms: 0.0,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub ingest: IngestBindConfig,

    #[serde(default)]
    pub control: ControlBindConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    #[serde(default = "default_retention_hours")]
    pub retention_hours: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            retention_hours: default_retention_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_chunks")]
    pub max_chunks: u32,

    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,

    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_chunks: default_max_chunks(),
            max_bytes: default_max_bytes(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_stream_port")]
    pub port: u16,

    /// Observer bearer token; empty disables observer auth.
    #[serde(default)]
    pub token: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_stream_port(),
            token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestBindConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_ingest_port")]
    pub port: u16,

    /// CORS allow-list; `*` allows any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for IngestBindConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_ingest_port(),
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlBindConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_control_port")]
    pub port: u16,
}

impl Default for ControlBindConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_control_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub sensors: Vec<SensorAuth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorAuth {
    pub id: String,
    pub token: String,
}

impl AuthConfig {
    /// Sensor id → token map, skipping entries with empty fields.
    pub fn token_map(&self) -> HashMap<String, String> {
        self.sensors
            .iter()
            .filter(|s| !s.id.is_empty() && !s.token.is_empty())
            .map(|s| (s.id.clone(), s.token.clone()))
            .collect()
    }
}

fn default_heartbeat_interval() -> f64 {
    30.0
}

fn default_ping_interval() -> f64 {
    20.0
}

fn default_ingest_timeout() -> f64 {
    10.0
}

fn default_capabilities() -> Vec<String> {
    vec!["chunks".to_string(), "heartbeats".to_string()]
}

fn default_software_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("/var/lib/uplink/queue.db")
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/uplink/server.db")
}

fn default_retention_hours() -> f64 {
    72.0
}

fn default_ntp_server() -> String {
    "pool.ntp.org".to_string()
}

fn default_max_chunks() -> u32 {
    32
}

fn default_max_bytes() -> u64 {
    2 * 1024 * 1024
}

fn default_max_in_flight() -> u32 {
    32
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_ingest_port() -> u16 {
    8081
}

fn default_control_port() -> u16 {
    8765
}

fn default_stream_port() -> u16 {
    8766
}

pub fn retention_seconds(retention_hours: f64) -> f64 {
    retention_hours * 3600.0
}

impl SensorConfig {
    /// Load sensor configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        let config: SensorConfig = serde_yaml::from_str(&content)?;
        if config.sensor_id.is_empty() {
            return Err(Error::invalid_config("sensor_id must not be empty"));
        }
        Ok(config)
    }
}

impl ServerConfig {
    /// Load server configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_config_defaults() {
        let yaml = r#"
sensor_id: sensor-1
control:
  url: ws://localhost:8765
ingest:
  url: http://localhost:8081/v1/ingest/chunk
token: secret
"#;
        let config: SensorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.sensor_id, "sensor-1");
        assert_eq!(config.heartbeat_interval, 30.0);
        assert_eq!(config.control.ping_interval, 20.0);
        assert_eq!(config.ingest.timeout, 10.0);
        assert_eq!(config.queue.retention_hours, 72.0);
        assert_eq!(config.capabilities, vec!["chunks", "heartbeats"]);
        assert!(!config.time_sync.enabled);
        assert_eq!(config.time_sync.ntp_server, "pool.ntp.org");
    }

    #[test]
    fn test_server_config_defaults_and_tokens() {
        let yaml = r#"
store:
  path: /tmp/server.db
auth:
  sensors:
    - id: sensor-1
      token: secret
    - id: ""
      token: ignored
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.scheduler.max_chunks, 32);
        assert_eq!(config.scheduler.max_bytes, 2 * 1024 * 1024);
        assert_eq!(config.scheduler.max_in_flight, 32);
        assert_eq!(config.ingest.port, 8081);
        assert_eq!(config.control.port, 8765);
        assert_eq!(config.stream.port, 8766);
        let tokens = config.auth.token_map();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens["sensor-1"], "secret");
    }
}

//! Relay and client configuration (TOML-based).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::error::RetryPolicy;

/// Top-level configuration shared by the relay binary and sync clients
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-connection queue of pending pushes; overflow drops the push
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    /// Push CBOR binary frames instead of JSON text
    #[serde(default)]
    pub binary_frames: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Relay websocket endpoint
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Reconnect attempts after a dropped link (and retries of the first connect)
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Sent as `Authorization: Bearer <token>`
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Extra handshake headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub binary_frames: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Change source stamped on outgoing changes; OS user name when unset
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default = "default_send_retry_attempts")]
    pub send_retry_attempts: u32,
    #[serde(default = "default_send_retry_delay_ms")]
    pub send_retry_delay_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub outbound_queue_capacity: usize,
    #[serde(default = "default_queue_capacity")]
    pub broadcast_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also write a daily-rolling log file here
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// --- Defaults ---

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    5234
}
fn default_outbound_capacity() -> usize {
    256
}
fn default_server_url() -> String {
    "ws://127.0.0.1:5234/ws".into()
}
fn default_connection_timeout_ms() -> u64 {
    10_000
}
fn default_max_reconnect_attempts() -> u32 {
    3
}
fn default_reconnect_delay_ms() -> u64 {
    500
}
fn default_send_retry_attempts() -> u32 {
    3
}
fn default_send_retry_delay_ms() -> u64 {
    100
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            outbound_capacity: default_outbound_capacity(),
            binary_frames: false,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            connection_timeout_ms: default_connection_timeout_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            auth_token: None,
            headers: BTreeMap::new(),
            binary_frames: false,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            source_id: None,
            send_retry_attempts: default_send_retry_attempts(),
            send_retry_delay_ms: default_send_retry_delay_ms(),
            outbound_queue_capacity: default_queue_capacity(),
            broadcast_capacity: default_queue_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl TransportConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Default::default()
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Backoff between reconnect attempts
    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_reconnect_attempts.max(1),
            initial_delay: Duration::from_millis(self.reconnect_delay_ms),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.send_retry_attempts.max(1),
            initial_delay: Duration::from_millis(self.send_retry_delay_ms),
            ..Default::default()
        }
    }

    pub fn resolved_source_id(&self) -> String {
        self.source_id.clone().unwrap_or_else(whoami::username)
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Load from `path` when it exists, otherwise defaults
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the bind address as "host:port"
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.server.port, 5234);
        assert_eq!(config.transport.max_reconnect_attempts, 3);
        assert_eq!(config.transport.connection_timeout(), Duration::from_secs(10));
        assert_eq!(config.bind_address(), "127.0.0.1:5234");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SyncConfig = toml::from_str(
            r#"
            [transport]
            server_url = "ws://relay.example:9000/ws"
            max_reconnect_attempts = 5

            [client]
            source_id = "Alice"
            "#,
        )
        .unwrap();

        assert_eq!(config.transport.server_url, "ws://relay.example:9000/ws");
        assert_eq!(config.transport.max_reconnect_attempts, 5);
        assert_eq!(config.transport.reconnect_delay_ms, 500);
        assert_eq!(config.client.resolved_source_id(), "Alice");
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/sync.toml");

        let mut config = SyncConfig::default();
        config.server.port = 7000;
        config.transport.headers.insert("X-Tenant".into(), "studio".into());
        config.save(&path).unwrap();

        let loaded = SyncConfig::load(&path).unwrap();
        assert_eq!(loaded.server.port, 7000);
        assert_eq!(loaded.transport.headers.get("X-Tenant").map(String::as_str), Some("studio"));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 5234);
    }

    #[test]
    fn test_retry_policies_never_zero() {
        let transport = TransportConfig {
            max_reconnect_attempts: 0,
            ..Default::default()
        };
        assert_eq!(transport.reconnect_policy().max_attempts, 1);

        let client = ClientConfig {
            send_retry_attempts: 0,
            ..Default::default()
        };
        assert_eq!(client.retry_policy().max_attempts, 1);
    }
}

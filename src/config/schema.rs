//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration (`gem.toml`).
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GemConfig {
    /// Engine tuning and listen addresses.
    pub server: ServerConfig,

    /// Restart and signal handling.
    pub lifecycle: LifecycleConfig,

    /// Logging settings.
    pub observability: ObservabilityConfig,
}

/// Flat engine configuration, applied wholesale by `HttpServer::load_config`.
///
/// Zero means "no limit" for the limit and timeout fields.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Server name, reported by the status endpoint.
    pub name: String,

    /// Listen addresses, e.g. `[":8080", "127.0.0.1:4343"]`. Order matters:
    /// it is the descriptor order handed to a restarted child.
    pub addrs: Vec<String>,

    /// How long a drain waits for in-flight requests before forcing close.
    pub wait_timeout_secs: u64,

    /// Maximum number of requests served concurrently.
    pub concurrency: usize,

    /// Close every connection after one response.
    pub disable_keepalive: bool,

    /// Per-connection read buffer (floored at 8 KiB by the HTTP/1 codec).
    pub read_buffer_size: usize,

    /// Per-connection write buffer. Passed through.
    pub write_buffer_size: usize,

    /// Read timeout in milliseconds; with `write_timeout_ms` bounds a request.
    pub read_timeout_ms: u64,

    /// Write timeout in milliseconds.
    pub write_timeout_ms: u64,

    /// Concurrent requests allowed per peer IP.
    pub max_conns_per_ip: usize,

    /// Passed through.
    pub max_requests_per_conn: usize,

    /// Passed through.
    pub max_keepalive_duration_secs: u64,

    /// Largest accepted request body in bytes.
    pub max_request_body_size: usize,

    /// Passed through.
    pub reduce_memory_usage: bool,

    /// Reject anything but GET and HEAD with 405.
    pub get_only: bool,

    /// Passed through.
    pub disable_header_names_normalizing: bool,

    /// PEM certificate; enables TLS together with `key_file`.
    pub cert_file: Option<String>,

    /// PEM private key.
    pub key_file: Option<String>,
}

impl ServerConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// Total per-request budget, if any timeout is configured.
    pub fn request_timeout(&self) -> Option<Duration> {
        let total = self.read_timeout_ms.saturating_add(self.write_timeout_ms);
        (total > 0).then(|| Duration::from_millis(total))
    }

    pub fn max_keepalive_duration(&self) -> Duration {
        Duration::from_secs(self.max_keepalive_duration_secs)
    }

    pub fn tls_enabled(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "gem".to_string(),
            addrs: vec![":8080".to_string()],
            wait_timeout_secs: 30,
            concurrency: 256 * 1024,
            disable_keepalive: false,
            read_buffer_size: 4096,
            write_buffer_size: 4096,
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            max_conns_per_ip: 0,
            max_requests_per_conn: 0,
            max_keepalive_duration_secs: 0,
            max_request_body_size: 4 * 1024 * 1024,
            reduce_memory_usage: false,
            get_only: false,
            disable_header_names_normalizing: false,
            cert_file: None,
            key_file: None,
        }
    }
}

/// Restart coordination settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How long a spawned child has to confirm it took over the listeners.
    pub readiness_grace_ms: u64,

    /// Program to spawn on restart. Defaults to this process's argv[0].
    pub executable: Option<String>,

    /// Arguments for the spawned program. Defaults to this process's arguments.
    pub args: Option<Vec<String>>,

    /// Signal name to action (`restart` or `ignore`), e.g. `SIGHUP = "restart"`.
    pub signals: BTreeMap<String, String>,
}

impl LifecycleConfig {
    pub fn readiness_grace(&self) -> Duration {
        Duration::from_millis(self.readiness_grace_ms)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        let mut signals = BTreeMap::new();
        signals.insert("SIGHUP".to_string(), "restart".to_string());
        Self {
            readiness_grace_ms: 10_000,
            executable: None,
            args: None,
            signals,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level or filter directive (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_uses_defaults() {
        let config: GemConfig = toml::from_str("").unwrap();
        assert_eq!(config.server, ServerConfig::default());
        assert_eq!(config.server.wait_timeout(), Duration::from_secs(30));
        assert_eq!(config.lifecycle.signals.get("SIGHUP").map(String::as_str), Some("restart"));
        assert_eq!(config.observability.log_format, LogFormat::Pretty);
    }

    #[test]
    fn full_server_section() {
        let config: GemConfig = toml::from_str(
            r#"
            [server]
            name = "fasthttp"
            addrs = [":8080", ":4343", ":6060"]
            wait_timeout_secs = 30
            concurrency = 10000
            disable_keepalive = true
            read_timeout_ms = 1000
            write_timeout_ms = 2000
            max_conns_per_ip = 10
            get_only = true

            [lifecycle]
            readiness_grace_ms = 500
            signals = { SIGHUP = "restart", SIGUSR2 = "ignore" }

            [observability]
            log_format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.name, "fasthttp");
        assert_eq!(config.server.addrs, vec![":8080", ":4343", ":6060"]);
        assert!(config.server.disable_keepalive);
        assert_eq!(config.server.request_timeout(), Some(Duration::from_secs(3)));
        assert_eq!(config.server.max_request_body_size, 4 * 1024 * 1024);
        assert_eq!(config.lifecycle.readiness_grace(), Duration::from_millis(500));
        assert_eq!(config.lifecycle.signals.len(), 2);
        assert_eq!(config.observability.log_format, LogFormat::Json);
    }
}

//! Configuration type definitions.

use std::time::Duration;

use serde::Deserialize;

use crate::common::{ReconnectConfig, RetryPolicy};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub supervisor: SupervisorConfig,
    pub server: ServerConfig,
    pub ide: IdeConfig,
    pub metrics: MetricsConfig,
}

/// Local supervisor process settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Base URL of the supervisor API.
    pub url: String,
    /// Attempts for workspace info and token lookups.
    pub retry_attempts: usize,
    pub retry_delay_ms: u64,
    /// How often resource status is polled.
    pub status_interval_ms: u64,
    /// Pause before a notification stream is re-subscribed.
    pub stream_restart_delay_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:22999".to_string(),
            retry_attempts: 3,
            retry_delay_ms: 500,
            status_interval_ms: 1000,
            stream_restart_delay_ms: 1000,
        }
    }
}

/// Remote API server connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub plugin_id: String,
    pub plugin_version: String,
    pub token_kind: String,
    pub token_scopes: Vec<String>,
    pub min_reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub reconnect_growth_factor: f64,
    pub connect_timeout_ms: u64,
    /// HTTP proxy used to tunnel the server connection, e.g. `http://proxy:3128`.
    pub proxy: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            plugin_id: "workspace-bridge".to_string(),
            plugin_version: env!("CARGO_PKG_VERSION").to_string(),
            token_kind: "gitpod".to_string(),
            token_scopes: [
                "function:openPort",
                "function:sendHeartBeat",
                "function:setWorkspaceTimeout",
                "function:stopWorkspace",
                "function:takeSnapshot",
                "function:trackEvent",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            min_reconnect_delay_ms: 2000,
            max_reconnect_delay_ms: 30000,
            reconnect_growth_factor: 1.5,
            connect_timeout_ms: 10000,
            proxy: None,
        }
    }
}

/// Identity of the hosting IDE backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdeConfig {
    pub backend_kind: String,
    pub qualifier: String,
    pub app_name: String,
    pub app_version: String,
    /// Log telemetry instead of sending it, and skip metrics push.
    pub dev_mode: bool,
    /// No UI: skip notification streams, resource polling and metrics.
    pub headless: bool,
}

impl Default for IdeConfig {
    fn default() -> Self {
        Self {
            backend_kind: "unknown".to_string(),
            qualifier: "unknown".to_string(),
            app_name: "unknown".to_string(),
            app_version: "unknown".to_string(),
            dev_mode: false,
            headless: false,
        }
    }
}

/// Memory metrics push settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub push_interval_ms: u64,
    pub job: String,
    /// Count a low-memory event when available system memory drops below this.
    pub low_memory_threshold_mb: u64,
    pub low_memory_check_interval_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            push_interval_ms: 5000,
            job: "ide_backend".to_string(),
            low_memory_threshold_mb: 256,
            low_memory_check_interval_ms: 1000,
        }
    }
}

impl Config {
    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            min_delay: Duration::from_millis(self.server.min_reconnect_delay_ms),
            max_delay: Duration::from_millis(self.server.max_reconnect_delay_ms),
            growth_factor: self.server.reconnect_growth_factor,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.supervisor.retry_attempts,
            Duration::from_millis(self.supervisor.retry_delay_ms),
        )
    }
}

//! Configuration validation.
//!
//! Validates configuration values and provides helpful error messages.

use url::Url;

use crate::common::error::ConfigError;
use crate::config::types::Config;

/// Validate a configuration and return detailed errors.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    // Supervisor
    if let Err(e) = Url::parse(&config.supervisor.url) {
        errors.push(format!(
            "supervisor.url '{}' is not a valid URL: {}",
            config.supervisor.url, e
        ));
    }
    if config.supervisor.retry_attempts == 0 {
        errors.push("supervisor.retry_attempts must be at least 1".to_string());
    }
    if config.supervisor.status_interval_ms == 0 {
        errors.push("supervisor.status_interval_ms must be non-zero".to_string());
    }

    // Server connection
    let server = &config.server;
    if server.plugin_id.is_empty() {
        errors.push("server.plugin_id is required".to_string());
    }
    if server.token_kind.is_empty() {
        errors.push("server.token_kind is required".to_string());
    }
    if server.token_scopes.is_empty() {
        errors.push("server.token_scopes is empty - the token would grant nothing".to_string());
    }
    if server.min_reconnect_delay_ms == 0 {
        errors.push("server.min_reconnect_delay_ms must be non-zero".to_string());
    }
    if server.min_reconnect_delay_ms > server.max_reconnect_delay_ms {
        errors.push(format!(
            "server.min_reconnect_delay_ms ({}) exceeds server.max_reconnect_delay_ms ({})",
            server.min_reconnect_delay_ms, server.max_reconnect_delay_ms
        ));
    }
    if server.reconnect_growth_factor.is_nan() || server.reconnect_growth_factor < 1.0 {
        errors.push(format!(
            "server.reconnect_growth_factor must be >= 1.0 (got {})",
            server.reconnect_growth_factor
        ));
    }
    if server.connect_timeout_ms == 0 {
        errors.push("server.connect_timeout_ms must be non-zero".to_string());
    }
    if let Some(ref proxy) = server.proxy {
        match Url::parse(proxy) {
            Ok(url) if url.scheme() != "http" => errors.push(format!(
                "server.proxy '{}' must be an http:// proxy",
                proxy
            )),
            Ok(_) => {}
            Err(e) => errors.push(format!("server.proxy '{}' is not a valid URL: {}", proxy, e)),
        }
    }

    // Metrics
    if config.metrics.enabled {
        if config.metrics.push_interval_ms == 0 {
            errors.push("metrics.push_interval_ms must be non-zero".to_string());
        }
        if config.metrics.job.is_empty() {
            errors.push("metrics.job is required when metrics are enabled".to_string());
        }
        if config.metrics.low_memory_check_interval_ms == 0 {
            errors.push("metrics.low_memory_check_interval_ms must be non-zero".to_string());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError {
            message: errors.join("\n"),
        })
    }
}

//! Environment variable overrides for configuration.
//!
//! Supports overriding config values with environment variables:
//! - `WORKSPACE_BRIDGE_CONFIG` - config file path
//! - `WORKSPACE_BRIDGE_SUPERVISOR_URL` - supervisor API base URL
//! - `WORKSPACE_BRIDGE_PROXY` - HTTP proxy for the server connection
//!
//! The IDE launcher also exports a few variables of its own:
//! - `JB_DEV` - development mode
//! - `JETBRAINS_GITPOD_BACKEND_KIND` - backend product
//! - `JETBRAINS_BACKEND_QUALIFIER` - backend qualifier (stable, latest, ...)

use std::env;

use crate::config::types::Config;

/// Environment variable prefix for all config overrides.
const ENV_PREFIX: &str = "WORKSPACE_BRIDGE";

/// Apply environment variable overrides to a config.
pub fn apply_env_overrides(mut config: Config) -> Config {
    if let Ok(url) = env::var(format!("{}_SUPERVISOR_URL", ENV_PREFIX)) {
        config.supervisor.url = url;
    }
    if let Ok(proxy) = env::var(format!("{}_PROXY", ENV_PREFIX)) {
        config.server.proxy = if proxy.is_empty() { None } else { Some(proxy) };
    }

    if let Ok(dev) = env::var("JB_DEV") {
        config.ide.dev_mode = dev.eq_ignore_ascii_case("true");
    }
    if let Ok(kind) = env::var("JETBRAINS_GITPOD_BACKEND_KIND") {
        config.ide.backend_kind = kind;
    }
    if let Ok(qualifier) = env::var("JETBRAINS_BACKEND_QUALIFIER") {
        config.ide.qualifier = qualifier;
    }

    config
}

/// Get the config file path from environment or use default.
///
/// Checks `WORKSPACE_BRIDGE_CONFIG`, otherwise returns "workspace-bridge.conf".
pub fn get_config_path() -> String {
    env::var(format!("{}_CONFIG", ENV_PREFIX))
        .unwrap_or_else(|_| "workspace-bridge.conf".to_string())
}

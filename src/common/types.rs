//! Shared types used across the bridge.
//!
//! Supervisor payloads follow the JSON mapping of its RPC API: camelCase
//! field names, omitted defaults, and 64-bit integers that may arrive as
//! strings.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Accept a 64-bit integer encoded either as a JSON number or a string.
fn flexible_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Workspace metadata reported by the supervisor.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkspaceInfo {
    pub workspace_id: String,
    pub instance_id: String,
    pub checkout_location: String,
    pub workspace_context_url: String,
    pub owner_id: String,
    /// Public URL of the installation, e.g. `https://gitpod.example.com`.
    pub gitpod_host: String,
    pub gitpod_api: ApiEndpoint,
}

/// Where the remote API server lives.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiEndpoint {
    /// WebSocket endpoint, e.g. `wss://api.gitpod.example.com/v1`.
    pub endpoint: String,
    /// Host the token is issued for.
    pub host: String,
}

/// Request for a server token.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRequest {
    pub kind: String,
    pub host: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenResponse {
    pub token: String,
}

/// Identifier the supervisor attaches to requests that expect an answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
pub struct RequestId(#[serde(deserialize_with = "flexible_i64")] pub i64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotifyLevel {
    Error,
    Warning,
    #[default]
    Info,
}

/// A notification the user should see, optionally with action buttons.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotifyRequest {
    pub level: NotifyLevel,
    pub message: String,
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscribeResponse {
    pub request_id: RequestId,
    pub request: NotifyRequest,
}

/// Request to open files in the focused IDE window.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OpenRequest {
    pub paths: Vec<String>,
    #[serde(rename = "await")]
    pub wait: bool,
}

/// Request to preview a URL in the focused IDE window.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreviewRequest {
    pub url: String,
}

/// A request that only the active (focused) client should handle.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActiveRequest {
    pub open: Option<OpenRequest>,
    pub preview: Option<PreviewRequest>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscribeActiveResponse {
    pub request_id: RequestId,
    pub request: ActiveRequest,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceSeverity {
    #[default]
    Normal,
    Warning,
    Danger,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceStatus {
    #[serde(deserialize_with = "flexible_i64")]
    pub used: i64,
    #[serde(deserialize_with = "flexible_i64")]
    pub limit: i64,
    pub severity: ResourceSeverity,
}

/// Workspace container resource usage.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourcesStatus {
    pub memory: ResourceStatus,
    pub cpu: ResourceStatus,
}

/// Usage event sent to the remote server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackMessage {
    pub event: String,
    pub properties: Map<String, Value>,
}

//! Seam between the connection session and the transport that reaches the
//! remote API server.

use std::fmt;

use async_trait::async_trait;
use url::Url;

use crate::common::error::ConnectionResult;
use crate::common::types::TrackMessage;

/// Everything needed to open one server connection.
#[derive(Clone)]
pub struct ConnectParams {
    /// WebSocket endpoint of the API server.
    pub endpoint: String,
    /// Public host of the installation, sent as the `Origin`.
    pub origin: String,
    /// Host the token was issued for; used to label log lines.
    pub api_host: String,
    pub plugin_id: String,
    pub plugin_version: String,
    pub token: String,
    pub proxy: Option<Url>,
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("endpoint", &self.endpoint)
            .field("origin", &self.origin)
            .field("api_host", &self.api_host)
            .field("plugin_id", &self.plugin_id)
            .field("plugin_version", &self.plugin_version)
            .field("token", &"<redacted>")
            .field("proxy", &self.proxy)
            .finish()
    }
}

/// Why a live connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The server sent a close frame.
    Remote { code: Option<u16>, reason: String },
    /// The transport failed underneath the connection.
    Transport(String),
    /// The stream ended without a close frame.
    EndOfStream,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote {
                code: Some(code),
                reason,
            } => write!(f, "closed by server ({}): {}", code, reason),
            Self::Remote { code: None, reason } => write!(f, "closed by server: {}", reason),
            Self::Transport(message) => write!(f, "transport failed: {}", message),
            Self::EndOfStream => write!(f, "stream ended"),
        }
    }
}

/// Opens server connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: ServerConnection + 'static;

    /// Perform the handshake and return a live connection.
    async fn connect(&self, params: &ConnectParams) -> ConnectionResult<Self::Connection>;
}

/// A live server connection.
#[async_trait]
pub trait ServerConnection: Send {
    /// Resolves once the connection has terminated.
    ///
    /// Must be cancel-safe: it is raced against other events and re-polled.
    async fn closed(&mut self) -> CloseReason;

    /// Report a usage event to the server.
    async fn track_event(&mut self, message: &TrackMessage) -> ConnectionResult<()>;

    /// Close the connection from our side.
    async fn close(&mut self);
}

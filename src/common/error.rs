//! Error types for the bridge.

use thiserror::Error;

/// Terminal outcome of a bridge session.
///
/// A session never ends "successfully": it runs until it is cancelled or
/// something it cannot recover from happens.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("Failed to resolve workspace info: {0}")]
    WorkspaceInfo(#[source] RetryError<SupervisorError>),

    #[error("Failed to obtain server token: {0}")]
    Token(#[source] RetryError<SupervisorError>),

    #[error("Server refused the connection: {0}")]
    FatalProtocol(#[source] ConnectionError),

    #[error("Backend is headless, workspace services are not used")]
    Headless,

    #[error("Bridge was shut down")]
    Cancelled,
}

impl BridgeError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::WorkspaceInfo(e) | Self::Token(e) => e.is_cancelled(),
            Self::FatalProtocol(_) | Self::Headless => false,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {message}")]
    IoError { path: String, message: String },

    #[error("Failed to parse config: {message}")]
    ParseError { message: String },

    #[error("Config validation failed: {message}")]
    ValidationError { message: String },
}

/// Errors talking to the local supervisor process.
#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    #[error("Request to supervisor '{path}' failed: {message}")]
    Request { path: String, message: String },

    #[error("Supervisor answered '{path}' with status {status}: {message}")]
    Status {
        path: String,
        status: u16,
        message: String,
    },

    #[error("Failed to decode supervisor response: {message}")]
    Decode { message: String },

    #[error("Supervisor stream failed with code {code}: {message}")]
    Stream { code: i32, message: String },
}

impl From<std::io::Error> for SupervisorError {
    fn from(e: std::io::Error) -> Self {
        Self::Request {
            path: "stream".to_string(),
            message: e.to_string(),
        }
    }
}

/// Errors establishing or using the server connection.
///
/// Only [`ConnectionError::HandshakeRejected`] is fatal: the endpoint was
/// reachable but refused the protocol upgrade, so retrying with the same
/// token cannot succeed. Everything else is transient.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("Server rejected the handshake with status {status}: {message}")]
    HandshakeRejected { status: u16, message: String },

    #[error("Invalid server endpoint '{endpoint}': {message}")]
    InvalidEndpoint { endpoint: String, message: String },

    #[error("Proxy tunnel failed: {message}")]
    Proxy { message: String },

    #[error("Connection timeout")]
    Timeout,

    #[error("Transport error: {message}")]
    Transport { message: String },
}

impl ConnectionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::HandshakeRejected { .. })
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport {
            message: e.to_string(),
        }
    }
}

/// Errors building or encoding the pushed metrics.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("Failed to encode metrics: {0}")]
    Encoding(String),
}

/// A single-assignment value was assigned twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Value has already been resolved")]
pub struct AlreadyResolved;

/// Failure of an operation run under [`crate::common::retry::retry`].
#[derive(Debug, Clone, Error)]
pub enum RetryError<E> {
    #[error("{operation} failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: &'static str,
        attempts: usize,
        #[source]
        source: E,
    },

    #[error("{operation} was cancelled")]
    Cancelled { operation: &'static str },
}

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Result type alias for supervisor calls.
pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;

/// Result type alias for connection operations.
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

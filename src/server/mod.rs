//! Long-lived connection to the remote API server.

pub mod connector;
pub mod session;
pub mod websocket;

pub use connector::{CloseReason, ConnectParams, Connector, ServerConnection};
pub use session::{
    ConnectionAttemptResult, ConnectionSession, ConnectionState, SessionStatus, Termination,
};
pub use websocket::{WebSocketConnection, WebSocketConnector};

//! Workspace bridge: connects an IDE backend running inside a remote
//! workspace to the workspace supervisor and to the remote API server.
//!
//! The crate keeps one authenticated server connection alive for as long as
//! the IDE session runs, reconnecting with backoff, and relays supervisor
//! notifications, telemetry and resource metrics alongside it.

pub mod bridge;
pub mod common;
pub mod config;
pub mod server;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{IdeHost, LogHost, WorkspaceBridge};
pub use common::error::BridgeError;
pub use config::Config;

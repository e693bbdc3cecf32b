//! The bridge between the supervisor, the remote server and the IDE host.
//!
//! ## Module Structure
//!
//! - `orchestrator`: owns the task tree of one IDE session (`WorkspaceBridge`)
//! - `host`: capabilities the IDE provides (`IdeHost`)
//! - `notifications`: supervisor notification streams
//! - `telemetry`: best-effort usage events
//! - `metrics`: resource status polling and memory metrics push

pub mod host;
pub mod metrics;
pub mod notifications;
pub mod orchestrator;
pub mod telemetry;

pub use host::{IdeHost, LogHost};
pub use orchestrator::WorkspaceBridge;
pub use telemetry::Telemetry;

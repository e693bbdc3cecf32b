//! Common utilities and types shared across the bridge.

pub mod error;
pub mod lifetime;
pub mod pending;
pub mod reconnect;
pub mod retry;
pub mod types;

pub use error::{
    AlreadyResolved, BridgeError, ConfigError, ConnectionError, MetricsError, RetryError,
    SupervisorError,
};
pub use lifetime::Lifetime;
pub use pending::AsyncValue;
pub use reconnect::{ReconnectConfig, ReconnectState};
pub use retry::{retry, RetryPolicy};

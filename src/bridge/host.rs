//! Capabilities the hosting IDE provides to the bridge.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::common::types::{ActiveRequest, NotifyLevel, NotifyRequest};

#[async_trait]
pub trait IdeHost: Send + Sync + 'static {
    /// Show a notification and wait for the user.
    ///
    /// Returns the action the user picked, or `None` if the notification was
    /// dismissed or has no actions.
    async fn notify(&self, request: &NotifyRequest) -> Option<String>;

    /// Open files or preview a URL in the focused window.
    async fn handle_active(&self, request: &ActiveRequest) -> anyhow::Result<()>;

    async fn open_browser(&self, url: &str) -> anyhow::Result<()>;
}

/// Host without any UI: notifications and requests end up in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHost;

#[async_trait]
impl IdeHost for LogHost {
    async fn notify(&self, request: &NotifyRequest) -> Option<String> {
        match request.level {
            NotifyLevel::Error | NotifyLevel::Warning => warn!("{}", request.message),
            NotifyLevel::Info => info!("{}", request.message),
        }
        None
    }

    async fn handle_active(&self, request: &ActiveRequest) -> anyhow::Result<()> {
        if let Some(open) = &request.open {
            info!("Open requested: {}", open.paths.join(", "));
        }
        if let Some(preview) = &request.preview {
            info!("Preview requested: {}", preview.url);
        }
        Ok(())
    }

    async fn open_browser(&self, url: &str) -> anyhow::Result<()> {
        info!("Open in browser: {}", url);
        Ok(())
    }
}

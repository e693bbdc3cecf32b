//! Usage telemetry sent over the server connection.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::common::error::BridgeError;
use crate::common::lifetime::Lifetime;
use crate::common::pending::AsyncValue;
use crate::common::types::{TrackMessage, WorkspaceInfo};
use crate::config::types::IdeConfig;

/// Events waiting for a live connection. Further events are dropped.
pub const QUEUE_CAPACITY: usize = 256;

/// Sent when a link is opened from an IDE action.
pub const OPEN_LINK_EVENT: &str = "jb_execute_command_gitpod_open_link";

/// Best-effort event reporter.
///
/// Events are stamped when reported but sent only once workspace info is
/// known; nothing is reported back to the caller.
#[derive(Clone)]
pub struct Telemetry {
    info: Arc<AsyncValue<Result<WorkspaceInfo, BridgeError>>>,
    outbound: mpsc::Sender<TrackMessage>,
    ide: IdeConfig,
    lifetime: Lifetime,
}

impl Telemetry {
    pub fn new(
        info: Arc<AsyncValue<Result<WorkspaceInfo, BridgeError>>>,
        outbound: mpsc::Sender<TrackMessage>,
        ide: IdeConfig,
        lifetime: Lifetime,
    ) -> Self {
        Self {
            info,
            outbound,
            ide,
            lifetime,
        }
    }

    pub fn track_event(&self, event: &str, properties: Map<String, Value>) {
        let timestamp = Utc::now().timestamp_millis();
        let event = event.to_string();
        let telemetry = self.clone();

        self.lifetime.spawn(move |cancel| async move {
            let info = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                info = telemetry.info.wait() => info,
            };
            match info {
                Ok(info) => {
                    let message = build_message(&event, info, &telemetry.ide, timestamp, properties);
                    telemetry.dispatch(message);
                }
                Err(e) => debug!("Dropping '{}' event: {}", event, e),
            }
        });
    }

    fn dispatch(&self, message: TrackMessage) {
        if self.ide.dev_mode {
            warn!(
                "trackEvent (dev mode, not sent): {}",
                serde_json::to_string(&message).unwrap_or_else(|_| message.event.clone())
            );
            return;
        }

        match self.outbound.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                debug!("Telemetry queue is full, dropping '{}' event", message.event)
            }
            Err(TrySendError::Closed(message)) => {
                debug!("Connection is gone, dropping '{}' event", message.event)
            }
        }
    }
}

/// Standard event properties, overlaid by the caller's.
pub fn build_message(
    event: &str,
    info: &WorkspaceInfo,
    ide: &IdeConfig,
    timestamp: i64,
    properties: Map<String, Value>,
) -> TrackMessage {
    let mut all = Map::new();
    all.insert("instanceId".into(), json!(info.instance_id));
    all.insert("workspaceId".into(), json!(info.workspace_id));
    all.insert("appName".into(), json!(ide.app_name));
    all.insert("appVersion".into(), json!(ide.app_version));
    all.insert("timestamp".into(), json!(timestamp));
    all.insert("product".into(), json!(ide.backend_kind));
    all.insert("qualifier".into(), json!(ide.qualifier));
    all.extend(properties);

    TrackMessage {
        event: event.to_string(),
        properties: all,
    }
}

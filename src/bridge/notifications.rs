//! Supervisor notification streams.
//!
//! Both streams are consumed by a single task that re-subscribes after a
//! short pause whenever the stream ends or fails. Each received request is
//! handled in its own task so a notification waiting on the user never holds
//! up the stream.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::bridge::host::IdeHost;
use crate::common::error::SupervisorResult;
use crate::common::lifetime::Lifetime;
use crate::common::types::{SubscribeActiveResponse, SubscribeResponse};
use crate::supervisor::client::SupervisorApi;

/// Handle general notifications until `lifetime` is cancelled.
pub async fn run_notifications(
    lifetime: Lifetime,
    supervisor: Arc<dyn SupervisorApi>,
    host: Arc<dyn IdeHost>,
    restart_delay: Duration,
) {
    let cancel = lifetime.token().clone();
    run_restarting("notifications", restart_delay, &cancel, || {
        consume_notifications(&lifetime, &supervisor, &host)
    })
    .await;
}

/// Handle requests for the focused client until `lifetime` is cancelled.
pub async fn run_active_requests(
    lifetime: Lifetime,
    supervisor: Arc<dyn SupervisorApi>,
    host: Arc<dyn IdeHost>,
    restart_delay: Duration,
) {
    let cancel = lifetime.token().clone();
    run_restarting("active notifications", restart_delay, &cancel, || {
        consume_active_requests(&lifetime, &supervisor, &host)
    })
    .await;
}

async fn run_restarting<F, Fut>(
    name: &str,
    restart_delay: Duration,
    cancel: &CancellationToken,
    mut subscribe: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = SupervisorResult<()>>,
{
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = subscribe() => result,
        };

        match result {
            Ok(()) => debug!("{} stream ended", name),
            Err(e) => error!("Failed to stream {}: {}", name, e),
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(restart_delay) => {}
        }
    }
}

async fn consume_notifications(
    lifetime: &Lifetime,
    supervisor: &Arc<dyn SupervisorApi>,
    host: &Arc<dyn IdeHost>,
) -> SupervisorResult<()> {
    let mut stream = supervisor.subscribe().await?;
    while let Some(item) = stream.next().await {
        let notification = item?;
        let supervisor = supervisor.clone();
        let host = host.clone();
        lifetime.spawn(move |cancel| async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = handle_notification(notification, supervisor, host) => {}
            }
        });
    }
    Ok(())
}

async fn handle_notification(
    notification: SubscribeResponse,
    supervisor: Arc<dyn SupervisorApi>,
    host: Arc<dyn IdeHost>,
) {
    let SubscribeResponse {
        request_id,
        request,
    } = notification;

    let Some(action) = host.notify(&request).await else {
        return;
    };
    if let Err(e) = supervisor.respond(request_id, &action).await {
        warn!("Failed to respond to notification {}: {}", request_id, e);
    }
}

async fn consume_active_requests(
    lifetime: &Lifetime,
    supervisor: &Arc<dyn SupervisorApi>,
    host: &Arc<dyn IdeHost>,
) -> SupervisorResult<()> {
    let mut stream = supervisor.subscribe_active().await?;
    while let Some(item) = stream.next().await {
        let request = item?;
        let supervisor = supervisor.clone();
        let host = host.clone();
        lifetime.spawn(move |cancel| async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = handle_active_request(request, supervisor, host) => {}
            }
        });
    }
    Ok(())
}

async fn handle_active_request(
    request: SubscribeActiveResponse,
    supervisor: Arc<dyn SupervisorApi>,
    host: Arc<dyn IdeHost>,
) {
    let request_id = request.request_id;
    if let Err(e) = host.handle_active(&request.request).await {
        error!("Failed to handle active request {}: {:#}", request_id, e);
    }
    // The supervisor blocks the requesting client until this arrives.
    if let Err(e) = supervisor.active_respond(request_id).await {
        warn!("Failed to acknowledge active request {}: {}", request_id, e);
    }
}

//! The workspace bridge: owns every long-lived task of one IDE session.
//!
//! Startup order matters: the server connection needs both workspace info
//! and a token, so the connection task waits on both caches before the
//! session state machine runs. Notifications, resource polling and metrics
//! are independent and start right away. A headless backend starts none of
//! these tasks. Everything is spawned into one [`Lifetime`], so
//! [`WorkspaceBridge::shutdown`] returns only after every task finished its
//! cleanup.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::bridge::host::IdeHost;
use crate::bridge::metrics::{
    run_low_memory_watcher, run_metrics_pusher, run_status_poller, MemoryMetrics, MemorySampler,
};
use crate::bridge::notifications::{run_active_requests, run_notifications};
use crate::bridge::telemetry::{Telemetry, OPEN_LINK_EVENT, QUEUE_CAPACITY};
use crate::common::error::{BridgeError, ConfigError};
use crate::common::lifetime::Lifetime;
use crate::common::pending::AsyncValue;
use crate::common::retry::{retry, RetryPolicy};
use crate::common::types::{ResourcesStatus, TokenRequest, TrackMessage, WorkspaceInfo};
use crate::config::types::Config;
use crate::config::validate::validate_config;
use crate::server::connector::{ConnectParams, Connector};
use crate::server::session::{ConnectionSession, SessionStatus, Termination};
use crate::supervisor::client::SupervisorApi;

type Shared<T> = Arc<AsyncValue<Result<T, BridgeError>>>;

pub struct WorkspaceBridge {
    config: Config,
    supervisor: Arc<dyn SupervisorApi>,
    host: Arc<dyn IdeHost>,
    lifetime: Lifetime,
    info: Shared<WorkspaceInfo>,
    token: Shared<String>,
    outcome: Arc<AsyncValue<BridgeError>>,
    telemetry: Telemetry,
    status: watch::Receiver<SessionStatus>,
    resources: watch::Receiver<Option<ResourcesStatus>>,
    active: Mutex<Option<Lifetime>>,
}

impl WorkspaceBridge {
    /// Start every task of the bridge. Must be called within a tokio runtime.
    pub fn start<C: Connector>(
        config: Config,
        supervisor: Arc<dyn SupervisorApi>,
        host: Arc<dyn IdeHost>,
        connector: C,
    ) -> Result<Self, ConfigError> {
        validate_config(&config)?;

        let lifetime = Lifetime::new();
        let info: Shared<WorkspaceInfo> = cache(config.ide.headless);
        let token: Shared<String> = cache(config.ide.headless);
        let outcome = Arc::new(AsyncValue::new());

        let reconnect = config.reconnect_config();
        let (status_tx, status) = watch::channel(SessionStatus::new(reconnect.min_delay));
        let (resources_tx, resources) = watch::channel(None);
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_CAPACITY);

        if config.ide.headless {
            info!("Headless backend, skipping server connection, notifications and metrics");
        } else {
            lifetime.spawn({
                let supervisor = supervisor.clone();
                let policy = config.retry_policy();
                let info = info.clone();
                move |cancel| resolve_workspace_info(supervisor, policy, info, cancel)
            });

            let connection = ConnectionTask {
                config: config.clone(),
                supervisor: supervisor.clone(),
                info: info.clone(),
                token: token.clone(),
                outcome: outcome.clone(),
            };
            lifetime.spawn(move |cancel| {
                connection.run(connector, outbound_rx, status_tx, cancel)
            });

            let restart_delay = Duration::from_millis(config.supervisor.stream_restart_delay_ms);
            let notifications = lifetime.nested();
            notifications.spawn({
                let (scope, supervisor, host) =
                    (notifications.clone(), supervisor.clone(), host.clone());
                move |_| run_notifications(scope, supervisor, host, restart_delay)
            });

            lifetime.spawn({
                let supervisor = supervisor.clone();
                let interval = Duration::from_millis(config.supervisor.status_interval_ms);
                move |cancel| run_status_poller(supervisor, interval, resources_tx, cancel)
            });

            if config.metrics.enabled && !config.ide.dev_mode {
                spawn_metrics(&lifetime, &config, &supervisor);
            }
        }

        let telemetry = Telemetry::new(
            info.clone(),
            outbound_tx,
            config.ide.clone(),
            lifetime.clone(),
        );

        Ok(Self {
            config,
            supervisor,
            host,
            lifetime,
            info,
            token,
            outcome,
            telemetry,
            status,
            resources,
            active: Mutex::new(None),
        })
    }

    /// Workspace metadata, resolved once per bridge.
    pub async fn workspace_info(&self) -> Result<WorkspaceInfo, BridgeError> {
        self.info.get().await
    }

    /// Whether a server token has been obtained.
    pub fn has_token(&self) -> bool {
        matches!(self.token.peek(), Some(Ok(_)))
    }

    /// Report a usage event. Never fails; see [`Telemetry`].
    pub fn track_event(&self, event: &str, properties: Map<String, Value>) {
        self.telemetry.track_event(event, properties);
    }

    /// Record that a link was opened from an IDE action, then open it.
    pub async fn open_url_from_action(&self, url: &str) -> anyhow::Result<()> {
        let mut properties = Map::new();
        properties.insert("url".to_string(), json!(url));
        self.track_event(OPEN_LINK_EVENT, properties);
        self.host.open_browser(url).await
    }

    /// Follow whether this backend has a focused client. Requests meant for
    /// the focused client are only streamed while it has one.
    pub async fn set_active_session(&self, active: bool) {
        if self.config.ide.headless || !self.lifetime.is_alive() {
            return;
        }

        let mut current = self.active.lock().await;
        match (active, current.is_some()) {
            (true, false) => {
                debug!("Client session became active");
                let scope = self.lifetime.nested();
                let restart_delay =
                    Duration::from_millis(self.config.supervisor.stream_restart_delay_ms);
                scope.spawn({
                    let (scope, supervisor, host) =
                        (scope.clone(), self.supervisor.clone(), self.host.clone());
                    move |_| run_active_requests(scope, supervisor, host, restart_delay)
                });
                *current = Some(scope);
            }
            (false, true) => {
                debug!("Client session became inactive");
                if let Some(scope) = current.take() {
                    scope.cancel();
                }
            }
            _ => {}
        }
    }

    /// Latest workspace resource usage, if any was received yet.
    pub fn resource_status(&self) -> Option<ResourcesStatus> {
        self.resources.borrow().clone()
    }

    pub fn connection_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Wait until the bridge has stopped for good and return why.
    pub async fn termination(&self) -> BridgeError {
        self.outcome.get().await
    }

    /// Cancel every task and wait for all of them to finish. Idempotent.
    pub async fn shutdown(&self) {
        info!("Shutting down workspace bridge");
        self.lifetime.terminate().await;
        if self.outcome.settle(BridgeError::Cancelled).is_ok() {
            debug!("Bridge stopped before the connection task finished");
        }
    }
}

/// A headless backend never looks up workspace info or a token.
fn cache<T>(headless: bool) -> Shared<T> {
    if headless {
        Arc::new(AsyncValue::settled(Err(BridgeError::Headless)))
    } else {
        Arc::new(AsyncValue::new())
    }
}

/// Memory gauges and the low-memory counter share one pushed registry.
fn spawn_metrics(lifetime: &Lifetime, config: &Config, supervisor: &Arc<dyn SupervisorApi>) {
    let metrics = match MemoryMetrics::new(&config.ide.backend_kind, &config.ide.qualifier) {
        Ok(metrics) => metrics,
        Err(e) => {
            error!("Metrics disabled: {}", e);
            return;
        }
    };

    lifetime.spawn({
        let metrics = metrics.clone();
        let threshold = config.metrics.low_memory_threshold_mb.saturating_mul(1024 * 1024);
        let interval = Duration::from_millis(config.metrics.low_memory_check_interval_ms);
        let mut sampler = MemorySampler::new();
        move |cancel| {
            run_low_memory_watcher(metrics, threshold, interval, move || sampler.sample(), cancel)
        }
    });

    lifetime.spawn({
        let supervisor = supervisor.clone();
        let job = config.metrics.job.clone();
        let interval = Duration::from_millis(config.metrics.push_interval_ms);
        move |cancel| run_metrics_pusher(supervisor, job, interval, metrics, cancel)
    });
}

async fn resolve_workspace_info(
    supervisor: Arc<dyn SupervisorApi>,
    policy: RetryPolicy,
    info: Shared<WorkspaceInfo>,
    cancel: CancellationToken,
) {
    let result = retry(&policy, &cancel, "workspace info", || supervisor.workspace_info())
        .await
        .map_err(BridgeError::WorkspaceInfo);

    match &result {
        Ok(info) => info!("Workspace {} (instance {})", info.workspace_id, info.instance_id),
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!("{}", e),
    }
    if info.settle(result).is_err() {
        warn!("Workspace info was resolved twice");
    }
}

/// Owns the server connection: waits for info and token, then runs the
/// reconnecting session until it terminates.
struct ConnectionTask {
    config: Config,
    supervisor: Arc<dyn SupervisorApi>,
    info: Shared<WorkspaceInfo>,
    token: Shared<String>,
    outcome: Arc<AsyncValue<BridgeError>>,
}

impl ConnectionTask {
    async fn run<C: Connector>(
        self,
        connector: C,
        outbound: mpsc::Receiver<TrackMessage>,
        status: watch::Sender<SessionStatus>,
        cancel: CancellationToken,
    ) {
        let outcome = match self.prepare(&cancel).await {
            Ok(params) => {
                let session = ConnectionSession::new(
                    connector,
                    params,
                    self.config.reconnect_config(),
                    outbound,
                    status,
                );
                match session.run(cancel).await {
                    Termination::FatalProtocolError(e) => BridgeError::FatalProtocol(e),
                    Termination::Cancelled => BridgeError::Cancelled,
                }
            }
            Err(e) if e.is_cancelled() => BridgeError::Cancelled,
            Err(e) => e,
        };

        if !outcome.is_cancelled() {
            error!("Server connection stopped: {}", outcome);
        }
        if self.outcome.settle(outcome).is_err() {
            debug!("Bridge outcome was already recorded");
        }
    }

    async fn prepare(&self, cancel: &CancellationToken) -> Result<ConnectParams, BridgeError> {
        let info = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BridgeError::Cancelled),
            info = self.info.get() => info,
        };
        let info = match info {
            Ok(info) => info,
            Err(e) => {
                self.settle_token(Err(e.clone()));
                return Err(e);
            }
        };

        let request = TokenRequest {
            kind: self.config.server.token_kind.clone(),
            host: info.gitpod_api.host.clone(),
            scopes: self.config.server.token_scopes.clone(),
        };
        let supervisor = &self.supervisor;
        let result = retry(&self.config.retry_policy(), cancel, "server token", || {
            supervisor.token(&request)
        })
        .await
        .map_err(BridgeError::Token);
        self.settle_token(result.clone());
        let token = result?;

        let proxy = match self.config.server.proxy.as_deref().map(Url::parse) {
            Some(Ok(proxy)) => Some(proxy),
            Some(Err(e)) => {
                warn!("Ignoring invalid proxy setting: {}", e);
                None
            }
            None => None,
        };

        Ok(ConnectParams {
            endpoint: info.gitpod_api.endpoint.clone(),
            origin: info.gitpod_host.clone(),
            api_host: info.gitpod_api.host.clone(),
            plugin_id: self.config.server.plugin_id.clone(),
            plugin_version: self.config.server.plugin_version.clone(),
            token,
            proxy,
        })
    }

    fn settle_token(&self, result: Result<String, BridgeError>) {
        if self.token.settle(result).is_err() {
            warn!("Server token was resolved twice");
        }
    }
}

//! In-process fakes for the supervisor, the server transport and the IDE host.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::bridge::host::IdeHost;
use crate::common::error::{ConnectionError, ConnectionResult, SupervisorError, SupervisorResult};
use crate::common::types::{
    ActiveRequest, ApiEndpoint, NotifyRequest, RequestId, ResourcesStatus,
    SubscribeActiveResponse, SubscribeResponse, TokenRequest, TrackMessage, WorkspaceInfo,
};
use crate::server::connector::{CloseReason, ConnectParams, Connector, ServerConnection};
use crate::supervisor::client::{SupervisorApi, SupervisorStream};

pub fn connect_params() -> ConnectParams {
    ConnectParams {
        endpoint: "wss://api.workspace.example.com/v1".to_string(),
        origin: "https://workspace.example.com".to_string(),
        api_host: "api.workspace.example.com".to_string(),
        plugin_id: "workspace-bridge".to_string(),
        plugin_version: "1.2.3".to_string(),
        token: "secret-token".to_string(),
        proxy: None,
    }
}

pub fn workspace_info() -> WorkspaceInfo {
    WorkspaceInfo {
        workspace_id: "amber-ant-1".to_string(),
        instance_id: "instance-42".to_string(),
        checkout_location: "/workspace/project".to_string(),
        workspace_context_url: "https://github.com/example/project".to_string(),
        owner_id: "owner-7".to_string(),
        gitpod_host: "https://workspace.example.com".to_string(),
        gitpod_api: ApiEndpoint {
            endpoint: "wss://api.workspace.example.com/v1".to_string(),
            host: "api.workspace.example.com".to_string(),
        },
    }
}

fn unavailable() -> SupervisorError {
    SupervisorError::Request {
        path: "/_supervisor/v1".to_string(),
        message: "connection refused".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Server transport
// ---------------------------------------------------------------------------

/// One scripted outcome of [`Connector::connect`].
pub enum Step {
    Connect(RemoteEnd),
    Fail(ConnectionError),
}

#[derive(Default)]
struct Script {
    steps: VecDeque<Step>,
    attempts: Vec<Instant>,
    params: Vec<ConnectParams>,
}

/// Plays back scripted connect outcomes. Once the script is exhausted every
/// further handshake hangs forever.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnector {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                steps: steps.into(),
                ..Script::default()
            })),
        }
    }

    /// When each attempt started.
    pub fn attempts(&self) -> Vec<Instant> {
        self.script.lock().unwrap().attempts.clone()
    }

    /// Parameters of each attempt.
    pub fn params(&self) -> Vec<ConnectParams> {
        self.script.lock().unwrap().params.clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Connection = FakeConnection;

    async fn connect(&self, params: &ConnectParams) -> ConnectionResult<FakeConnection> {
        let step = {
            let mut script = self.script.lock().unwrap();
            script.attempts.push(Instant::now());
            script.params.push(params.clone());
            script.steps.pop_front()
        };

        match step {
            Some(Step::Connect(remote)) => Ok(FakeConnection { remote }),
            Some(Step::Fail(e)) => Err(e),
            None => std::future::pending().await,
        }
    }
}

#[derive(Default)]
struct RemoteState {
    sent: Mutex<Vec<TrackMessage>>,
    remote_close: Mutex<Option<CloseReason>>,
    closed_locally: AtomicBool,
    stalled: AtomicBool,
    wake: Notify,
}

/// Test-side view of a [`FakeConnection`].
#[derive(Clone, Default)]
pub struct RemoteEnd(Arc<RemoteState>);

impl RemoteEnd {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection whose peer stopped reading: sends and closes never finish.
    pub fn stalled() -> Self {
        let remote = Self::default();
        remote.0.stalled.store(true, Ordering::SeqCst);
        remote
    }

    /// Make the server end the connection.
    pub fn close_remotely(&self, reason: &str) {
        *self.0.remote_close.lock().unwrap() = Some(CloseReason::Remote {
            code: Some(1000),
            reason: reason.to_string(),
        });
        self.0.wake.notify_one();
    }

    pub fn sent(&self) -> Vec<TrackMessage> {
        self.0.sent.lock().unwrap().clone()
    }

    pub fn was_closed(&self) -> bool {
        self.0.closed_locally.load(Ordering::SeqCst)
    }
}

pub struct FakeConnection {
    remote: RemoteEnd,
}

#[async_trait]
impl ServerConnection for FakeConnection {
    async fn closed(&mut self) -> CloseReason {
        loop {
            if let Some(reason) = self.remote.0.remote_close.lock().unwrap().clone() {
                return reason;
            }
            self.remote.0.wake.notified().await;
        }
    }

    async fn track_event(&mut self, message: &TrackMessage) -> ConnectionResult<()> {
        if self.remote.0.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.remote.0.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn close(&mut self) {
        self.remote.0.closed_locally.store(true, Ordering::SeqCst);
        if self.remote.0.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

type Batch<T> = Vec<SupervisorResult<T>>;

/// Scriptable [`SupervisorApi`].
///
/// Each `subscribe*` call plays the next scripted batch and then ends the
/// stream; once batches run out, subscriptions stay open and silent.
#[derive(Default)]
pub struct FakeSupervisor {
    pub info_failures: AtomicUsize,
    pub info_calls: AtomicUsize,
    pub token_failures: AtomicUsize,
    pub token_calls: AtomicUsize,
    pub token_requests: Mutex<Vec<TokenRequest>>,
    pub status_calls: AtomicUsize,
    pub notifications: Mutex<VecDeque<Batch<SubscribeResponse>>>,
    pub subscribe_calls: AtomicUsize,
    pub responses: Mutex<Vec<(RequestId, String)>>,
    pub active_requests: Mutex<VecDeque<Batch<SubscribeActiveResponse>>>,
    pub active_subscribe_calls: AtomicUsize,
    pub active_responses: Mutex<Vec<RequestId>>,
    pub pushed: Mutex<Vec<(String, String)>>,
}

impl FakeSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_info(failures: usize) -> Arc<Self> {
        let supervisor = Self::default();
        supervisor.info_failures.store(failures, Ordering::SeqCst);
        Arc::new(supervisor)
    }

    pub fn failing_token(failures: usize) -> Arc<Self> {
        let supervisor = Self::default();
        supervisor.token_failures.store(failures, Ordering::SeqCst);
        Arc::new(supervisor)
    }

    pub fn push_notifications(&self, batch: Batch<SubscribeResponse>) {
        self.notifications.lock().unwrap().push_back(batch);
    }

    pub fn push_active_requests(&self, batch: Batch<SubscribeActiveResponse>) {
        self.active_requests.lock().unwrap().push_back(batch);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn play<T: Send + 'static>(batches: &Mutex<VecDeque<Batch<T>>>) -> SupervisorStream<T> {
        match batches.lock().unwrap().pop_front() {
            Some(batch) => futures::stream::iter(batch).boxed(),
            None => futures::stream::pending().boxed(),
        }
    }
}

#[async_trait]
impl SupervisorApi for FakeSupervisor {
    async fn workspace_info(&self) -> SupervisorResult<WorkspaceInfo> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.info_failures) {
            return Err(unavailable());
        }
        Ok(workspace_info())
    }

    async fn token(&self, request: &TokenRequest) -> SupervisorResult<String> {
        self.token_calls.fetch_add(1, Ordering::SeqCst);
        self.token_requests.lock().unwrap().push(request.clone());
        if Self::take_failure(&self.token_failures) {
            return Err(unavailable());
        }
        Ok("secret-token".to_string())
    }

    async fn resources_status(&self) -> SupervisorResult<ResourcesStatus> {
        let calls = self.status_calls.fetch_add(1, Ordering::SeqCst) as i64 + 1;
        let mut status = ResourcesStatus::default();
        status.memory.used = calls * 1024;
        status.memory.limit = 8 * 1024 * 1024;
        Ok(status)
    }

    async fn subscribe(&self) -> SupervisorResult<SupervisorStream<SubscribeResponse>> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::play(&self.notifications))
    }

    async fn respond(&self, request_id: RequestId, action: &str) -> SupervisorResult<()> {
        self.responses
            .lock()
            .unwrap()
            .push((request_id, action.to_string()));
        Ok(())
    }

    async fn subscribe_active(&self) -> SupervisorResult<SupervisorStream<SubscribeActiveResponse>> {
        self.active_subscribe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::play(&self.active_requests))
    }

    async fn active_respond(&self, request_id: RequestId) -> SupervisorResult<()> {
        self.active_responses.lock().unwrap().push(request_id);
        Ok(())
    }

    async fn push_metrics(&self, job: &str, body: String) -> SupervisorResult<()> {
        self.pushed.lock().unwrap().push((job.to_string(), body));
        Ok(())
    }
}

pub fn notification(id: i64, message: &str, actions: &[&str]) -> SubscribeResponse {
    SubscribeResponse {
        request_id: RequestId(id),
        request: NotifyRequest {
            message: message.to_string(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
            ..NotifyRequest::default()
        },
    }
}

// ---------------------------------------------------------------------------
// IDE host
// ---------------------------------------------------------------------------

/// Records every host interaction.
#[derive(Default)]
pub struct RecordingHost {
    /// Action reported as chosen for every notification.
    pub chosen_action: Option<String>,
    pub fail_active: bool,
    pub notifications: Mutex<Vec<NotifyRequest>>,
    pub active: Mutex<Vec<ActiveRequest>>,
    pub opened: Mutex<Vec<String>>,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn choosing(action: &str) -> Arc<Self> {
        Arc::new(Self {
            chosen_action: Some(action.to_string()),
            ..Self::default()
        })
    }

    pub fn failing_active() -> Arc<Self> {
        Arc::new(Self {
            fail_active: true,
            ..Self::default()
        })
    }
}

#[async_trait]
impl IdeHost for RecordingHost {
    async fn notify(&self, request: &NotifyRequest) -> Option<String> {
        self.notifications.lock().unwrap().push(request.clone());
        self.chosen_action.clone()
    }

    async fn handle_active(&self, request: &ActiveRequest) -> anyhow::Result<()> {
        self.active.lock().unwrap().push(request.clone());
        if self.fail_active {
            return Err(anyhow!("no focused project"));
        }
        Ok(())
    }

    async fn open_browser(&self, url: &str) -> anyhow::Result<()> {
        self.opened.lock().unwrap().push(url.to_string());
        Ok(())
    }
}

//! Client for the co-located supervisor process.
//!
//! One [`HttpSupervisor`] is created per process and shared by every task
//! that talks to the supervisor; each call is an independent request, so no
//! coordination is needed between callers.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tracing::debug;
use url::Url;

use crate::common::error::{SupervisorError, SupervisorResult};
use crate::common::types::{
    RequestId, ResourcesStatus, SubscribeActiveResponse, SubscribeResponse, TokenRequest,
    TokenResponse, WorkspaceInfo,
};
use crate::supervisor::codec::EnvelopeCodec;

/// A lazily started stream of supervisor messages.
///
/// Dropping the stream cancels the underlying call.
pub type SupervisorStream<T> = BoxStream<'static, SupervisorResult<T>>;

/// Capabilities of the supervisor process.
#[async_trait]
pub trait SupervisorApi: Send + Sync + 'static {
    async fn workspace_info(&self) -> SupervisorResult<WorkspaceInfo>;

    /// Issue a token for the remote server, limited to the requested scopes.
    async fn token(&self, request: &TokenRequest) -> SupervisorResult<String>;

    async fn resources_status(&self) -> SupervisorResult<ResourcesStatus>;

    /// Subscribe to notifications for all clients.
    async fn subscribe(&self) -> SupervisorResult<SupervisorStream<SubscribeResponse>>;

    /// Answer a notification with the action the user picked.
    async fn respond(&self, request_id: RequestId, action: &str) -> SupervisorResult<()>;

    /// Subscribe to requests meant for the focused client only.
    async fn subscribe_active(&self) -> SupervisorResult<SupervisorStream<SubscribeActiveResponse>>;

    /// Acknowledge that an active request was handled.
    async fn active_respond(&self, request_id: RequestId) -> SupervisorResult<()>;

    /// Push metrics in text exposition format under `job`.
    async fn push_metrics(&self, job: &str, body: String) -> SupervisorResult<()>;
}

/// [`SupervisorApi`] over the supervisor's HTTP/JSON gateway.
pub struct HttpSupervisor {
    client: Client,
    api: Url,
    root: Url,
}

impl HttpSupervisor {
    pub fn new(base_url: &str) -> SupervisorResult<Self> {
        let root = Url::parse(&format!("{}/", base_url.trim_end_matches('/'))).map_err(|e| {
            SupervisorError::Request {
                path: base_url.to_string(),
                message: e.to_string(),
            }
        })?;
        let api = join(&root, "_supervisor/v1/")?;

        // Streaming calls stay open indefinitely, so only bound connecting.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| SupervisorError::Request {
                path: root.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self { client, api, root })
    }

    fn endpoint(&self, path: &str) -> SupervisorResult<Url> {
        join(&self.api, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> SupervisorResult<T> {
        let response = self.send(self.client.get(url.clone()), &url).await?;
        response.json().await.map_err(|e| SupervisorError::Decode {
            message: e.to_string(),
        })
    }

    async fn post_json(&self, url: Url, body: serde_json::Value) -> SupervisorResult<()> {
        self.send(self.client.post(url.clone()).json(&body), &url)
            .await
            .map(drop)
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &Url) -> SupervisorResult<Response> {
        let response = request.send().await.map_err(|e| SupervisorError::Request {
            path: url.path().to_string(),
            message: e.to_string(),
        })?;
        check_status(response, url).await
    }

    async fn stream<T>(&self, url: Url) -> SupervisorResult<SupervisorStream<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        debug!("Subscribing to {}", url.path());
        let response = self.send(self.client.get(url.clone()), &url).await?;
        let body = response.bytes_stream().map_err(std::io::Error::other);
        let frames = FramedRead::new(StreamReader::new(body), EnvelopeCodec::<T>::new());
        Ok(frames.boxed())
    }
}

#[async_trait]
impl SupervisorApi for HttpSupervisor {
    async fn workspace_info(&self) -> SupervisorResult<WorkspaceInfo> {
        self.get_json(self.endpoint("info/workspace")?).await
    }

    async fn token(&self, request: &TokenRequest) -> SupervisorResult<String> {
        let url = token_url(&self.api, request)?;
        let response: TokenResponse = self.get_json(url).await?;
        Ok(response.token)
    }

    async fn resources_status(&self) -> SupervisorResult<ResourcesStatus> {
        self.get_json(self.endpoint("status/resources")?).await
    }

    async fn subscribe(&self) -> SupervisorResult<SupervisorStream<SubscribeResponse>> {
        self.stream(self.endpoint("notification/subscribe")?).await
    }

    async fn respond(&self, request_id: RequestId, action: &str) -> SupervisorResult<()> {
        let body = json!({
            "requestId": request_id.0.to_string(),
            "response": { "action": action },
        });
        self.post_json(self.endpoint("notification/respond")?, body).await
    }

    async fn subscribe_active(&self) -> SupervisorResult<SupervisorStream<SubscribeActiveResponse>> {
        self.stream(self.endpoint("notification/active/subscribe")?).await
    }

    async fn active_respond(&self, request_id: RequestId) -> SupervisorResult<()> {
        let body = json!({
            "requestId": request_id.0.to_string(),
            "response": {},
        });
        self.post_json(self.endpoint("notification/active/respond")?, body)
            .await
    }

    async fn push_metrics(&self, job: &str, body: String) -> SupervisorResult<()> {
        let url = join(&self.root, &format!("metrics/job/{}", job))?;
        let request = self
            .client
            .put(url.clone())
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(body);
        self.send(request, &url).await.map(drop)
    }
}

fn join(base: &Url, path: &str) -> SupervisorResult<Url> {
    base.join(path).map_err(|e| SupervisorError::Request {
        path: path.to_string(),
        message: e.to_string(),
    })
}

fn token_url(api: &Url, request: &TokenRequest) -> SupervisorResult<Url> {
    let mut url = api.clone();
    url.path_segments_mut()
        .map_err(|_| SupervisorError::Request {
            path: api.to_string(),
            message: "supervisor URL cannot be a base".to_string(),
        })?
        .pop_if_empty()
        .extend(["token", request.kind.as_str(), request.host.as_str()]);
    {
        let mut query = url.query_pairs_mut();
        for scope in &request.scopes {
            query.append_pair("scope", scope);
        }
    }
    Ok(url)
}

async fn check_status(response: Response, url: &Url) -> SupervisorResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(SupervisorError::Status {
        path: url.path().to_string(),
        status: status.as_u16(),
        message,
    })
}

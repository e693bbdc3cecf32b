//! WebSocket transport for the remote API server.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, ORIGIN, USER_AGENT};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::common::error::{ConnectionError, ConnectionResult};
use crate::common::types::TrackMessage;
use crate::server::connector::{CloseReason, ConnectParams, Connector, ServerConnection};

/// Upper bound for a proxy's CONNECT response head.
const MAX_PROXY_RESPONSE: usize = 8 * 1024;

/// How long to wait for the server to finish a close handshake it started.
const CLOSE_DRAIN: Duration = Duration::from_secs(1);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket connections, optionally tunnelled through an HTTP proxy.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn handshake(&self, params: &ConnectParams) -> ConnectionResult<Socket> {
        let endpoint = Url::parse(&params.endpoint).map_err(|e| invalid(params, e))?;
        let host = endpoint
            .host_str()
            .ok_or_else(|| invalid(params, "missing host"))?
            .to_string();
        let port = endpoint
            .port_or_known_default()
            .ok_or_else(|| invalid(params, "missing port"))?;

        let request = build_request(params)?;

        let stream = match &params.proxy {
            Some(proxy) => {
                let proxy_host = proxy.host_str().ok_or_else(|| ConnectionError::Proxy {
                    message: format!("proxy '{}' has no host", proxy),
                })?;
                let proxy_port = proxy.port_or_known_default().unwrap_or(3128);
                debug!("Tunnelling to {}:{} through {}:{}", host, port, proxy_host, proxy_port);

                let mut stream = TcpStream::connect((proxy_host, proxy_port))
                    .await
                    .map_err(|e| ConnectionError::Proxy {
                        message: format!("{}:{}: {}", proxy_host, proxy_port, e),
                    })?;
                establish_tunnel(&mut stream, &host, port).await?;
                stream
            }
            None => TcpStream::connect((host.as_str(), port)).await?,
        };
        stream.set_nodelay(true)?;

        let (socket, response) =
            tokio_tungstenite::client_async_tls_with_config(request, stream, None, None)
                .await
                .map_err(handshake_error)?;
        debug!("Handshake completed with status {}", response.status());
        Ok(socket)
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    type Connection = WebSocketConnection;

    async fn connect(&self, params: &ConnectParams) -> ConnectionResult<WebSocketConnection> {
        info!("Connecting to {}", params.endpoint);
        let socket = tokio::time::timeout(self.connect_timeout, self.handshake(params))
            .await
            .map_err(|_| ConnectionError::Timeout)??;

        Ok(WebSocketConnection {
            socket,
            next_id: 0,
            closed: None,
        })
    }
}

/// A live JSON-RPC over WebSocket connection.
pub struct WebSocketConnection {
    socket: Socket,
    next_id: u64,
    closed: Option<CloseReason>,
}

#[async_trait]
impl ServerConnection for WebSocketConnection {
    async fn closed(&mut self) -> CloseReason {
        if let Some(reason) = &self.closed {
            return reason.clone();
        }

        // `next()` is cancel-safe; nothing is lost if this future is dropped.
        let reason = loop {
            match self.socket.next().await {
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => CloseReason::Remote {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.into_owned(),
                        },
                        None => CloseReason::Remote {
                            code: None,
                            reason: String::new(),
                        },
                    };
                }
                Some(Ok(Message::Text(text))) => debug!("Server message: {}", text),
                Some(Ok(_)) => {}
                Some(Err(e)) => break CloseReason::Transport(e.to_string()),
                None => break CloseReason::EndOfStream,
            }
        };

        self.closed = Some(reason.clone());
        if matches!(reason, CloseReason::Remote { .. }) {
            self.finish_close_handshake().await;
        }
        reason
    }

    async fn track_event(&mut self, message: &TrackMessage) -> ConnectionResult<()> {
        self.next_id += 1;
        let request = json!({
            "jsonrpc": "2.0",
            "id": self.next_id,
            "method": "trackEvent",
            "params": message,
        });

        self.socket
            .send(Message::Text(request.to_string()))
            .await
            .map_err(|e| ConnectionError::Transport {
                message: e.to_string(),
            })
    }

    async fn close(&mut self) {
        if self.closed.is_some() {
            return;
        }
        if let Err(e) = self.socket.close(None).await {
            debug!("Error while closing connection: {}", e);
        }
        self.closed = Some(CloseReason::EndOfStream);
    }
}

impl WebSocketConnection {
    /// Reading flushes the queued close reply; keep going until the server
    /// drops the stream.
    async fn finish_close_handshake(&mut self) {
        let drain = async {
            while let Some(Ok(_)) = self.socket.next().await {}
        };
        if tokio::time::timeout(CLOSE_DRAIN, drain).await.is_err() {
            debug!("Server did not finish the close handshake");
        }
    }
}

fn build_request(
    params: &ConnectParams,
) -> ConnectionResult<tungstenite::handshake::client::Request> {
    let mut request = params
        .endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| invalid(params, e))?;

    let headers = request.headers_mut();
    headers.insert(AUTHORIZATION, header(params, &format!("Bearer {}", params.token))?);
    headers.insert(ORIGIN, header(params, &params.origin)?);
    headers.insert(
        USER_AGENT,
        header(params, &format!("{}/{}", params.plugin_id, params.plugin_version))?,
    );
    headers.insert("X-Client-Version", header(params, &params.plugin_version)?);
    Ok(request)
}

fn header(params: &ConnectParams, value: &str) -> ConnectionResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| invalid(params, e))
}

fn invalid(params: &ConnectParams, e: impl ToString) -> ConnectionError {
    ConnectionError::InvalidEndpoint {
        endpoint: params.endpoint.clone(),
        message: e.to_string(),
    }
}

/// Classify a failed upgrade. Any HTTP answer other than `101` is a refusal.
fn handshake_error(e: tungstenite::Error) -> ConnectionError {
    match e {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            let message = match response.body() {
                Some(body) if !body.is_empty() => String::from_utf8_lossy(body).into_owned(),
                _ => status.canonical_reason().unwrap_or("unknown").to_string(),
            };
            ConnectionError::HandshakeRejected {
                status: status.as_u16(),
                message,
            }
        }
        tungstenite::Error::Url(e) => ConnectionError::InvalidEndpoint {
            endpoint: String::new(),
            message: e.to_string(),
        },
        tungstenite::Error::Io(e) => e.into(),
        e => ConnectionError::Transport {
            message: e.to_string(),
        },
    }
}

/// Ask an HTTP proxy to open a tunnel to `host:port`.
///
/// Reads the response head byte by byte so nothing after it is consumed.
pub async fn establish_tunnel<S>(stream: &mut S, host: &str, port: u16) -> ConnectionResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut head = Vec::with_capacity(128);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_PROXY_RESPONSE {
            return Err(ConnectionError::Proxy {
                message: "response head too large".to_string(),
            });
        }
        let byte = stream.read_u8().await.map_err(|e| ConnectionError::Proxy {
            message: format!("reading response: {}", e),
        })?;
        head.push(byte);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok());

    match status {
        Some(code) if (200..300).contains(&code) => Ok(()),
        _ => Err(ConnectionError::Proxy {
            message: format!("tunnel refused: {}", status_line),
        }),
    }
}

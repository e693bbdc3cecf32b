//! Long-lived server connection with automatic reconnection.
//!
//! The session cycles `Connecting -> Connected -> Closing -> BackoffWait ->
//! Connecting` until it is cancelled or the server refuses the handshake.
//! Attempts are strictly sequential. The backoff delay is reset only by a
//! successful connect, so a connection that drops right after a long healthy
//! run reconnects quickly.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::error::ConnectionError;
use crate::common::reconnect::{ReconnectConfig, ReconnectState};
use crate::common::types::TrackMessage;
use crate::server::connector::{CloseReason, ConnectParams, Connector, ServerConnection};

/// Upper bound for closing a live connection on cancellation.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Closing,
    /// Sleeping for the given delay before the next attempt.
    BackoffWait(Duration),
    Terminated,
}

/// Outcome of one connection lifecycle.
#[derive(Debug)]
pub enum ConnectionAttemptResult {
    /// Connected, then the connection ended.
    Closed(CloseReason),
    /// Could not connect; worth trying again.
    Failed(ConnectionError),
    /// The server refused the handshake; retrying cannot help.
    FatalProtocolError(ConnectionError),
}

impl ConnectionAttemptResult {
    fn classify(error: ConnectionError) -> Self {
        if error.is_fatal() {
            Self::FatalProtocolError(error)
        } else {
            Self::Failed(error)
        }
    }
}

/// Why the session stopped for good.
#[derive(Debug, Clone)]
pub enum Termination {
    FatalProtocolError(ConnectionError),
    Cancelled,
}

/// Snapshot published after every transition.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    /// Delay the next backoff wait will use.
    pub reconnect_delay: Duration,
    /// Connection attempts made so far.
    pub attempts: u64,
    /// Attempts that produced a live connection.
    pub connections: u64,
}

impl SessionStatus {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self {
            state: ConnectionState::Idle,
            reconnect_delay,
            attempts: 0,
            connections: 0,
        }
    }
}

pub struct ConnectionSession<C: Connector> {
    connector: C,
    params: ConnectParams,
    reconnect: ReconnectState,
    outbound: mpsc::Receiver<TrackMessage>,
    status: watch::Sender<SessionStatus>,
}

impl<C: Connector> ConnectionSession<C> {
    pub fn new(
        connector: C,
        params: ConnectParams,
        reconnect: ReconnectConfig,
        outbound: mpsc::Receiver<TrackMessage>,
        status: watch::Sender<SessionStatus>,
    ) -> Self {
        Self {
            connector,
            params,
            reconnect: ReconnectState::new(reconnect),
            outbound,
            status,
        }
    }

    /// Drive the session until cancellation or a fatal handshake rejection.
    pub async fn run(mut self, cancel: CancellationToken) -> Termination {
        let host = self.params.api_host.clone();

        loop {
            self.transition(ConnectionState::Connecting);
            self.status.send_modify(|s| s.attempts += 1);

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.terminate(Termination::Cancelled),
                attempt = self.connector.connect(&self.params) => attempt,
            };

            let result = match attempt {
                Ok(connection) => {
                    info!("{}: connected", host);
                    self.reconnect.reset();
                    self.status.send_modify(|s| s.connections += 1);
                    self.transition(ConnectionState::Connected);

                    match self.serve(connection, &cancel).await {
                        Some(reason) => ConnectionAttemptResult::Closed(reason),
                        None => return self.terminate(Termination::Cancelled),
                    }
                }
                Err(error) => ConnectionAttemptResult::classify(error),
            };

            let delay = self.reconnect.current_delay();
            match result {
                ConnectionAttemptResult::Closed(reason) => warn!(
                    "{}: connection closed, reconnecting after {} milliseconds: {}",
                    host,
                    delay.as_millis(),
                    reason
                ),
                ConnectionAttemptResult::Failed(error) => warn!(
                    "{}: failed to connect, trying again after {} milliseconds: {}",
                    host,
                    delay.as_millis(),
                    error
                ),
                ConnectionAttemptResult::FatalProtocolError(error) => {
                    warn!("{}: connection permanently closed: {}", host, error);
                    return self.terminate(Termination::FatalProtocolError(error));
                }
            }

            self.transition(ConnectionState::Closing);
            let delay = self.reconnect.advance();
            self.transition(ConnectionState::BackoffWait(delay));

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.terminate(Termination::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run a live connection. Returns `None` if cancelled.
    async fn serve(
        &mut self,
        mut connection: C::Connection,
        cancel: &CancellationToken,
    ) -> Option<CloseReason> {
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                reason = connection.closed() => return Some(reason),
                Some(message) = self.outbound.recv() => message,
            };

            // A peer that stops reading must not hold up cancellation.
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = connection.track_event(&message) => sent,
            };
            if let Err(e) = sent {
                warn!("Failed to send '{}' event: {}", message.event, e);
            }
        }

        if tokio::time::timeout(CLOSE_TIMEOUT, connection.close())
            .await
            .is_err()
        {
            debug!("{}: close did not complete in time", self.params.api_host);
        }
        None
    }

    fn transition(&self, state: ConnectionState) {
        debug!("{}: {:?}", self.params.api_host, state);
        let reconnect_delay = self.reconnect.current_delay();
        self.status.send_modify(|s| {
            s.state = state;
            s.reconnect_delay = reconnect_delay;
        });
    }

    fn terminate(&self, termination: Termination) -> Termination {
        self.transition(ConnectionState::Terminated);
        termination
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;
    use tokio::time::Instant;

    use super::*;
    use crate::testing::{connect_params, RemoteEnd, ScriptedConnector, Step};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    struct Harness {
        connector: ScriptedConnector,
        status: watch::Receiver<SessionStatus>,
        outbound: mpsc::Sender<TrackMessage>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<Termination>,
    }

    fn start(steps: Vec<Step>) -> Harness {
        let connector = ScriptedConnector::new(steps);
        let config = ReconnectConfig::default();
        let (status_tx, status) = watch::channel(SessionStatus::new(config.min_delay));
        let (outbound, outbound_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let session = ConnectionSession::new(
            connector.clone(),
            connect_params(),
            config,
            outbound_rx,
            status_tx,
        );
        let task = tokio::spawn(session.run(cancel.clone()));

        Harness {
            connector,
            status,
            outbound,
            cancel,
            task,
        }
    }

    fn transient() -> ConnectionError {
        ConnectionError::Transport {
            message: "connection refused".to_string(),
        }
    }

    fn gaps(attempts: &[Instant]) -> Vec<Duration> {
        attempts.windows(2).map(|w| w[1] - w[0]).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_then_resets_on_connect() {
        let remote = RemoteEnd::new();
        let mut h = start(vec![
            Step::Fail(transient()),
            Step::Fail(transient()),
            Step::Fail(transient()),
            Step::Connect(remote.clone()),
        ]);

        h.status
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await
            .unwrap();

        assert_eq!(gaps(&h.connector.attempts()), vec![ms(2000), ms(3000), ms(4500)]);
        let status = h.status.borrow().clone();
        assert_eq!(status.reconnect_delay, ms(2000));
        assert_eq!(status.attempts, 4);
        assert_eq!(status.connections, 1);

        h.cancel.cancel();
        assert!(matches!(h.task.await.unwrap(), Termination::Cancelled));
        assert!(remote.was_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_close_waits_minimum_delay() {
        let first = RemoteEnd::new();
        let second = RemoteEnd::new();
        let mut h = start(vec![
            Step::Fail(transient()),
            Step::Fail(transient()),
            Step::Connect(first.clone()),
            Step::Connect(second.clone()),
        ]);

        h.status
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await
            .unwrap();

        // Stay connected for a while, then the server goes away.
        tokio::time::sleep(Duration::from_secs(600)).await;
        first.close_remotely("remote closed");

        let status = h
            .status
            .wait_for(|s| matches!(s.state, ConnectionState::BackoffWait(_)))
            .await
            .unwrap()
            .clone();
        assert_eq!(status.state, ConnectionState::BackoffWait(ms(2000)));

        h.status
            .wait_for(|s| s.connections == 2 && s.state == ConnectionState::Connected)
            .await
            .unwrap();
        let attempts = h.connector.attempts();
        assert_eq!(attempts.len(), 4);
        assert_eq!(attempts[3] - attempts[2], Duration::from_secs(600) + ms(2000));

        h.cancel.cancel();
        h.task.await.unwrap();
        assert!(second.was_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_rejection_is_not_retried() {
        let mut h = start(vec![
            Step::Fail(transient()),
            Step::Fail(ConnectionError::HandshakeRejected {
                status: 401,
                message: "Unauthorized".to_string(),
            }),
            Step::Connect(RemoteEnd::new()),
        ]);

        match h.task.await.unwrap() {
            Termination::FatalProtocolError(ConnectionError::HandshakeRejected { status, .. }) => {
                assert_eq!(status, 401)
            }
            other => panic!("expected fatal termination, got {:?}", other),
        }
        assert_eq!(h.connector.attempts().len(), 2);
        assert_eq!(h.status.borrow_and_update().state, ConnectionState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_skips_next_attempt() {
        let mut h = start(vec![Step::Fail(transient()), Step::Connect(RemoteEnd::new())]);

        h.status
            .wait_for(|s| matches!(s.state, ConnectionState::BackoffWait(_)))
            .await
            .unwrap();

        let cancelled_at = Instant::now();
        h.cancel.cancel();
        assert!(matches!(h.task.await.unwrap(), Termination::Cancelled));

        assert!(Instant::now() - cancelled_at < ms(2000));
        assert_eq!(h.connector.attempts().len(), 1);
        assert_eq!(h.status.borrow().state, ConnectionState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_handshake() {
        // No scripted steps: the handshake never completes.
        let h = start(vec![]);
        tokio::time::sleep(Duration::from_secs(5)).await;

        h.cancel.cancel();
        assert!(matches!(h.task.await.unwrap(), Termination::Cancelled));
        assert_eq!(h.connector.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_are_forwarded_while_connected() {
        let remote = RemoteEnd::new();
        let mut h = start(vec![Step::Connect(remote.clone())]);

        h.outbound
            .send(TrackMessage {
                event: "ide_opened".to_string(),
                properties: Map::new(),
            })
            .await
            .unwrap();
        h.status
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        while remote.sent().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(ms(10)).await;
        }
        assert_eq!(remote.sent().len(), 1);
        assert_eq!(remote.sent()[0].event, "ide_opened");

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_event_send_is_stuck() {
        let remote = RemoteEnd::stalled();
        let mut h = start(vec![Step::Connect(remote.clone())]);

        h.status
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await
            .unwrap();
        h.outbound
            .send(TrackMessage {
                event: "ide_opened".to_string(),
                properties: Map::new(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        let cancelled_at = Instant::now();
        h.cancel.cancel();
        let termination = tokio::time::timeout(Duration::from_secs(10), h.task)
            .await
            .expect("session should stop after cancellation")
            .unwrap();

        assert!(matches!(termination, Termination::Cancelled));
        assert!(Instant::now() - cancelled_at <= CLOSE_TIMEOUT);
        assert!(remote.was_closed());
        assert!(remote.sent().is_empty());
        assert_eq!(h.status.borrow().state, ConnectionState::Terminated);
    }
}

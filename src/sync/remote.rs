use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use super::protocol::{ClientMessage, ServerMessage};
use super::reconcile::{ClientSync, OperationSink, SyncState};
use crate::error::{with_retry, ErrorCategory, RetryPolicy, SyncError};

/// Progress published by a running [`SyncClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
    pub state: SyncState,
    pub last_seen_seq: u64,
}

/// Build `ws://host/ws?session_id=..&client_id=..` from a server base URL.
pub fn session_url(base: &str, session_id: &str, client_id: &str) -> Result<Url> {
    let mut url = Url::parse(base).map_err(|e| anyhow!("invalid ws url: {e}"))?;
    if url.path() == "/" || url.path().is_empty() {
        url.set_path("/ws");
    }
    url.query_pairs_mut()
        .append_pair("session_id", session_id)
        .append_pair("client_id", client_id);
    Ok(url)
}

/// Follows one session over WebSocket, reconciling into `sink` and
/// reconnecting with backoff when the transport drops.
pub struct SyncClient<S> {
    url: Url,
    sync: ClientSync,
    sink: S,
    policy: RetryPolicy,
    gap_timeout: Duration,
    status: watch::Sender<SyncStatus>,
}

/// Running client: its status feed and task.
pub struct ClientHandle {
    pub status: watch::Receiver<SyncStatus>,
    pub task: JoinHandle<Result<()>>,
}

impl ClientHandle {
    /// Wait until the client has applied everything up to `seq`.
    pub async fn wait_for_seq(&mut self, seq: u64, timeout: Duration) -> Result<SyncStatus> {
        let status = tokio::time::timeout(
            timeout,
            self.status
                .wait_for(|s| s.state == SyncState::Synchronized && s.last_seen_seq >= seq),
        )
        .await
        .map_err(|_| anyhow!("timed out waiting for seq {seq}"))??;
        Ok(*status)
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

impl<S> SyncClient<S>
where
    S: OperationSink + Send + 'static,
{
    pub fn new(url: Url, client_id: impl Into<String>, sink: S) -> Self {
        let (status, _) = watch::channel(SyncStatus {
            state: SyncState::Disconnected,
            last_seen_seq: 0,
        });
        Self {
            url,
            sync: ClientSync::new(client_id),
            sink,
            policy: RetryPolicy::default(),
            gap_timeout: Duration::from_secs(2),
            status,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_gap_timeout(mut self, timeout: Duration) -> Self {
        self.gap_timeout = timeout;
        self
    }

    pub fn spawn(self) -> ClientHandle {
        let status = self.status.subscribe();
        let task = tokio::spawn(self.run());
        ClientHandle { status, task }
    }

    /// Connect, follow, reconnect. Returns once reconnection gives up.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let target = self.url.to_string();
            let connected = with_retry(&self.policy, || {
                tokio_tungstenite::connect_async(target.clone())
            })
            .await;

            let (ws, _) = match connected {
                Ok(ws) => ws,
                Err(e) => {
                    error!(url = %self.url, "giving up on reconnect: {e}");
                    return Err(e);
                }
            };
            info!(url = %self.url, client = self.sync.client_id(), "connected");

            let outcome = self.follow(ws).await;
            self.sync.disconnect();
            self.publish();
            match outcome {
                Ok(()) => info!(url = %self.url, "server closed the connection"),
                Err(e) if e.category().is_retryable() => {
                    warn!(url = %self.url, "connection lost: {e}")
                }
                Err(e) => {
                    error!(url = %self.url, "stopping sync client: {e}");
                    return Err(e.into());
                }
            }
            tokio::time::sleep(self.policy.delay_for(1)).await;
        }
    }

    async fn follow<T>(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<T>,
    ) -> Result<(), SyncError>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut ws_tx, mut ws_rx) = ws.split();

        let hello = self.sync.connect();
        ws_tx
            .send(Message::text(hello.to_json()?))
            .await
            .map_err(SyncError::transport)?;
        self.publish();

        let mut gap_check = tokio::time::interval(self.gap_timeout);
        gap_check.tick().await;

        loop {
            let replies = tokio::select! {
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.on_text(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(SyncError::transport(e)),
                },
                _ = gap_check.tick() => self
                    .sync
                    .retry_stale_gap(Instant::now(), self.gap_timeout)
                    .into_iter()
                    .collect(),
            };

            for reply in replies {
                ws_tx
                    .send(Message::text(reply.to_json()?))
                    .await
                    .map_err(SyncError::transport)?;
            }
            self.publish();
        }
    }

    fn on_text(&mut self, text: &str) -> Vec<ClientMessage> {
        let msg = match serde_json::from_str::<ServerMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping malformed server message: {e}");
                return Vec::new();
            }
        };

        match self.sync.handle(msg, &mut self.sink) {
            Ok(replies) => replies,
            Err(err) if err.category() == ErrorCategory::Invariant => {
                error!(client = self.sync.client_id(), "full sync rejected: {err}");
                let client_id = self.sync.client_id().to_string();
                vec![
                    ClientMessage::SyncError {
                        client_id,
                        detail: err.to_string(),
                    },
                    self.sync.connect(),
                ]
            }
            Err(err) => {
                debug!("sync message failed: {err}");
                Vec::new()
            }
        }
    }

    fn publish(&self) {
        self.status.send_replace(SyncStatus {
            state: self.sync.state(),
            last_seen_seq: self.sync.last_seen_seq(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_url_adds_path_and_query() {
        let url = session_url("ws://127.0.0.1:3000", "lobby", "viewer 1").unwrap();
        assert_eq!(url.path(), "/ws");
        assert_eq!(
            url.query(),
            Some("session_id=lobby&client_id=viewer+1")
        );

        let explicit = session_url("ws://example.com/sync/ws", "a", "b").unwrap();
        assert_eq!(explicit.path(), "/sync/ws");
    }

    #[test]
    fn session_url_rejects_garbage() {
        assert!(session_url("not a url", "a", "b").is_err());
    }

    #[tokio::test]
    async fn run_gives_up_when_nothing_listens() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = session_url(&format!("ws://{addr}"), "s", "c").unwrap();
        let client = SyncClient::new(url, "c", Vec::<crate::ops::SequencedOperation>::new())
            .with_retry_policy(RetryPolicy::no_retry());
        let result = tokio::time::timeout(Duration::from_secs(5), client.run())
            .await
            .unwrap();
        assert!(result.is_err());
    }
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use colored::*;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{ErrorCategory, SyncError};
use crate::hub::{Connection, DropReason, Frame, HubError, HubStats, Outbox};
use crate::ops::{NewOperation, SequencedOperation};
use crate::service::SyncService;
use crate::sync::{ClientMessage, ServerMessage};

/// Upper bound on a single socket write before the writer gives up.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub service: SyncService,
}

pub fn router(service: SyncService) -> Router {
    let state = AppState { service };

    Router::new()
        .route("/", get(|| async { "worldsync operation sync server" }))
        .route("/health", get(|| async { Json("OK") }))
        .route("/stats", get(get_stats))
        .route("/ws", get(ws_handler))
        .route("/sessions/{session_id}/ops", get(get_ops).post(post_op))
        .route("/sessions/{session_id}/snapshot", get(get_snapshot))
        .route("/sessions/{session_id}/resume", post(resume_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the service has shut down.
pub async fn run(listener: TcpListener, service: SyncService) -> Result<()> {
    let app = router(service.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { service.stopped().await })
        .await?;
    Ok(())
}

pub async fn start(addr: SocketAddr, service: SyncService) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    run(listener, service).await
}

/// CLI entry: build the service from config and stop it on Ctrl-C.
pub async fn serve(config: SyncConfig) -> Result<()> {
    let service = SyncService::start(&config);
    let addr = config.server.addr()?;
    let listener = TcpListener::bind(addr).await?;

    println!(
        "{} Server running at {}",
        "✓".green(),
        format!("http://{}", listener.local_addr()?).bright_blue()
    );
    info!(%addr, "listening");

    let on_signal = service.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            on_signal.shutdown().await;
        }
    });

    run(listener, service).await
}

#[derive(Debug, Deserialize)]
struct WsParams {
    session_id: String,
    client_id: Option<String>,
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.service.is_accepting() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    ws.on_upgrade(move |socket| handle_ws(state, socket, params))
}

async fn handle_ws(state: AppState, socket: WebSocket, params: WsParams) {
    let hub = state.service.hub().clone();
    let client_id = params
        .client_id
        .unwrap_or_else(|| format!("anon-{}", Uuid::new_v4()));
    let (conn, outbox) = hub.open_connection(params.session_id.clone(), client_id);

    if let Err(e) = hub.register(conn.clone()).await {
        warn!(session = %params.session_id, "rejecting connection: {e}");
        return;
    }

    let (sender, mut receiver) = socket.split();

    let handshake = ServerMessage::Handshake {
        connection_id: conn.id(),
        session_id: params.session_id.clone(),
        current_sequence: state.service.head(&params.session_id),
    };
    enqueue(&state, &conn, &handshake).await;

    let mut send_task = tokio::spawn(write_frames(sender, outbox));
    let mut writer_done = false;

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_client_message(&state, &conn, text.as_str()).await;
                }
                Some(Ok(Message::Pong(_))) => hub.pong(conn.id()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn = %conn.id(), "socket error: {e}");
                    break;
                }
            },
            _ = &mut send_task => {
                writer_done = true;
                break;
            }
        }
    }

    hub.unregister(conn.id()).await;
    if !writer_done {
        let _ = send_task.await;
    }
    debug!(conn = %conn.id(), session = conn.session_id(), "connection finished");
}

async fn write_frames(mut sender: SplitSink<WebSocket, Message>, mut outbox: Outbox) {
    while let Some(frame) = outbox.next().await {
        let msg = match frame {
            Frame::Text(text) => Message::Text(text.to_string().into()),
            Frame::Ping => Message::Ping(Bytes::new()),
        };
        match tokio::time::timeout(WRITE_TIMEOUT, sender.send(msg)).await {
            Ok(Ok(())) => {}
            _ => return,
        }
    }
    let _ = tokio::time::timeout(WRITE_TIMEOUT, sender.send(Message::Close(None))).await;
}

async fn handle_client_message(state: &AppState, conn: &Connection, text: &str) {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(conn = %conn.id(), "dropping malformed client message: {e}");
            return;
        }
    };
    let session_id = conn.session_id();

    match msg {
        ClientMessage::RequestMissing { client_id, from, to } => {
            let reply = match state.service.range(session_id, from, to) {
                Ok(ops) => ServerMessage::MissingOperations {
                    operations: unshare(&ops),
                },
                Err(e) => {
                    debug!(session = session_id, client = %client_id, "gap fill refused: {e}");
                    ServerMessage::RangeUnavailable { from, to }
                }
            };
            enqueue(state, conn, &reply).await;
        }
        ClientMessage::RequestFullSync { client_id } => {
            let snapshot = state.service.snapshot(session_id);
            debug!(
                session = session_id,
                client = %client_id,
                head = snapshot.current_seq,
                count = snapshot.operations.len(),
                "serving full sync"
            );
            let full = ServerMessage::FullSync {
                operations: unshare(&snapshot.operations),
            };
            if enqueue(state, conn, &full).await {
                let done = ServerMessage::SyncComplete {
                    current_sequence: snapshot.current_seq,
                };
                enqueue(state, conn, &done).await;
            }
        }
        ClientMessage::SyncError { client_id, detail } => {
            state
                .service
                .report_violation(session_id, &client_id, &detail);
        }
    }
}

fn unshare(ops: &[Arc<SequencedOperation>]) -> Vec<SequencedOperation> {
    ops.iter().map(|op| SequencedOperation::clone(op)).collect()
}

/// Queue a reply on the connection; a full queue drops the connection.
async fn enqueue(state: &AppState, conn: &Connection, msg: &ServerMessage) -> bool {
    let json = match msg.to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!("failed to encode reply: {e}");
            return false;
        }
    };
    match conn.try_send(Frame::Text(Arc::from(json))) {
        Ok(()) => true,
        Err(HubError::Backpressure) => {
            state
                .service
                .hub()
                .drop_connection(conn.id(), DropReason::Backpressure)
                .await;
            false
        }
        Err(e) => {
            debug!(conn = %conn.id(), "reply not queued: {e}");
            false
        }
    }
}

#[derive(Debug)]
struct ApiError(SyncError);

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0.category() {
            ErrorCategory::Retention => StatusCode::GONE,
            ErrorCategory::Validation => StatusCode::BAD_REQUEST,
            ErrorCategory::Invariant => match self.0 {
                SyncError::SessionHalted(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ErrorCategory::Lifecycle | ErrorCategory::Backpressure => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorCategory::Transport => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub seq_num: u64,
}

async fn post_op(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(op): Json<NewOperation>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let seq_num = state.service.submit(&session_id, op).await?;
    Ok(Json(SubmitResponse { seq_num }))
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    from: Option<u64>,
    to: Option<u64>,
}

async fn get_ops(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Vec<SequencedOperation>>, ApiError> {
    let head = state.service.head(&session_id);
    let from = query.from.unwrap_or(1);
    let to = query.to.unwrap_or(head);
    if head == 0 && query.to.is_none() {
        return Ok(Json(Vec::new()));
    }
    let ops = state.service.range(&session_id, from, to)?;
    Ok(Json(unshare(&ops)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub current_sequence: u64,
    pub operations: Vec<SequencedOperation>,
}

async fn get_snapshot(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<SnapshotResponse> {
    let snapshot = state.service.snapshot(&session_id);
    Json(SnapshotResponse {
        current_sequence: snapshot.current_seq,
        operations: unshare(&snapshot.operations),
    })
}

async fn resume_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<serde_json::Value> {
    let resumed = state.service.resume(&session_id);
    Json(serde_json::json!({ "session_id": session_id, "resumed": resumed }))
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<HubStats>, ApiError> {
    Ok(Json(state.service.stats().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubConfig;
    use crate::sequencer::RetentionPolicy;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    fn service(max_ops: usize) -> SyncService {
        SyncService::with_parts(
            RetentionPolicy {
                max_ops,
                ..Default::default()
            },
            HubConfig::default(),
        )
    }

    fn submit_request(session: &str, entity: &str) -> Request<Body> {
        let body = json!({
            "client_id": "rest",
            "type": "entity_delete",
            "data": { "entity_id": entity }
        });
        Request::builder()
            .method("POST")
            .uri(format!("/sessions/{session}/ops"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn post_returns_seq_num() {
        let app = router(service(100));
        let resp = app.clone().oneshot(submit_request("lobby", "a")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({ "seq_num": 1 }));

        let resp = app.oneshot(submit_request("lobby", "b")).await.unwrap();
        assert_eq!(body_json(resp).await["seq_num"], 2);
    }

    #[tokio::test]
    async fn range_query_and_eviction() {
        let service = service(3);
        let app = router(service.clone());
        for n in 0..6 {
            let resp = app
                .clone()
                .oneshot(submit_request("s", &format!("e{n}")))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let ok = app
            .clone()
            .oneshot(
                Request::get("/sessions/s/ops?from=4&to=6")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let ops = body_json(ok).await;
        assert_eq!(ops.as_array().unwrap().len(), 3);
        assert_eq!(ops[0]["seq_num"], 4);

        let gone = app
            .oneshot(
                Request::get("/sessions/s/ops?from=1&to=6")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(gone.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn malformed_submission_is_rejected_before_sequencing() {
        let service = service(10);
        let app = router(service.clone());
        let resp = app
            .oneshot(
                Request::post("/sessions/s/ops")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"client_id":"x","type":"warp","data":{}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
        assert_eq!(service.head("s"), 0);
    }

    #[test]
    fn error_status_follows_category() {
        let status = |err: SyncError| ApiError(err).status();
        assert_eq!(status(SyncError::InvalidRange { from: 0, to: 3 }), StatusCode::BAD_REQUEST);
        assert_eq!(status(SyncError::SessionHalted("s".into())), StatusCode::CONFLICT);
        assert_eq!(
            status(SyncError::InvariantViolation { expected: 2, found: 4 }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(status(SyncError::ShuttingDown), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status(SyncError::Hub(HubError::Backpressure)),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status(SyncError::transport("reset")), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_unavailable() {
        let service = service(10);
        let app = router(service.clone());
        service.shutdown().await;
        let resp = app.oneshot(submit_request("s", "a")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_json(resp).await["error"]
            .as_str()
            .unwrap()
            .contains("shutting down"));
    }

    #[tokio::test]
    async fn snapshot_and_stats() {
        let service = service(10);
        let app = router(service.clone());
        app.clone().oneshot(submit_request("s", "a")).await.unwrap();

        let snap = app
            .clone()
            .oneshot(Request::get("/sessions/s/snapshot").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let snap = body_json(snap).await;
        assert_eq!(snap["current_sequence"], 1);
        assert_eq!(snap["operations"][0]["operation"]["type"], "entity_delete");

        let stats = app
            .oneshot(Request::get("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(stats.status(), StatusCode::OK);
        assert_eq!(body_json(stats).await["connections"], 0);
    }
}

mod common;

use std::time::Duration;

use anyhow::{anyhow, Result};
use common::{connect, next_message, spawn_server};
use futures::StreamExt;
use serde_json::json;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use worldsync::config::SyncConfig;
use worldsync::server::{SnapshotResponse, SubmitResponse};
use worldsync::{OperationKind, SequencedOperation, ServerMessage, SyncService};

const CONFIG: &str = r#"
[server]
bind = "127.0.0.1"
port = 0

[hub]
send_queue_capacity = 64
ping_interval_secs = 5
pong_timeout_secs = 15

[sequencer]
max_retained_ops = 5
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn end_to_end_workflow() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("worldsync.toml");
    tokio::fs::write(&path, CONFIG).await?;
    let config = SyncConfig::load(&path)?;

    let service = SyncService::start(&config);
    let (addr, server) = spawn_server(service.clone()).await;
    let http = reqwest::Client::new();
    let base = format!("http://{addr}");

    let (mut ws, head) = connect(addr, "studio", "viewer").await;
    assert_eq!(head, 0);

    for n in 0..8 {
        let body = json!({
            "client_id": "producer",
            "type": "avatar_move",
            "data": { "avatar_id": "av-1", "position": { "x": n as f64, "y": 0.0, "z": 0.0 } }
        });
        let resp: SubmitResponse = http
            .post(format!("{base}/sessions/studio/ops"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(resp.seq_num, n + 1);
    }

    let mut live = Vec::new();
    while live.len() < 8 {
        match next_message(&mut ws).await {
            ServerMessage::Operation { seq_num, operation } => {
                assert!(matches!(operation.kind, OperationKind::AvatarMove(_)));
                live.push(seq_num);
            }
            other => return Err(anyhow!("unexpected message {other:?}")),
        }
    }
    live.sort_unstable();
    assert_eq!(live, (1..=8).collect::<Vec<u64>>());

    // Only the newest five are retained.
    let retained: Vec<SequencedOperation> = http
        .get(format!("{base}/sessions/studio/ops?from=4&to=8"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    assert_eq!(retained.first().map(|o| o.seq_num), Some(4));

    let evicted = http
        .get(format!("{base}/sessions/studio/ops?from=1&to=8"))
        .send()
        .await?;
    assert_eq!(evicted.status(), reqwest::StatusCode::GONE);

    let snapshot: SnapshotResponse = http
        .get(format!("{base}/sessions/studio/snapshot"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(snapshot.current_sequence, 8);
    assert_eq!(snapshot.operations.len(), 5);

    // Shutdown closes the socket and stops the server.
    service.shutdown().await;
    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "socket not closed on shutdown");

    timeout(Duration::from_secs(5), server).await???;

    let refused = http
        .post(format!("{base}/sessions/studio/ops"))
        .json(&json!({
            "client_id": "late",
            "type": "entity_delete",
            "data": { "entity_id": "x" }
        }))
        .send()
        .await;
    assert!(refused.is_err(), "server still accepting after shutdown");

    Ok(())
}

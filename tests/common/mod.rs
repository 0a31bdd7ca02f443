#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use worldsync::ops::{EntityDelete, NewOperation, OperationKind};
use worldsync::{ClientMessage, HubConfig, RetentionPolicy, ServerMessage, SyncService};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn service(max_ops: usize) -> SyncService {
    SyncService::with_parts(
        RetentionPolicy {
            max_ops,
            ..Default::default()
        },
        HubConfig::default(),
    )
}

/// Serve `service` on an ephemeral port.
pub async fn spawn_server(service: SyncService) -> (SocketAddr, JoinHandle<anyhow::Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let task = tokio::spawn(worldsync::server::run(listener, service));
    (addr, task)
}

pub fn op(client: &str, entity: &str) -> NewOperation {
    NewOperation::new(
        client,
        OperationKind::EntityDelete(EntityDelete {
            entity_id: entity.to_string(),
        }),
    )
}

/// Connect and wait for the handshake, which is sent once the hub has
/// registered the connection.
pub async fn connect(addr: SocketAddr, session: &str, client: &str) -> (Ws, u64) {
    let url = format!("ws://{addr}/ws?session_id={session}&client_id={client}");
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.expect("ws connect");
    match next_message(&mut ws).await {
        ServerMessage::Handshake {
            session_id,
            current_sequence,
            ..
        } => {
            assert_eq!(session_id, session);
            (ws, current_sequence)
        }
        other => panic!("expected handshake, got {other:?}"),
    }
}

pub async fn next_message(ws: &mut Ws) -> ServerMessage {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for server message")
            .expect("stream ended")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("server message");
        }
    }
}

pub async fn send(ws: &mut Ws, msg: &ClientMessage) {
    ws.send(Message::text(msg.to_json().unwrap())).await.unwrap();
}

//! Broadcast hub
//!
//! One actor owns connection membership. Register, unregister, broadcast
//! and heartbeat all run through its control loop, so membership changes are
//! linearizable with respect to broadcasts. Fan-out is a non-blocking
//! `try_send` per connection; a full queue disconnects that connection and
//! never delays the others.

pub mod connection;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub use connection::{Connection, ConnectionId, ConnectionState, Frame, Outbox};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("hub is shutting down; registrations are closed")]
    ShuttingDown,

    #[error("hub control loop has stopped")]
    Closed,

    #[error("connection send queue is full")]
    Backpressure,

    #[error("connection is closed")]
    ConnectionClosed,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub send_queue_capacity: usize,
    pub control_queue_capacity: usize,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
            control_queue_capacity: 1024,
            ping_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(45),
        }
    }
}

/// Why a connection left the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Disconnected,
    Backpressure,
    PongTimeout,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub sessions: usize,
    pub connections: usize,
    pub per_session: BTreeMap<String, usize>,
    pub broadcasts: u64,
    pub frames_enqueued: u64,
    pub dropped_backpressure: u64,
    pub dropped_pong_timeout: u64,
    pub accepting: bool,
}

enum Command {
    Register {
        conn: Connection,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Unregister {
        id: ConnectionId,
        reason: DropReason,
    },
    Broadcast {
        session_id: String,
        frame: Arc<str>,
    },
    Pong {
        id: ConnectionId,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct Member {
    conn: Connection,
    last_pong: Instant,
}

struct Hub {
    config: HubConfig,
    sessions: HashMap<String, HashMap<ConnectionId, Member>>,
    index: HashMap<ConnectionId, String>,
    accepting: bool,
    stats: HubStats,
}

/// Handle to the hub actor. Clone freely.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<Command>,
    config: Arc<HubConfig>,
}

impl HubHandle {
    /// Start the hub's control loop on the current runtime.
    pub fn spawn(config: HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.control_queue_capacity.max(1));
        let handle = HubHandle {
            tx,
            config: Arc::new(config.clone()),
        };
        let hub = Hub {
            config,
            sessions: HashMap::new(),
            index: HashMap::new(),
            accepting: true,
            stats: HubStats {
                accepting: true,
                ..Default::default()
            },
        };
        let task = tokio::spawn(hub.run(rx));
        (handle, task)
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// New connection for `session_id`, sized per the hub's queue capacity.
    pub fn open_connection(
        &self,
        session_id: impl Into<String>,
        client_id: impl Into<String>,
    ) -> (Connection, Outbox) {
        Connection::open(session_id, client_id, self.config.send_queue_capacity)
    }

    pub async fn register(&self, conn: Connection) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Register { conn, reply })
            .await
            .map_err(|_| HubError::ShuttingDown)?;
        rx.await.map_err(|_| HubError::ShuttingDown)?
    }

    /// Remove a connection. Unknown or already-removed ids are ignored.
    pub async fn unregister(&self, id: ConnectionId) {
        self.drop_connection(id, DropReason::Disconnected).await;
    }

    pub(crate) async fn drop_connection(&self, id: ConnectionId, reason: DropReason) {
        let _ = self.tx.send(Command::Unregister { id, reason }).await;
    }

    /// Queue `frame` for every active connection in `session_id`.
    pub async fn broadcast(&self, session_id: &str, frame: Arc<str>) -> Result<(), HubError> {
        self.tx
            .send(Command::Broadcast {
                session_id: session_id.to_string(),
                frame,
            })
            .await
            .map_err(|_| HubError::Closed)
    }

    pub async fn pong(&self, id: ConnectionId) {
        let _ = self.tx.send(Command::Pong { id }).await;
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Stats { reply })
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Stop registrations, deliver queued broadcasts, close every connection.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

impl Hub {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut shutdown_reply = None;
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = heartbeat.tick() => self.heartbeat(Instant::now()),
            }
        }

        // Refuse registrations first, then drain whatever was already queued.
        self.accepting = false;
        self.stats.accepting = false;
        rx.close();
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Shutdown { reply } => {
                    let _ = reply.send(());
                }
                cmd => self.handle(cmd),
            }
        }

        let members = self.sessions.drain().flat_map(|(_, m)| m.into_values());
        let mut closed = 0usize;
        for member in members {
            member.conn.begin_closing();
            closed += 1;
        }
        self.index.clear();
        info!(connections = closed, "hub stopped");

        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Register { conn, reply } => {
                let _ = reply.send(self.register(conn));
            }
            Command::Unregister { id, reason } => self.unregister(id, reason),
            Command::Broadcast { session_id, frame } => self.broadcast(&session_id, frame),
            Command::Pong { id } => {
                if let Some(session_id) = self.index.get(&id) {
                    if let Some(member) = self
                        .sessions
                        .get_mut(session_id)
                        .and_then(|members| members.get_mut(&id))
                    {
                        member.last_pong = Instant::now();
                    }
                }
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.snapshot_stats());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn register(&mut self, conn: Connection) -> Result<(), HubError> {
        if !self.accepting {
            conn.close();
            return Err(HubError::ShuttingDown);
        }
        if !conn.state().accepts_frames() {
            return Err(HubError::ConnectionClosed);
        }
        let id = conn.id();
        let session_id = conn.session_id().to_string();
        conn.activate();
        debug!(%id, session = %session_id, client = conn.client_id(), "connection registered");
        self.index.insert(id, session_id.clone());
        self.sessions.entry(session_id).or_default().insert(
            id,
            Member {
                conn,
                last_pong: Instant::now(),
            },
        );
        Ok(())
    }

    fn unregister(&mut self, id: ConnectionId, reason: DropReason) {
        let Some(session_id) = self.index.remove(&id) else {
            return;
        };
        let member = match self.sessions.get_mut(&session_id) {
            Some(members) => {
                let member = members.remove(&id);
                if members.is_empty() {
                    self.sessions.remove(&session_id);
                }
                member
            }
            None => None,
        };
        let Some(member) = member else {
            return;
        };

        member.conn.close();
        match reason {
            DropReason::Disconnected => {
                debug!(%id, session = %session_id, "connection unregistered");
            }
            DropReason::Backpressure => {
                self.stats.dropped_backpressure += 1;
                warn!(
                    %id,
                    session = %session_id,
                    client = member.conn.client_id(),
                    "send queue full; dropping connection"
                );
            }
            DropReason::PongTimeout => {
                self.stats.dropped_pong_timeout += 1;
                warn!(
                    %id,
                    session = %session_id,
                    client = member.conn.client_id(),
                    "no pong within timeout; dropping connection"
                );
            }
        }
    }

    fn broadcast(&mut self, session_id: &str, frame: Arc<str>) {
        self.stats.broadcasts += 1;
        let Some(members) = self.sessions.get(session_id) else {
            return;
        };

        let mut dropped = Vec::new();
        for (id, member) in members {
            if member.conn.state() != ConnectionState::Active {
                continue;
            }
            match member.conn.try_send(Frame::Text(frame.clone())) {
                Ok(()) => self.stats.frames_enqueued += 1,
                Err(HubError::Backpressure) => dropped.push((*id, DropReason::Backpressure)),
                Err(_) => dropped.push((*id, DropReason::Disconnected)),
            }
        }
        for (id, reason) in dropped {
            self.unregister(id, reason);
        }
    }

    fn heartbeat(&mut self, now: Instant) {
        let mut dropped = Vec::new();
        for members in self.sessions.values() {
            for (id, member) in members {
                if now.saturating_duration_since(member.last_pong) > self.config.pong_timeout {
                    dropped.push((*id, DropReason::PongTimeout));
                    continue;
                }
                match member.conn.try_send(Frame::Ping) {
                    Ok(()) => {}
                    Err(HubError::Backpressure) => dropped.push((*id, DropReason::Backpressure)),
                    Err(_) => dropped.push((*id, DropReason::Disconnected)),
                }
            }
        }
        for (id, reason) in dropped {
            self.unregister(id, reason);
        }
    }

    fn snapshot_stats(&self) -> HubStats {
        let per_session: BTreeMap<String, usize> = self
            .sessions
            .iter()
            .map(|(session, members)| (session.clone(), members.len()))
            .collect();
        HubStats {
            sessions: per_session.len(),
            connections: self.index.len(),
            per_session,
            ..self.stats.clone()
        }
    }
}

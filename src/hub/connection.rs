use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use super::HubError;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Registered,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Registered,
            1 => ConnectionState::Active,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Registered => 0,
            ConnectionState::Active => 1,
            ConnectionState::Closing => 2,
            ConnectionState::Closed => 3,
        }
    }

    pub fn accepts_frames(self) -> bool {
        matches!(self, ConnectionState::Registered | ConnectionState::Active)
    }
}

/// Outbound unit on a connection's send queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Pre-serialized JSON message, shared across all recipients of a broadcast.
    Text(Arc<str>),
    Ping,
}

struct Shared {
    state: AtomicU8,
    changed: Notify,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Producer side of a live connection. Cheap to clone; the hub keeps one,
/// the transport's reader keeps another to answer sync requests.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    session_id: Arc<str>,
    client_id: Arc<str>,
    tx: mpsc::Sender<Frame>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Writer side: the single consumer of the send queue.
pub struct Outbox {
    rx: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
}

impl Connection {
    /// Create a connection in the `Registered` state with a bounded queue.
    pub fn open(
        session_id: impl Into<String>,
        client_id: impl Into<String>,
        capacity: usize,
    ) -> (Connection, Outbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let shared = Arc::new(Shared {
            state: AtomicU8::new(ConnectionState::Registered.as_u8()),
            changed: Notify::new(),
        });
        let conn = Connection {
            id: Uuid::new_v4(),
            session_id: Arc::from(session_id.into()),
            client_id: Arc::from(client_id.into()),
            tx,
            shared: shared.clone(),
        };
        (conn, Outbox { rx, shared })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Non-blocking enqueue. A full queue is reported, never waited on.
    pub fn try_send(&self, frame: Frame) -> Result<(), HubError> {
        if !self.state().accepts_frames() {
            return Err(HubError::ConnectionClosed);
        }
        self.tx.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => HubError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => HubError::ConnectionClosed,
        })
    }

    pub(crate) fn activate(&self) {
        let _ = self.shared.state.compare_exchange(
            ConnectionState::Registered.as_u8(),
            ConnectionState::Active.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Stop accepting frames but let the writer flush what is already queued.
    pub(crate) fn begin_closing(&self) {
        if self.state() != ConnectionState::Closed {
            self.shared
                .state
                .store(ConnectionState::Closing.as_u8(), Ordering::Release);
        }
        self.shared.changed.notify_one();
    }

    /// Close immediately; queued frames are discarded by the writer.
    pub(crate) fn close(&self) {
        self.shared
            .state
            .store(ConnectionState::Closed.as_u8(), Ordering::Release);
        self.shared.changed.notify_one();
    }
}

impl Outbox {
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Next frame to write, or `None` once the connection is done.
    ///
    /// On `Closed` the queue is cleared and nothing more is yielded; on
    /// `Closing` only frames already queued are yielded.
    pub async fn next(&mut self) -> Option<Frame> {
        loop {
            match self.shared.state() {
                ConnectionState::Closed => {
                    self.discard();
                    return None;
                }
                ConnectionState::Closing => {
                    let frame = self.rx.try_recv().ok();
                    if frame.is_none() {
                        self.shared
                            .state
                            .store(ConnectionState::Closed.as_u8(), Ordering::Release);
                        self.rx.close();
                    }
                    return frame;
                }
                ConnectionState::Registered | ConnectionState::Active => {}
            }

            tokio::select! {
                biased;
                _ = self.shared.changed.notified() => continue,
                frame = self.rx.recv() => return frame,
            }
        }
    }

    fn discard(&mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

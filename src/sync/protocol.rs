//! Wire messages exchanged over the persistent connection.
//!
//! Every frame is a JSON object with a `type` discriminator.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ops::{Operation, SequencedOperation};

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Handshake {
        connection_id: Uuid,
        session_id: String,
        current_sequence: u64,
    },
    Operation {
        seq_num: u64,
        operation: Operation,
    },
    MissingOperations {
        operations: Vec<SequencedOperation>,
    },
    RangeUnavailable {
        from: u64,
        to: u64,
    },
    FullSync {
        operations: Vec<SequencedOperation>,
    },
    SyncComplete {
        current_sequence: u64,
    },
}

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    RequestMissing { client_id: String, from: u64, to: u64 },
    RequestFullSync { client_id: String },
    /// Reports a broken sequence invariant seen during full sync.
    SyncError { client_id: String, detail: String },
}

impl ServerMessage {
    pub fn operation(op: &SequencedOperation) -> Self {
        ServerMessage::Operation {
            seq_num: op.seq_num,
            operation: op.operation.clone(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl ClientMessage {
    pub fn client_id(&self) -> &str {
        match self {
            ClientMessage::RequestMissing { client_id, .. }
            | ClientMessage::RequestFullSync { client_id }
            | ClientMessage::SyncError { client_id, .. } => client_id,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

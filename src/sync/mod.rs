//! Client side of the sync protocol: wire messages, the reconciliation state
//! machine and a WebSocket client that drives it with reconnects.

pub mod protocol;
pub mod reconcile;
pub mod remote;

pub use protocol::{ClientMessage, ServerMessage};
pub use reconcile::{ClientSync, OperationSink, SyncState};
pub use remote::{session_url, ClientHandle, SyncClient, SyncStatus};

//! # worldsync - real-time operation sync for shared 3D sessions
//!
//! Every edit to a session (entity changes, avatar movement, materials,
//! animation, physics) is stamped with a gap-free, per-session sequence
//! number, kept in a bounded in-memory log and fanned out to every
//! subscriber over WebSocket. Clients apply operations strictly in order,
//! ask for missing ranges when they notice a gap and fall back to a full
//! snapshot when the range has been evicted.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use worldsync::{config::SyncConfig, server, SyncService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SyncConfig::default();
//!     let service = SyncService::start(&config);
//!     server::start(config.server.addr()?, service).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod hub;
pub mod ops;
pub mod sequencer;
pub mod server;
pub mod service;
pub mod sync;
pub mod telemetry;

// Re-export main types for library consumers
pub use error::{RetryPolicy, SyncError};
pub use hub::{HubConfig, HubHandle, HubStats};
pub use ops::{NewOperation, Operation, OperationKind, SequencedOperation};
pub use sequencer::{RetentionPolicy, Sequencer, Snapshot, SweepReport};
pub use service::SyncService;
pub use sync::{ClientMessage, ClientSync, OperationSink, ServerMessage, SyncClient, SyncState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod api;

use anyhow::Result;
use std::net::SocketAddr;

use crate::service::SyncService;

pub use api::{router, run, serve, AppState, SnapshotResponse, SubmitResponse};

pub async fn start(addr: SocketAddr, service: SyncService) -> Result<()> {
    api::start(addr, service).await
}

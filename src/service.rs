//! Sync service
//!
//! Owns the sequencer and the hub. Producers and the transport layer get a
//! cloned handle; nothing here is process-global.
//!
//! Submissions to one session pass through that session's ordering gate, so
//! broadcasts reach the hub in seq order. A background task sweeps the
//! sequencer every `sweep_interval`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::hub::{HubConfig, HubHandle, HubStats};
use crate::ops::{NewOperation, SequencedOperation};
use crate::sequencer::{RetentionPolicy, Sequencer, Snapshot, SweepReport};
use crate::sync::ServerMessage;

struct Inner {
    sequencer: Sequencer,
    hub: HubHandle,
    hub_task: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    /// Held from seq assignment until the broadcast is queued.
    gates: DashMap<String, Arc<AsyncMutex<()>>>,
    halted: DashSet<String>,
    accepting: AtomicBool,
    stopped: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct SyncService {
    inner: Arc<Inner>,
}

impl SyncService {
    /// Build the service and start its hub. Must run inside a tokio runtime.
    pub fn start(config: &SyncConfig) -> Self {
        Self::with_parts(config.retention(), config.hub_config())
    }

    pub fn with_parts(retention: RetentionPolicy, hub_config: HubConfig) -> Self {
        let (hub, hub_task) = HubHandle::spawn(hub_config);
        let (stopped, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            sequencer: Sequencer::new(retention),
            hub,
            hub_task: Mutex::new(Some(hub_task)),
            sweeper: Mutex::new(None),
            gates: DashMap::new(),
            halted: DashSet::new(),
            accepting: AtomicBool::new(true),
            stopped,
        });
        let sweeper = spawn_sweeper(&inner);
        *inner.sweeper.lock() = Some(sweeper);
        Self { inner }
    }

    fn gate(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        if let Some(gate) = self.inner.gates.get(session_id) {
            return gate.clone();
        }
        self.inner
            .gates
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.inner.sequencer
    }

    pub fn hub(&self) -> &HubHandle {
        &self.inner.hub
    }

    /// Sequence one operation and broadcast it to the session.
    ///
    /// Returns the assigned `seq_num` once the operation is in the log; the
    /// broadcast is queued to the hub before returning.
    pub async fn submit(&self, session_id: &str, op: NewOperation) -> Result<u64, SyncError> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(SyncError::ShuttingDown);
        }
        if self.inner.halted.contains(session_id) {
            return Err(SyncError::SessionHalted(session_id.to_string()));
        }

        let gate = self.gate(session_id);
        let _ordered = gate.lock().await;
        let sequenced = self.inner.sequencer.submit(session_id, op);
        let seq_num = sequenced.seq_num;
        self.broadcast(&sequenced).await;
        Ok(seq_num)
    }

    async fn broadcast(&self, op: &SequencedOperation) {
        let frame = match ServerMessage::operation(op).to_json() {
            Ok(json) => Arc::<str>::from(json),
            Err(e) => {
                error!(seq = op.seq_num, "failed to encode operation: {e}");
                return;
            }
        };
        if let Err(e) = self.inner.hub.broadcast(op.session_id(), frame).await {
            warn!(seq = op.seq_num, session = op.session_id(), "broadcast not queued: {e}");
        }
    }

    pub fn range(
        &self,
        session_id: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<Arc<SequencedOperation>>, SyncError> {
        self.inner.sequencer.range(session_id, from, to)
    }

    pub fn snapshot(&self, session_id: &str) -> Snapshot {
        self.inner.sequencer.snapshot(session_id)
    }

    pub fn head(&self, session_id: &str) -> u64 {
        self.inner.sequencer.head(session_id)
    }

    pub async fn stats(&self) -> Result<HubStats, SyncError> {
        Ok(self.inner.hub.stats().await?)
    }

    pub fn is_halted(&self, session_id: &str) -> bool {
        self.inner.halted.contains(session_id)
    }

    /// A client saw a broken sequence. Check the log itself; halt the
    /// session if it really is broken.
    pub fn report_violation(&self, session_id: &str, client_id: &str, detail: &str) -> bool {
        error!(
            session = session_id,
            client = client_id,
            "client reported sequence invariant violation: {detail}"
        );
        match self.inner.sequencer.verify(session_id) {
            Ok(()) => false,
            Err(e) => {
                error!(session = session_id, "operation log is corrupt, halting session: {e}");
                self.inner.halted.insert(session_id.to_string());
                true
            }
        }
    }

    /// Lift a halt after investigation.
    pub fn resume(&self, session_id: &str) -> bool {
        let resumed = self.inner.halted.remove(session_id).is_some();
        if resumed {
            info!(session = session_id, "session resumed");
        }
        resumed
    }

    /// Run one retention sweep now. Sessions with connected members or a
    /// halt in place are never dropped.
    pub async fn sweep(&self) -> SweepReport {
        let watched: Option<HashSet<String>> = match self.inner.hub.stats().await {
            Ok(stats) => Some(stats.per_session.into_keys().collect()),
            Err(e) => {
                debug!("hub unavailable during sweep, keeping all sessions: {e}");
                None
            }
        };
        let inner = &self.inner;
        let report = inner.sequencer.sweep(Instant::now(), |session| match &watched {
            Some(watched) => !watched.contains(session) && !inner.halted.contains(session),
            None => false,
        });
        for session in &report.removed {
            inner
                .gates
                .remove_if(session, |_, gate| Arc::strong_count(gate) == 1);
        }
        if report.evicted > 0 || !report.removed.is_empty() {
            debug!(
                evicted = report.evicted,
                removed = report.removed.len(),
                "retention sweep"
            );
        }
        report
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Refuse new submissions, stop hub registrations, flush in-flight
    /// broadcasts and close every connection. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.accepting.swap(false, Ordering::AcqRel) {
            info!("sync service shutting down");
        }
        self.inner.hub.shutdown().await;
        let task = self.inner.hub_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.stopped.send_replace(true);
        let sweeper = self.inner.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
    }

    /// Resolves once `shutdown` has completed.
    pub async fn stopped(&self) {
        let mut rx = self.inner.stopped.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Periodic sweep. Holds only a weak handle so a dropped service is not
/// kept alive; exits once the service stops.
fn spawn_sweeper(inner: &Arc<Inner>) -> JoinHandle<()> {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    let period = inner
        .sequencer
        .retention()
        .sweep_interval
        .max(Duration::from_millis(1));
    let mut stopped = inner.stopped.subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stopped.wait_for(|stopped| *stopped) => break,
            }
            match weak.upgrade() {
                Some(inner) => {
                    SyncService { inner }.sweep().await;
                }
                None => break,
            }
        }
    })
}

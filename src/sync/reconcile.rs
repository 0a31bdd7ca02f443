//! Client-side reconciliation
//!
//! Turns a best-effort stream (reordered, duplicated, gappy) into exactly-once,
//! in-order application. `ClientSync` does no I/O: it consumes server
//! messages and returns the client messages to send back.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::protocol::{ClientMessage, ServerMessage};
use crate::error::SyncError;
use crate::ops::SequencedOperation;

/// Receives operations in ascending `seq_num` order, each exactly once.
pub trait OperationSink {
    fn apply(&mut self, op: &SequencedOperation);

    /// Local state is being rebuilt from a full sync.
    fn reset(&mut self) {}
}

impl OperationSink for Vec<SequencedOperation> {
    fn apply(&mut self, op: &SequencedOperation) {
        self.push(op.clone());
    }

    fn reset(&mut self) {
        self.clear();
    }
}

impl<S: OperationSink> OperationSink for Arc<Mutex<S>> {
    fn apply(&mut self, op: &SequencedOperation) {
        self.lock().apply(op);
    }

    fn reset(&mut self) {
        self.lock().reset();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    AwaitingFullSync,
    Synchronized,
    GapBuffering,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GapRequest {
    to: u64,
    issued_at: Instant,
}

pub struct ClientSync {
    client_id: String,
    last_seen_seq: u64,
    pending: BTreeMap<u64, SequencedOperation>,
    state: SyncState,
    gap: Option<GapRequest>,
    /// Highest live seq dropped while waiting for the baseline.
    missed_up_to: u64,
    /// Full sync carried nothing; the baseline is the head in `sync_complete`.
    empty_baseline: bool,
}

impl ClientSync {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            last_seen_seq: 0,
            pending: BTreeMap::new(),
            state: SyncState::Disconnected,
            gap: None,
            missed_up_to: 0,
            empty_baseline: false,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn last_seen_seq(&self) -> u64 {
        self.last_seen_seq
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Connection opened: always renegotiate from scratch.
    pub fn connect(&mut self) -> ClientMessage {
        self.pending.clear();
        self.gap = None;
        self.missed_up_to = 0;
        self.empty_baseline = false;
        self.state = SyncState::AwaitingFullSync;
        ClientMessage::RequestFullSync {
            client_id: self.client_id.clone(),
        }
    }

    /// Transport lost. Only `connect` leaves this state.
    pub fn disconnect(&mut self) {
        self.pending.clear();
        self.gap = None;
        self.missed_up_to = 0;
        self.empty_baseline = false;
        self.state = SyncState::Disconnected;
    }

    /// Feed one server message; returns requests to send back.
    pub fn handle<S: OperationSink>(
        &mut self,
        msg: ServerMessage,
        sink: &mut S,
    ) -> Result<Vec<ClientMessage>, SyncError> {
        let mut out = Vec::new();
        match msg {
            ServerMessage::Handshake { .. } => {}
            ServerMessage::Operation { seq_num, operation } => {
                let op = SequencedOperation { seq_num, operation };
                out.extend(self.receive(op, sink));
            }
            ServerMessage::MissingOperations { operations } => {
                out.extend(self.receive_missing(operations, sink));
            }
            ServerMessage::RangeUnavailable { from, to } => {
                warn!(from, to, "range no longer retained; falling back to full sync");
                out.push(self.range_unavailable());
            }
            ServerMessage::FullSync { operations } => self.full_sync(operations, sink)?,
            ServerMessage::SyncComplete { current_sequence } => {
                out.extend(self.sync_complete(current_sequence));
            }
        }
        Ok(out)
    }

    /// Live operation: apply, buffer, or discard.
    pub fn receive<S: OperationSink>(
        &mut self,
        op: SequencedOperation,
        sink: &mut S,
    ) -> Option<ClientMessage> {
        match self.state {
            SyncState::Disconnected => return None,
            SyncState::AwaitingFullSync => {
                debug!(seq = op.seq_num, "no baseline yet; dropping live operation");
                self.missed_up_to = self.missed_up_to.max(op.seq_num);
                return None;
            }
            SyncState::Synchronized | SyncState::GapBuffering => {}
        }

        let seq = op.seq_num;
        let next = self.last_seen_seq + 1;
        if seq < next {
            debug!(seq, last_seen = self.last_seen_seq, "discarding stale operation");
            return None;
        }
        if seq == next {
            self.apply(op, sink);
            self.drain(sink);
            self.settle();
            return None;
        }

        self.pending.entry(seq).or_insert(op);
        self.state = SyncState::GapBuffering;
        self.request_up_to(seq - 1, Instant::now())
    }

    /// Answer to `request_missing`; may itself be partial.
    pub fn receive_missing<S: OperationSink>(
        &mut self,
        mut operations: Vec<SequencedOperation>,
        sink: &mut S,
    ) -> Option<ClientMessage> {
        if matches!(
            self.state,
            SyncState::AwaitingFullSync | SyncState::Disconnected
        ) {
            return None;
        }

        operations.sort_by_key(|op| op.seq_num);
        for op in operations {
            let seq = op.seq_num;
            if seq <= self.last_seen_seq {
                continue;
            }
            if seq == self.last_seen_seq + 1 {
                self.apply(op, sink);
                self.drain(sink);
            } else {
                self.pending.entry(seq).or_insert(op);
            }
        }

        // The outstanding request stays open until its range has been applied;
        // anything it does not cover is asked for now, the rest on timeout.
        self.settle();
        let first_pending = *self.pending.keys().next()?;
        self.request_up_to(first_pending - 1, Instant::now())
    }

    /// Gap-fill impossible: abandon incremental reconciliation.
    pub fn range_unavailable(&mut self) -> ClientMessage {
        self.connect()
    }

    /// Replace local reconciliation state with the server's retained log.
    ///
    /// The payload must be strictly contiguous. Its first entry sets the
    /// baseline, so a retention-truncated log is accepted. Nothing is applied
    /// when validation fails.
    ///
    /// An empty payload leaves the client waiting for `sync_complete`, whose
    /// head becomes the baseline.
    pub fn full_sync<S: OperationSink>(
        &mut self,
        operations: Vec<SequencedOperation>,
        sink: &mut S,
    ) -> Result<(), SyncError> {
        self.pending.clear();
        self.gap = None;
        self.last_seen_seq = 0;
        self.empty_baseline = false;

        if let Some(first) = operations.first() {
            let mut expected = first.seq_num;
            for op in &operations {
                if op.seq_num != expected {
                    self.state = SyncState::AwaitingFullSync;
                    return Err(SyncError::InvariantViolation {
                        expected,
                        found: op.seq_num,
                    });
                }
                expected += 1;
            }
            self.last_seen_seq = first.seq_num - 1;
        }

        sink.reset();
        if operations.is_empty() {
            self.empty_baseline = true;
            self.state = SyncState::AwaitingFullSync;
            return Ok(());
        }
        for op in operations {
            self.apply(op, sink);
        }
        self.state = SyncState::Synchronized;
        Ok(())
    }

    /// End of a full sync. Requests whatever lies between the replayed log
    /// and the newer of the server head and any live op dropped meanwhile.
    pub fn sync_complete(&mut self, current_sequence: u64) -> Option<ClientMessage> {
        match self.state {
            SyncState::Disconnected => return None,
            SyncState::AwaitingFullSync if !self.empty_baseline => return None,
            SyncState::AwaitingFullSync => {
                // Nothing retained to replay; start from the head.
                self.empty_baseline = false;
                self.last_seen_seq = current_sequence;
                self.state = SyncState::Synchronized;
            }
            SyncState::Synchronized | SyncState::GapBuffering => {}
        }
        let missed = std::mem::take(&mut self.missed_up_to);
        let target = current_sequence.max(missed);
        if target <= self.last_seen_seq {
            return None;
        }
        self.state = SyncState::GapBuffering;
        self.request_up_to(target, Instant::now())
    }

    /// Re-issue a gap request that has gone unanswered for `timeout`.
    pub fn retry_stale_gap(&mut self, now: Instant, timeout: Duration) -> Option<ClientMessage> {
        let gap = self.gap?;
        if now.saturating_duration_since(gap.issued_at) < timeout {
            return None;
        }
        self.gap = None;
        self.request_up_to(gap.to, now)
    }

    fn apply<S: OperationSink>(&mut self, op: SequencedOperation, sink: &mut S) {
        sink.apply(&op);
        self.last_seen_seq = op.seq_num;
    }

    fn drain<S: OperationSink>(&mut self, sink: &mut S) {
        while let Some(entry) = self.pending.first_entry() {
            let seq = *entry.key();
            if seq <= self.last_seen_seq {
                entry.remove();
                continue;
            }
            if seq != self.last_seen_seq + 1 {
                break;
            }
            let op = entry.remove();
            self.apply(op, sink);
        }
    }

    fn settle(&mut self) {
        if self.pending.is_empty() {
            self.state = SyncState::Synchronized;
            self.gap = None;
        } else {
            self.state = SyncState::GapBuffering;
        }
        if matches!(self.gap, Some(gap) if gap.to <= self.last_seen_seq) {
            self.gap = None;
        }
    }

    /// Request `last_seen+1 ..= upto`, minus what an outstanding request
    /// covers and minus buffered seqs at either end.
    fn request_up_to(&mut self, upto: u64, now: Instant) -> Option<ClientMessage> {
        let mut from = match self.gap {
            Some(gap) if gap.to >= upto => return None,
            Some(gap) => gap.to + 1,
            None => self.last_seen_seq + 1,
        };
        let mut to = upto;
        while from <= to && self.pending.contains_key(&from) {
            from += 1;
        }
        while from <= to && self.pending.contains_key(&to) {
            to -= 1;
        }
        if from > to {
            return None;
        }
        self.gap = Some(GapRequest {
            to: upto,
            issued_at: now,
        });
        Some(ClientMessage::RequestMissing {
            client_id: self.client_id.clone(),
            from,
            to,
        })
    }
}

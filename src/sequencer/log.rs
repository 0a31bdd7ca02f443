use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::SyncError;
use crate::ops::{Operation, SequencedOperation};

/// How long operations stay queryable.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Upper bound on retained operations per session.
    pub max_ops: usize,
    /// Operations older than this (since append) become evictable.
    pub max_age: Option<Duration>,
    /// When set, snapshots carry only the newest N operations.
    pub snapshot_limit: Option<usize>,
    /// How often the background sweep evicts expired operations.
    pub sweep_interval: Duration,
    /// An emptied session untouched this long is dropped by the sweep.
    pub idle_session_ttl: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_ops: 10_000,
            max_age: None,
            snapshot_limit: None,
            sweep_interval: Duration::from_secs(30),
            idle_session_ttl: Duration::from_secs(300),
        }
    }
}

struct Entry {
    op: Arc<SequencedOperation>,
    appended_at: Instant,
}

/// Retained, contiguous log of one session's sequence space.
///
/// `entries` always holds `oldest..=head` with no holes; eviction only ever
/// pops from the front.
pub struct SessionLog {
    session_id: String,
    head: u64,
    entries: VecDeque<Entry>,
    last_touched: Instant,
    retired: bool,
}

/// Head sequence plus the operations needed to bootstrap a client.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub current_seq: u64,
    pub operations: Vec<Arc<SequencedOperation>>,
}

impl SessionLog {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            head: 0,
            entries: VecDeque::new(),
            last_touched: Instant::now(),
            retired: false,
        }
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    /// Oldest retained sequence number; `head + 1` when nothing is retained.
    pub fn oldest(&self) -> u64 {
        self.entries
            .front()
            .map(|e| e.op.seq_num)
            .unwrap_or(self.head + 1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a read or write; keeps the session from being swept.
    pub fn touch(&mut self, now: Instant) {
        self.last_touched = now;
    }

    /// Empty and untouched for at least `ttl`.
    pub fn is_idle(&self, now: Instant, ttl: Duration) -> bool {
        self.entries.is_empty() && now.saturating_duration_since(self.last_touched) >= ttl
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// Mark the log as removed from its sequencer. Holders of a stale handle
    /// see an empty session at head 0 and must look the session up again.
    pub fn retire(&mut self) {
        self.retired = true;
        self.head = 0;
        self.entries.clear();
    }

    /// Assign `head + 1` and append. Caller holds the session lock.
    pub fn append(
        &mut self,
        operation: Operation,
        now: Instant,
        retention: &RetentionPolicy,
    ) -> Arc<SequencedOperation> {
        self.head += 1;
        let op = Arc::new(SequencedOperation {
            seq_num: self.head,
            operation,
        });
        self.entries.push_back(Entry {
            op: op.clone(),
            appended_at: now,
        });
        self.last_touched = now;
        self.evict(now, retention);
        op
    }

    /// Drop entries beyond the count bound or older than the age bound.
    /// Returns how many were dropped.
    pub fn evict(&mut self, now: Instant, retention: &RetentionPolicy) -> usize {
        let before = self.entries.len();
        while self.entries.len() > retention.max_ops {
            self.entries.pop_front();
        }
        if let Some(max_age) = retention.max_age {
            while let Some(front) = self.entries.front() {
                if now.saturating_duration_since(front.appended_at) <= max_age {
                    break;
                }
                self.entries.pop_front();
            }
        }
        before - self.entries.len()
    }

    pub fn range(&self, from: u64, to: u64) -> Result<Vec<Arc<SequencedOperation>>, SyncError> {
        if from == 0 || from > to {
            return Err(SyncError::InvalidRange { from, to });
        }
        let oldest = self.oldest();
        if from < oldest || to > self.head {
            return Err(SyncError::RangeUnavailable {
                session_id: self.session_id.clone(),
                from,
                to,
                oldest,
                head: self.head,
            });
        }
        let start = (from - oldest) as usize;
        let end = (to - oldest) as usize;
        Ok(self
            .entries
            .range(start..=end)
            .map(|e| e.op.clone())
            .collect())
    }

    pub fn snapshot(&self, limit: Option<usize>) -> Snapshot {
        let skip = match limit {
            Some(limit) => self.entries.len().saturating_sub(limit),
            None => 0,
        };
        Snapshot {
            current_seq: self.head,
            operations: self.entries.iter().skip(skip).map(|e| e.op.clone()).collect(),
        }
    }

    /// Re-check that retained entries are contiguous and end at `head`.
    pub fn verify(&self) -> Result<(), SyncError> {
        let mut expected = self.oldest();
        for entry in &self.entries {
            if entry.op.seq_num != expected {
                return Err(SyncError::InvariantViolation {
                    expected,
                    found: entry.op.seq_num,
                });
            }
            expected += 1;
        }
        if expected != self.head + 1 {
            return Err(SyncError::InvariantViolation {
                expected: self.head,
                found: expected - 1,
            });
        }
        Ok(())
    }
}

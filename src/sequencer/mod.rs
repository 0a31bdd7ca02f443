//! Operation sequencer
//!
//! Assigns per-session sequence numbers and keeps a bounded, queryable log.
//! Each session has its own lock; assignment and append happen under it, so
//! no two operations share a number and none is observably appended out of
//! order. A periodic [`Sequencer::sweep`] applies age retention to idle
//! sessions and forgets sessions that have emptied out.

pub mod log;

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::SyncError;
use crate::ops::{NewOperation, Operation, SequencedOperation};

pub use log::{RetentionPolicy, SessionLog, Snapshot};

/// Outcome of one [`Sequencer::sweep`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Operations evicted across all sessions.
    pub evicted: usize,
    /// Sessions dropped from the sequencer.
    pub removed: Vec<String>,
}

pub struct Sequencer {
    sessions: DashMap<String, Arc<Mutex<SessionLog>>>,
    retention: RetentionPolicy,
}

impl Sequencer {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            sessions: DashMap::new(),
            retention,
        }
    }

    pub fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    fn log(&self, session_id: &str) -> Arc<Mutex<SessionLog>> {
        if let Some(log) = self.sessions.get(session_id) {
            return log.clone();
        }
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionLog::new(session_id))))
            .clone()
    }

    fn existing(&self, session_id: &str) -> Option<Arc<Mutex<SessionLog>>> {
        self.sessions.get(session_id).map(|log| log.clone())
    }

    /// Sequence `op` into `session_id`'s space and return it with its number.
    pub fn submit(&self, session_id: &str, op: NewOperation) -> Arc<SequencedOperation> {
        let operation = Operation::new(session_id, op);
        loop {
            let log = self.log(session_id);
            let mut log = log.lock();
            // swept between lookup and lock
            if log.is_retired() {
                continue;
            }
            return log.append(operation, Instant::now(), &self.retention);
        }
    }

    /// Operations `from..=to`, ascending. Fails closed if any part is not retained.
    pub fn range(
        &self,
        session_id: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<Arc<SequencedOperation>>, SyncError> {
        match self.existing(session_id) {
            Some(log) => {
                let now = Instant::now();
                let mut log = log.lock();
                log.touch(now);
                log.evict(now, &self.retention);
                log.range(from, to)
            }
            None if from == 0 || from > to => Err(SyncError::InvalidRange { from, to }),
            None => Err(SyncError::RangeUnavailable {
                session_id: session_id.to_string(),
                from,
                to,
                oldest: 1,
                head: 0,
            }),
        }
    }

    pub fn snapshot(&self, session_id: &str) -> Snapshot {
        match self.existing(session_id) {
            Some(log) => {
                let now = Instant::now();
                let mut log = log.lock();
                log.touch(now);
                log.evict(now, &self.retention);
                log.snapshot(self.retention.snapshot_limit)
            }
            None => Snapshot {
                current_seq: 0,
                operations: Vec::new(),
            },
        }
    }

    pub fn head(&self, session_id: &str) -> u64 {
        match self.existing(session_id) {
            Some(log) => {
                let log = log.lock();
                log.head()
            }
            None => 0,
        }
    }

    pub fn verify(&self, session_id: &str) -> Result<(), SyncError> {
        match self.existing(session_id) {
            Some(log) => {
                let log = log.lock();
                log.verify()
            }
            None => Ok(()),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Operations currently held across every session.
    pub fn retained(&self) -> usize {
        self.logs().iter().map(|log| log.lock().len()).sum()
    }

    fn logs(&self) -> Vec<Arc<Mutex<SessionLog>>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Apply retention to every session as of `now`, then drop sessions that
    /// are empty, idle past `idle_session_ttl` and accepted by `removable`.
    ///
    /// A dropped session restarts at seq 1 on its next submit.
    pub fn sweep(&self, now: Instant, removable: impl Fn(&str) -> bool) -> SweepReport {
        let mut report = SweepReport::default();
        for log in self.logs() {
            report.evicted += log.lock().evict(now, &self.retention);
        }

        let ttl = self.retention.idle_session_ttl;
        self.sessions.retain(|session_id, log| {
            let mut log = log.lock();
            if log.is_idle(now, ttl) && removable(session_id) {
                log.retire();
                report.removed.push(session_id.clone());
                false
            } else {
                true
            }
        });
        report
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{EntityDelete, OperationKind};
    use std::collections::HashSet;
    use std::time::Duration;

    fn delete(n: usize) -> NewOperation {
        NewOperation::new(
            format!("producer-{n}"),
            OperationKind::EntityDelete(EntityDelete {
                entity_id: format!("e{n}"),
            }),
        )
    }

    #[test]
    fn concurrent_submits_are_exactly_one_to_n() {
        let sequencer = Arc::new(Sequencer::default());
        let threads = 8;
        let per_thread = 250;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let sequencer = sequencer.clone();
                std::thread::spawn(move || {
                    (0..per_thread)
                        .map(|i| sequencer.submit("world", delete(t * per_thread + i)).seq_num)
                        .collect::<Vec<u64>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for seq in handle.join().unwrap() {
                assert!(seen.insert(seq), "duplicate seq {seq}");
            }
        }
        let n = (threads * per_thread) as u64;
        assert_eq!(seen.len() as u64, n);
        assert!((1..=n).all(|s| seen.contains(&s)));
        assert_eq!(sequencer.head("world"), n);
        sequencer.verify("world").unwrap();
    }

    #[test]
    fn sessions_have_independent_spaces() {
        let sequencer = Sequencer::default();
        assert_eq!(sequencer.submit("a", delete(1)).seq_num, 1);
        assert_eq!(sequencer.submit("a", delete(2)).seq_num, 2);
        assert_eq!(sequencer.submit("b", delete(3)).seq_num, 1);
        assert_eq!(sequencer.head("a"), 2);
        assert_eq!(sequencer.head("b"), 1);
        assert_eq!(sequencer.head("c"), 0);
    }

    #[test]
    fn range_returns_ascending_slice() {
        let sequencer = Sequencer::default();
        for n in 0..10 {
            sequencer.submit("s", delete(n));
        }
        let seqs: Vec<u64> = sequencer
            .range("s", 4, 7)
            .unwrap()
            .iter()
            .map(|o| o.seq_num)
            .collect();
        assert_eq!(seqs, vec![4, 5, 6, 7]);
    }

    #[test]
    fn range_on_unknown_session_is_unavailable() {
        let sequencer = Sequencer::default();
        assert!(matches!(
            sequencer.range("ghost", 1, 3),
            Err(SyncError::RangeUnavailable { head: 0, .. })
        ));
    }

    #[test]
    fn evicted_range_is_unavailable_but_snapshot_still_works() {
        let sequencer = Sequencer::new(RetentionPolicy {
            max_ops: 5,
            ..Default::default()
        });
        for n in 0..12 {
            sequencer.submit("s", delete(n));
        }
        assert!(matches!(
            sequencer.range("s", 2, 9),
            Err(SyncError::RangeUnavailable { oldest: 8, .. })
        ));
        let snap = sequencer.snapshot("s");
        assert_eq!(snap.current_seq, 12);
        assert_eq!(snap.operations.first().map(|o| o.seq_num), Some(8));
        assert_eq!(snap.operations.len(), 5);
    }

    fn expiring(max_age: Duration, idle: Duration) -> Sequencer {
        Sequencer::new(RetentionPolicy {
            max_age: Some(max_age),
            idle_session_ttl: idle,
            ..Default::default()
        })
    }

    #[test]
    fn sweep_expires_idle_sessions() {
        let sequencer = expiring(Duration::from_millis(50), Duration::from_millis(100));
        for n in 0..100 {
            sequencer.submit(&format!("room-{n}"), delete(n));
        }
        assert_eq!(sequencer.session_count(), 100);
        assert_eq!(sequencer.retained(), 100);

        let report = sequencer.sweep(Instant::now() + Duration::from_millis(200), |_| true);
        assert_eq!(report.evicted, 100);
        assert_eq!(report.removed.len(), 100);
        assert_eq!(sequencer.session_count(), 0);
        assert_eq!(sequencer.retained(), 0);
    }

    #[test]
    fn sweep_evicts_but_keeps_sessions_still_in_use() {
        let sequencer = expiring(Duration::from_millis(50), Duration::from_millis(100));
        sequencer.submit("watched", delete(1));
        sequencer.submit("quiet", delete(2));

        let later = Instant::now() + Duration::from_millis(200);
        let report = sequencer.sweep(later, |session| session != "watched");
        assert_eq!(report.evicted, 2);
        assert_eq!(report.removed, vec!["quiet".to_string()]);
        assert_eq!(sequencer.session_count(), 1);
        assert_eq!(sequencer.head("watched"), 1);
    }

    #[test]
    fn sweep_leaves_fresh_sessions_alone() {
        let sequencer = expiring(Duration::from_secs(60), Duration::from_secs(60));
        sequencer.submit("s", delete(1));
        let report = sequencer.sweep(Instant::now(), |_| true);
        assert_eq!(report, SweepReport::default());
        assert_eq!(sequencer.retained(), 1);
    }

    #[test]
    fn removed_session_restarts_numbering() {
        let sequencer = expiring(Duration::from_millis(10), Duration::ZERO);
        sequencer.submit("s", delete(1));
        sequencer.submit("s", delete(2));
        sequencer.sweep(Instant::now() + Duration::from_millis(50), |_| true);
        assert_eq!(sequencer.head("s"), 0);
        assert_eq!(sequencer.submit("s", delete(3)).seq_num, 1);
    }

    #[test]
    fn submitted_operation_keeps_producer_fields() {
        let sequencer = Sequencer::default();
        let op = sequencer.submit("lobby", delete(9));
        assert_eq!(op.session_id(), "lobby");
        assert_eq!(op.operation.client_id, "producer-9");
        assert_eq!(op.operation.kind.tag(), "entity_delete");
    }
}

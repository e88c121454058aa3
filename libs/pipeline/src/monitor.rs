use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU64, Ordering};

use serde::Serialize;

use tickstore_api::BatchId;

use crate::DrainState;

/// Счётчики drainer'а для `/api/stats`. Пишет только drainer,
/// читает кто угодно.
#[derive(Debug, Default)]
pub struct DrainMonitor {
    state: AtomicU8,
    leader: AtomicBool,
    cycles: AtomicU64,
    batches: AtomicU64,
    rows_committed: AtomicU64,
    rows_requeued: AtomicU64,
    dead_lettered: AtomicU64,
    quarantined: AtomicU64,
    last_batch_id: AtomicU64,
    last_batch_ms: AtomicI64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DrainSnapshot {
    pub state: DrainState,
    pub leader: bool,
    pub cycles: u64,
    pub batches: u64,
    pub rows_committed: u64,
    pub rows_requeued: u64,
    pub dead_lettered: u64,
    pub quarantined: u64,
    pub last_batch_id: Option<BatchId>,
    pub last_batch_ms: Option<i64>,
}

impl DrainMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_state(&self, state: DrainState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::Relaxed);
    }

    pub(crate) fn cycle_done(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn batch_done(&self, id: BatchId, at_ms: i64, committed: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.rows_committed.fetch_add(committed as u64, Ordering::Relaxed);
        self.last_batch_id.store(id.0, Ordering::Relaxed);
        self.last_batch_ms.store(at_ms, Ordering::Relaxed);
    }

    pub(crate) fn failures(&self, requeued: usize, dead_lettered: usize, quarantined: usize) {
        self.rows_requeued.fetch_add(requeued as u64, Ordering::Relaxed);
        self.dead_lettered.fetch_add(dead_lettered as u64, Ordering::Relaxed);
        self.quarantined.fetch_add(quarantined as u64, Ordering::Relaxed);
    }

    pub fn state(&self) -> DrainState {
        DrainState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> DrainSnapshot {
        let batches = self.batches.load(Ordering::Relaxed);
        DrainSnapshot {
            state: self.state(),
            leader: self.is_leader(),
            cycles: self.cycles.load(Ordering::Relaxed),
            batches,
            rows_committed: self.rows_committed.load(Ordering::Relaxed),
            rows_requeued: self.rows_requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            quarantined: self.quarantined.load(Ordering::Relaxed),
            last_batch_id: (batches > 0).then(|| BatchId(self.last_batch_id.load(Ordering::Relaxed))),
            last_batch_ms: (batches > 0).then(|| self.last_batch_ms.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_progress() {
        let monitor = DrainMonitor::new();
        let empty = monitor.snapshot();
        assert_eq!(empty.state, DrainState::Idle);
        assert!(empty.last_batch_id.is_none());

        monitor.set_state(DrainState::Dispatching);
        monitor.batch_done(BatchId(7), 1_000, 42);
        monitor.failures(1, 2, 3);
        let snap = monitor.snapshot();
        assert_eq!(snap.state, DrainState::Dispatching);
        assert_eq!(snap.last_batch_id, Some(BatchId(7)));
        assert_eq!(snap.rows_committed, 42);
        assert_eq!((snap.rows_requeued, snap.dead_lettered, snap.quarantined), (1, 2, 3));
    }
}

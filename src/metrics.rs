use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters shared by every engine component.
///
/// Nothing is dropped or rejected without bumping one of these.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub patterns_accepted: AtomicU64,
    pub patterns_rejected: AtomicU64,
    pub patterns_swept: AtomicU64,
    pub signals_received: AtomicU64,
    pub signals_invalid: AtomicU64,
    pub signals_stale: AtomicU64,
    pub signals_replayed: AtomicU64,
    pub signals_expired: AtomicU64,
    pub signals_after_shutdown: AtomicU64,
    pub collisions: AtomicU64,
    pub collisions_not_live: AtomicU64,
    pub producer_errors: AtomicU64,
    pub ticks_dropped: AtomicU64,
    pub ballots_accepted: AtomicU64,
    pub ballots_invalid: AtomicU64,
    pub approvals: AtomicU64,
    pub rejections_no_quorum: AtomicU64,
    pub rejections_window_lapsed: AtomicU64,
    pub rejections_capacity: AtomicU64,
    pub rejections_already_live: AtomicU64,
    pub transitions: AtomicU64,
    pub writes_applied: AtomicU64,
    pub writes_retried: AtomicU64,
    pub writes_dropped: AtomicU64,
    pub enqueue_rejected: AtomicU64,
    pub backlog_alarms: AtomicU64,
    pub events_unobserved: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let g = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            patterns_accepted: g(&self.patterns_accepted),
            patterns_rejected: g(&self.patterns_rejected),
            patterns_swept: g(&self.patterns_swept),
            signals_received: g(&self.signals_received),
            signals_invalid: g(&self.signals_invalid),
            signals_stale: g(&self.signals_stale),
            signals_replayed: g(&self.signals_replayed),
            signals_expired: g(&self.signals_expired),
            signals_after_shutdown: g(&self.signals_after_shutdown),
            collisions: g(&self.collisions),
            collisions_not_live: g(&self.collisions_not_live),
            producer_errors: g(&self.producer_errors),
            ticks_dropped: g(&self.ticks_dropped),
            ballots_accepted: g(&self.ballots_accepted),
            ballots_invalid: g(&self.ballots_invalid),
            approvals: g(&self.approvals),
            rejections_no_quorum: g(&self.rejections_no_quorum),
            rejections_window_lapsed: g(&self.rejections_window_lapsed),
            rejections_capacity: g(&self.rejections_capacity),
            rejections_already_live: g(&self.rejections_already_live),
            transitions: g(&self.transitions),
            writes_applied: g(&self.writes_applied),
            writes_retried: g(&self.writes_retried),
            writes_dropped: g(&self.writes_dropped),
            enqueue_rejected: g(&self.enqueue_rejected),
            backlog_alarms: g(&self.backlog_alarms),
            events_unobserved: g(&self.events_unobserved),
        }
    }
}

/// Point-in-time copy of [`EngineStats`] for the admin interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub patterns_accepted: u64,
    pub patterns_rejected: u64,
    pub patterns_swept: u64,
    pub signals_received: u64,
    pub signals_invalid: u64,
    pub signals_stale: u64,
    pub signals_replayed: u64,
    pub signals_expired: u64,
    pub signals_after_shutdown: u64,
    pub collisions: u64,
    pub collisions_not_live: u64,
    pub producer_errors: u64,
    pub ticks_dropped: u64,
    pub ballots_accepted: u64,
    pub ballots_invalid: u64,
    pub approvals: u64,
    pub rejections_no_quorum: u64,
    pub rejections_window_lapsed: u64,
    pub rejections_capacity: u64,
    pub rejections_already_live: u64,
    pub transitions: u64,
    pub writes_applied: u64,
    pub writes_retried: u64,
    pub writes_dropped: u64,
    pub enqueue_rejected: u64,
    pub backlog_alarms: u64,
    pub events_unobserved: u64,
}

impl StatsSnapshot {
    /// Everything that was turned away or lost, across all components.
    pub fn total_rejections(&self) -> u64 {
        self.patterns_rejected
            + self.signals_invalid
            + self.signals_stale
            + self.signals_replayed
            + self.signals_after_shutdown
            + self.collisions_not_live
            + self.ballots_invalid
            + self.rejections_no_quorum
            + self.rejections_window_lapsed
            + self.rejections_capacity
            + self.rejections_already_live
            + self.writes_dropped
            + self.ticks_dropped
            + self.enqueue_rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let stats = EngineStats::new();
        EngineStats::incr(&stats.collisions);
        EngineStats::incr(&stats.collisions);
        EngineStats::add(&stats.patterns_swept, 5);
        let snap = stats.snapshot();
        assert_eq!(snap.collisions, 2);
        assert_eq!(snap.patterns_swept, 5);
        assert_eq!(snap.writes_dropped, 0);
    }

    #[test]
    fn test_total_rejections_sums_loss_counters() {
        let stats = EngineStats::new();
        EngineStats::incr(&stats.signals_invalid);
        EngineStats::incr(&stats.rejections_capacity);
        EngineStats::incr(&stats.writes_dropped);
        // collisions are not rejections
        EngineStats::incr(&stats.collisions);
        assert_eq!(stats.snapshot().total_rejections(), 3);
    }
}

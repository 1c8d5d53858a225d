//! Time source and the acceptance-deadline heap.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use parking_lot::Mutex;

use crate::model::{RideId, Timestamp};

pub trait Clock: Send + Sync {
    /// Current time in milliseconds.
    fn now_ms(&self) -> Timestamp;
}

/// Wall clock backed by `chrono`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis().max(0) as Timestamp
    }
}

/// Clock that only moves when told to. Used by tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance_ms(&self, delta_ms: u64) -> Timestamp {
        self.now.fetch_add(delta_ms, AtomicOrdering::SeqCst) + delta_ms
    }

    pub fn set_ms(&self, now_ms: Timestamp) {
        self.now.store(now_ms, AtomicOrdering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Timestamp {
        self.now.load(AtomicOrdering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deadline {
    pub at: Timestamp,
    pub ride_id: RideId,
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering to make BinaryHeap a min-heap by deadline.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.ride_id.cmp(&self.ride_id))
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending acceptance deadlines, earliest first.
///
/// Entries are never removed when a ride leaves `assigned` early; the consumer
/// re-checks the ride and ignores stale deadlines.
#[derive(Debug, Default)]
pub struct DeadlineQueue {
    heap: Mutex<BinaryHeap<Deadline>>,
}

impl DeadlineQueue {
    pub fn schedule(&self, ride_id: RideId, at: Timestamp) {
        self.heap.lock().push(Deadline { at, ride_id });
    }

    /// Pops every deadline at or before `now`.
    pub fn pop_due(&self, now: Timestamp) -> Vec<Deadline> {
        let mut heap = self.heap.lock();
        let mut due = Vec::new();
        while heap.peek().is_some_and(|next| next.at <= now) {
            if let Some(deadline) = heap.pop() {
                due.push(deadline);
            }
        }
        due
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.heap.lock().peek().map(|d| d.at)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlines_pop_in_time_order() {
        let queue = DeadlineQueue::default();
        queue.schedule(RideId::new("r-10"), 10);
        queue.schedule(RideId::new("r-5"), 5);
        queue.schedule(RideId::new("r-20"), 20);

        assert_eq!(queue.next_deadline(), Some(5));

        let due = queue.pop_due(10);
        let ids: Vec<_> = due.iter().map(|d| d.ride_id.as_str()).collect();
        assert_eq!(ids, vec!["r-5", "r-10"]);
        assert_eq!(queue.len(), 1);

        assert!(queue.pop_due(19).is_empty());
        assert_eq!(queue.pop_due(20).len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        assert_eq!(clock.advance_ms(500), 1_500);
        clock.set_ms(42);
        assert_eq!(clock.now_ms(), 42);
    }
}

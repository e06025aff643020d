//! The timer queue: an ordered set of expirations keyed by monotonic
//! deadline.
//!
//! Entries are claimed with the same atomic discipline as descriptor
//! operations, so a cancelled wait simply leaves a dead entry behind; dead
//! entries are skipped and dropped when they surface at the top of the
//! heap. Scheduling a deadline earlier than the current earliest reports
//! that fact to the caller, which wakes the reactor so the run loop can
//! shorten its wait.

use crate::io::op::OpState;

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct TimerEntry {
    deadline: Instant,
    sequence: u64,
    op: Arc<OpState>,
}

// Reversed ordering turns the std max-heap into a min-heap on
// (deadline, sequence).
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.deadline, other.sequence).cmp(&(self.deadline, self.sequence))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Eq for TimerEntry {}

#[derive(Default)]
struct Heap {
    entries: BinaryHeap<TimerEntry>,
    next_sequence: u64,
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: Mutex<Heap>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Inserts an expiration. Returns `true` if `deadline` became the new
    /// earliest, in which case the caller must wake the reactor.
    pub(crate) fn schedule(&self, deadline: Instant, op: Arc<OpState>) -> bool {
        let mut heap = self.heap.lock().unwrap();
        let earliest_before = heap.entries.peek().map(|e| e.deadline);

        let sequence = heap.next_sequence;
        heap.next_sequence += 1;
        op.mark_registered();
        heap.entries.push(TimerEntry {
            deadline,
            sequence,
            op,
        });

        match earliest_before {
            None => true,
            Some(previous) => deadline < previous,
        }
    }

    /// Time until the nearest live expiration, `None` when the heap holds
    /// none. A deadline already in the past reports a zero duration.
    pub(crate) fn until_next(&self, now: Instant) -> Option<Duration> {
        let mut heap = self.heap.lock().unwrap();
        while let Some(top) = heap.entries.peek() {
            if top.op.registration() == crate::io::op::UNREGISTERED {
                // Claimed by a canceller; drop the dead entry.
                heap.entries.pop();
                continue;
            }
            return Some(top.deadline.saturating_duration_since(now));
        }
        None
    }

    /// Claims every expiration due at `now` and hands it to `fire`.
    pub(crate) fn process_expired(&self, now: Instant, mut fire: impl FnMut(Arc<OpState>)) {
        let mut heap = self.heap.lock().unwrap();
        while let Some(top) = heap.entries.peek() {
            if top.deadline > now {
                break;
            }
            let entry = heap.entries.pop().unwrap();
            if entry.op.claim() {
                fire(entry.op);
            }
        }
    }

    /// Empties the heap at shutdown, releasing each entry's waker so no
    /// task or scheduler reference outlives the context.
    pub(crate) fn drain(&self) {
        let mut heap = self.heap.lock().unwrap();
        while let Some(entry) = heap.entries.pop() {
            entry.op.claim();
            entry.op.discard();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.heap.lock().unwrap().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let queue = TimerQueue::new();
        let now = Instant::now();

        let late = OpState::new();
        let soon = OpState::new();
        queue.schedule(now + Duration::from_secs(5), late.clone());
        let earlier = queue.schedule(now + Duration::from_millis(1), soon.clone());
        assert!(earlier, "a sooner deadline must report earliest-changed");

        let mut fired = Vec::new();
        queue.process_expired(now + Duration::from_millis(2), |op| {
            fired.push(Arc::as_ptr(&op) as usize);
        });
        assert_eq!(fired, vec![Arc::as_ptr(&soon) as usize]);
        assert!(!queue.is_empty());
    }

    #[test]
    fn cancelled_entries_are_skipped() {
        let queue = TimerQueue::new();
        let now = Instant::now();

        let op = OpState::new();
        queue.schedule(now + Duration::from_millis(1), op.clone());

        // A canceller claims the op out of the heap's back.
        assert!(op.claim());

        let mut fired = 0;
        queue.process_expired(now + Duration::from_secs(1), |_| fired += 1);
        assert_eq!(fired, 0);
        assert_eq!(queue.until_next(now), None);
    }

    #[test]
    fn past_deadline_reports_zero_wait() {
        let queue = TimerQueue::new();
        let now = Instant::now();
        queue.schedule(now - Duration::from_millis(5), OpState::new());
        assert_eq!(queue.until_next(now), Some(Duration::ZERO));
    }
}

//! Deterministic event queue.
//!
//! Uses a `BinaryHeap` with reversed `Ord` on `ScheduledEvent` to act as
//! a min-heap keyed by `(scheduled_at, seq)`. Sequence numbers are
//! strictly increasing per `schedule` call, so two runs of the same
//! program pop events in exactly the same order: equal-time events fire
//! in schedule order, and replay is reproducible for a fixed seed.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::event::EventId;
use crate::time::SimTime;

// ── Scheduled entry ───────────────────────────────────────────────────

/// One queue entry: an event id bound to its trigger time and the
/// monotonic sequence number assigned when it was scheduled.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ScheduledEvent {
    pub at: SimTime,
    pub seq: u64,
    pub event: EventId,
}

/// Ordering: smallest `(at, seq)` first.
///
/// Rust's `BinaryHeap` is a max-heap, so the natural ordering is
/// reversed here to turn it into a min-heap.
impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ── Event queue ───────────────────────────────────────────────────────

/// Time-ordered queue of triggered events awaiting processing.
///
/// Owns the schedule-sequence generator. All scheduling goes through
/// this struct so that sequence numbers stay monotonic and ordering
/// stays deterministic.
#[derive(Debug)]
pub struct EventQueue {
    /// Min-heap (via reversed Ord on `ScheduledEvent`).
    heap: BinaryHeap<ScheduledEvent>,
    /// Next schedule sequence number.
    next_seq: u64,
}

impl EventQueue {
    /// Create a new, empty queue.
    pub fn new() -> Self {
        EventQueue {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Schedule `event` at virtual time `at`.
    ///
    /// Returns the sequence number assigned to this entry.
    pub fn schedule(&mut self, event: EventId, at: SimTime) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(ScheduledEvent { at, seq, event });
        seq
    }

    /// Pop the next entry (earliest time, lowest sequence number).
    pub fn pop_next(&mut self) -> Option<ScheduledEvent> {
        self.heap.pop()
    }

    /// The time of the next entry without removing it, or `None` when
    /// the queue is empty.
    pub fn peek_time(&self) -> Option<SimTime> {
        self.heap.peek().map(|e| e.at)
    }

    /// Returns `true` if the queue holds no entries.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

//! Per-shard timer queue.
//!
//! Timers are keyed by `(origin_id, routed_id, stream_id)` and fire once as a
//! Signal frame on that stream. Cancellation removes the pending entry, but a
//! timer already taken by [`TimerQueue::expire`] still fires; handlers must
//! tolerate a signal for a timer they cancelled.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

/// A fired timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    /// Cancellation token returned by [`TimerQueue::schedule`].
    pub cancel_id: u64,
    /// Origin binding of the stream.
    pub origin_id: u64,
    /// Routed binding of the stream.
    pub routed_id: u64,
    /// Stream the signal is delivered on.
    pub stream_id: u64,
    /// Signal kind chosen by the scheduler.
    pub signal_id: u32,
}

/// Deadline-ordered timers with cancellation tokens.
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    pending: HashMap<u64, Expired>,
    next_id: u64,
}

impl TimerQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a signal and return its cancellation token.
    pub fn schedule(
        &mut self,
        deadline: Instant,
        origin_id: u64,
        routed_id: u64,
        stream_id: u64,
        signal_id: u32,
    ) -> u64 {
        self.next_id += 1;
        let cancel_id = self.next_id;
        self.pending.insert(
            cancel_id,
            Expired {
                cancel_id,
                origin_id,
                routed_id,
                stream_id,
                signal_id,
            },
        );
        self.heap.push(Reverse((deadline, cancel_id)));
        cancel_id
    }

    /// Cancel a pending timer. Returns whether it was still pending.
    pub fn cancel(&mut self, cancel_id: u64) -> bool {
        self.pending.remove(&cancel_id).is_some()
    }

    /// Earliest deadline among pending timers.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, cancel_id))) = self.heap.peek().copied() {
            if self.pending.contains_key(&cancel_id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Remove and return every timer due at `now`, in deadline order.
    pub fn expire(&mut self, now: Instant) -> Vec<Expired> {
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, cancel_id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(timer) = self.pending.remove(&cancel_id) {
                expired.push(timer);
            }
        }
        expired
    }

    /// Number of pending timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no timer is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

//! One-shot deadline queue
//!
//! Armed timers ordered by absolute deadline. The facade pops expired
//! entries under its lock and runs their callbacks after releasing it.

use alloc::collections::BinaryHeap;
use alloc::vec::Vec;
use core::cmp::Ordering;
use core::fmt;

use axon_pal::Instant;

/// Handle for an armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Called with the timer's id and the context passed when it was armed
pub type TimerCallback = fn(TimerId, usize);

/// An expired timer, ready to be fired
#[derive(Debug, Clone, Copy)]
pub struct Expired {
    pub id: TimerId,
    pub callback: TimerCallback,
    pub context: usize,
}

impl Expired {
    pub fn fire(self) {
        (self.callback)(self.id, self.context);
    }
}

struct TimerEntry {
    deadline: Instant,
    id: TimerId,
    callback: TimerCallback,
    context: usize,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap, so we reverse the comparison.
        // Equal deadlines fire in arming order.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Min-heap of armed timers
#[derive(Default)]
pub struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, deadline: Instant, callback: TimerCallback, context: usize) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(TimerEntry {
            deadline,
            id,
            callback,
            context,
        });
        id
    }

    /// Remove an armed timer. Returns false if it already fired or never existed.
    ///
    /// O(n), timers are expected to be few.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|e| e.id != id);
        self.heap.len() != before
    }

    /// Pop every entry whose deadline is at or before `now`, earliest first.
    pub fn expire(&mut self, now: Instant) -> Vec<Expired> {
        let mut fired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Some(entry) = self.heap.pop() else {
                break;
            };
            fired.push(Expired {
                id: entry.id,
                callback: entry.callback,
                context: entry.context,
            });
        }
        fired
    }

    /// Deadline the comparator should be programmed with
    pub fn earliest(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

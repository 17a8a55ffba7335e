use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use crate::event::EventId;

const DEFAULT_WAIT: Duration = Duration::from_micros(10_000);

/// A single entry in the timer heap: an event due to fire at `deadline`
/// (microseconds since an arbitrary epoch, matching `Cycle`'s clock).
#[derive(Debug, Eq, PartialEq)]
struct Entry {
    deadline: i64,
    id: EventId,
}

impl Ord for Entry {
    fn cmp(&self, other: &Entry) -> Ordering {
        // reversed so `BinaryHeap`, a max-heap, pops the earliest deadline first
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of pending timer events, ordered by deadline.
///
/// Removal is lazy: `cancel` has no O(log n) heap-removal primitive, so a
/// canceled event is simply left in the heap and skipped when it's popped
/// (the cycle checks the event still exists in its event table before
/// firing it).
#[derive(Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Entry>,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue { heap: BinaryHeap::new() }
    }

    pub fn push(&mut self, deadline: i64, id: EventId) {
        self.heap.push(Entry { deadline, id });
    }

    pub fn peek_deadline(&self) -> Option<i64> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pops the earliest entry if its deadline has passed `now`.
    pub fn pop_due(&mut self, now: i64) -> Option<(i64, EventId)> {
        if self.heap.peek().is_some_and(|e| e.deadline <= now) {
            let entry = self.heap.pop().unwrap();
            Some((entry.deadline, entry.id))
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    /// Wait time for the reactor poll: `max(1, min(top.deadline - now, default))`
    /// microseconds, or the default when the heap is empty.
    pub fn wait_time(&self, now: i64) -> Duration {
        match self.peek_deadline() {
            None => DEFAULT_WAIT,
            Some(deadline) => {
                let remaining = deadline - now;
                if remaining <= 0 {
                    Duration::from_micros(1)
                } else {
                    Duration::from_micros(remaining as u64).min(DEFAULT_WAIT)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventId;

    fn id(n: usize) -> EventId {
        EventId::new(n, 0)
    }

    #[test]
    fn pops_in_deadline_order() {
        let mut q = TimerQueue::new();
        q.push(300, id(1));
        q.push(100, id(2));
        q.push(200, id(3));

        assert_eq!(q.pop_due(1000), Some((100, id(2))));
        assert_eq!(q.pop_due(1000), Some((200, id(3))));
        assert_eq!(q.pop_due(1000), Some((300, id(1))));
        assert_eq!(q.pop_due(1000), None);
    }

    #[test]
    fn pop_due_respects_now() {
        let mut q = TimerQueue::new();
        q.push(500, id(1));
        assert_eq!(q.pop_due(100), None);
        assert_eq!(q.pop_due(500), Some((500, id(1))));
    }

    #[test]
    fn wait_time_defaults_when_empty() {
        let q = TimerQueue::new();
        assert_eq!(q.wait_time(0), DEFAULT_WAIT);
    }

    #[test]
    fn wait_time_clamped_to_at_least_one_micro() {
        let mut q = TimerQueue::new();
        q.push(50, id(1));
        assert_eq!(q.wait_time(100), Duration::from_micros(1));
    }
}

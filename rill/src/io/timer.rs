use crate::promise::Deferred;
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

pub(crate) struct TimerEntry {
    pub(crate) deadline: Instant,
    seq: u64,
    pub(crate) deferred: Deferred<()>,
    pub(crate) mirror_key: usize,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the std max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Deadline heap owned by the dispatcher; the nearest deadline becomes the
/// poll timeout.
pub(crate) struct TimerDriver {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerDriver {
    pub(crate) fn new() -> Self {
        TimerDriver {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn insert(&mut self, deadline: Instant, deferred: Deferred<()>, mirror_key: usize) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry {
            deadline,
            seq,
            deferred,
            mirror_key,
        });
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    /// Time until the nearest deadline; zero when one is already due.
    pub(crate) fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.heap
            .peek()
            .map(|entry| entry.deadline.saturating_duration_since(now))
    }

    pub(crate) fn pop_due(&mut self, now: Instant) -> SmallVec<[TimerEntry; 8]> {
        let mut due = SmallVec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            due.push(self.heap.pop().expect("peeked entry vanished"));
        }
        due
    }

    pub(crate) fn drain(&mut self) -> Vec<TimerEntry> {
        self.heap.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::make_promise;
    use crate::queue::Queue;

    #[test]
    fn pops_deadlines_in_order() {
        let queue = Queue::new();
        let mut driver = TimerDriver::new();
        let now = Instant::now();

        for offset in [30u64, 10, 20] {
            let (deferred, _promise) = make_promise::<()>(&queue);
            driver.insert(now + Duration::from_millis(offset), deferred, 0);
        }

        assert_eq!(driver.next_timeout(now), Some(Duration::from_millis(10)));

        let due = driver.pop_due(now + Duration::from_millis(20));
        assert_eq!(due.len(), 2);
        assert!(due[0].deadline <= due[1].deadline);
        assert_eq!(driver.len(), 1);
    }

    #[test]
    fn due_now_yields_zero_timeout() {
        let queue = Queue::new();
        let mut driver = TimerDriver::new();
        let now = Instant::now();

        let (deferred, _promise) = make_promise::<()>(&queue);
        driver.insert(now, deferred, 0);

        assert_eq!(driver.next_timeout(now), Some(Duration::ZERO));
        assert_eq!(driver.pop_due(now).len(), 1);
        assert!(driver.is_empty());
    }
}

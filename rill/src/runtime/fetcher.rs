use crate::runtime::scheduler::{RunState, SchedulerShared};
use crate::runtime::{Fetched, TaskFetcher};
use std::sync::Arc;

/// The default task-fetcher: draws round-robin from the queues registered
/// with the scheduler.
///
/// The rotation cursor is shared between workers, so consecutive fetches
/// start at different queues and a non-empty queue is never starved by its
/// neighbors.
pub(crate) struct RoundRobinFetcher {
    shared: Arc<SchedulerShared>,
}

impl RoundRobinFetcher {
    pub(crate) fn new(shared: Arc<SchedulerShared>) -> Self {
        RoundRobinFetcher { shared }
    }
}

impl TaskFetcher for RoundRobinFetcher {
    fn fetch(&mut self) -> Fetched {
        let state = self.shared.state();
        if state == RunState::Stopped {
            return Fetched::Terminated;
        }

        let queues = self.shared.snapshot_queues();
        if !queues.is_empty() {
            let start = self.shared.next_rr_start();
            for offset in 0..queues.len() {
                let queue = &queues[(start + offset) % queues.len()];
                if let Some(task) = queue.drain_one() {
                    return Fetched::Task(task);
                }
            }
        }

        match state {
            // Draining and every queue is dry: the shutdown is complete.
            RunState::Draining => Fetched::Terminated,
            _ => Fetched::Empty,
        }
    }
}

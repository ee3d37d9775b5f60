use crate::runtime::scheduler::SchedulerShared;
use crate::runtime::{Fetched, TaskFetcher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// A scheduler worker: fetch, run, park, repeat.
pub(crate) struct Worker {
    index: usize,
    shared: Arc<SchedulerShared>,
    fetcher: Box<dyn TaskFetcher>,
}

impl Worker {
    pub(crate) fn new(
        index: usize,
        shared: Arc<SchedulerShared>,
        fetcher: Box<dyn TaskFetcher>,
    ) -> Self {
        Worker {
            index,
            shared,
            fetcher,
        }
    }

    pub(crate) fn run(mut self) {
        tracing::debug!(worker = self.index, "scheduler worker started");

        loop {
            // Snapshot the epoch before fetching so a post racing the fetch
            // bumps it and the park below falls through immediately.
            let epoch = self.shared.epoch();

            match self.fetcher.fetch() {
                Fetched::Task(task) => {
                    if catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
                        // A raw posted closure panicked. Promise continuations
                        // convert panics into rejections before they get here,
                        // so this is user code posted directly to a queue.
                        tracing::error!(worker = self.index, "task panicked; worker continues");
                    }
                }
                Fetched::Empty => self.shared.park(epoch),
                Fetched::Terminated => break,
            }
        }

        tracing::debug!(worker = self.index, "scheduler worker exited");
    }
}

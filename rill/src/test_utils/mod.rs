use crate::error::Rejection;
use crate::promise::{Promise, Tuple};
use crate::queue::Queue;
use crate::runtime::{Builder, Scheduler, TerminationMode};
use dashmap::DashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

pub(crate) const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

static UNHANDLED_HOOK_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

/// Serializes tests that install the process-wide unhandled-rejection hook.
pub(crate) fn unhandled_hook_guard() -> parking_lot::MutexGuard<'static, ()> {
    UNHANDLED_HOOK_LOCK.lock()
}

/// A scheduler with one attached queue, torn down gracefully on drop.
pub(crate) struct Rig {
    pub(crate) scheduler: Scheduler,
    pub(crate) queue: Arc<Queue>,
}

impl Rig {
    pub(crate) fn new() -> Rig {
        Self::with_workers(2)
    }

    pub(crate) fn with_workers(workers: usize) -> Rig {
        let scheduler = Builder::new()
            .worker_threads(workers)
            .thread_name_fn(|i| format!("rill-test-worker-{i}"))
            .try_build()
            .expect("failed to build test scheduler");
        let queue = scheduler.create_queue().expect("failed to create test queue");
        Rig { scheduler, queue }
    }

    pub(crate) fn shutdown(self) {
        self.scheduler.terminate(TerminationMode::Graceful);
        self.scheduler.await_termination();
    }
}

/// Records how often each labeled call site fired, the local stand-in for
/// an expect-call spy.
#[derive(Clone)]
pub(crate) struct Tracker {
    calls: Arc<DashMap<&'static str, usize>>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        Tracker {
            calls: Arc::new(DashMap::new()),
        }
    }

    pub(crate) fn hit(&self, label: &'static str) {
        *self.calls.entry(label).or_insert(0) += 1;
    }

    pub(crate) fn count(&self, label: &'static str) -> usize {
        self.calls.get(label).map(|c| *c).unwrap_or(0)
    }

    #[track_caller]
    pub(crate) fn expect_calls(&self, label: &'static str, expected: usize) {
        assert_eq!(
            self.count(label),
            expected,
            "unexpected call count for {label:?}"
        );
    }
}

/// Blocks until the promise settles and returns the outcome.
#[track_caller]
pub(crate) fn settle_of<T: Tuple>(promise: Promise<T>) -> Result<T, Rejection> {
    let (tx, rx) = mpsc::channel();
    let err_tx = tx.clone();

    promise
        .then(move |values: T| {
            let _ = tx.send(Ok(values));
        })
        .fail(move |rejection| {
            let _ = err_tx.send(Err(rejection));
            Ok(((),))
        });

    rx.recv_timeout(SETTLE_TIMEOUT)
        .expect("promise did not settle in time")
}

use crate::queue::{Notify, Queue};
use crate::runtime::fetcher::RoundRobinFetcher;
use crate::runtime::worker::Worker;
use crate::runtime::TerminationMode;
use anyhow::{anyhow, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(Arc<dyn Fn(usize) -> String + Send + Sync + 'static>);

impl ThreadNameFn {
    pub(crate) fn name_for(&self, index: usize) -> String {
        (self.0)(index)
    }
}

fn default_thread_name_fn() -> ThreadNameFn {
    ThreadNameFn(Arc::new(|index| format!("rill-worker-{index}")))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and builds a [`Scheduler`].
#[derive(Debug)]
pub struct Builder {
    /// The number of worker threads.
    ///
    /// Defaults to 1 worker per CPU core.
    worker_threads: Option<usize>,

    /// Name fn used for threads spawned by the scheduler.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the scheduler.
    thread_stack_size: Option<usize>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            worker_threads: None,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
        }
    }

    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "Worker threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets the name of threads spawned by the scheduler. All workers get
    /// the same name; use [`Builder::thread_name_fn`] to include the worker
    /// index.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move |_| val.clone()));
        self
    }

    /// Sets a function from worker index to thread name.
    ///
    /// The default yields "rill-worker-{index}".
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Creates the configured `Scheduler` and spawns its workers.
    pub fn try_build(self) -> Result<Scheduler> {
        let config = SchedulerConfig::try_from(self)?;
        Scheduler::start(config)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SchedulerConfig {
    pub(crate) worker_threads: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
}

impl TryFrom<Builder> for SchedulerConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self> {
        let worker_threads = builder
            .worker_threads
            .unwrap_or(thread::available_parallelism()?.get());

        Ok(SchedulerConfig {
            worker_threads,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    Running,
    /// Graceful termination: drain what is queued, reject new posts.
    Draining,
    /// Immediate termination: everything pending was discarded.
    Stopped,
}

pub(crate) struct SchedulerShared {
    queues: Mutex<Vec<Arc<Queue>>>,
    rr_cursor: AtomicUsize,
    state: Mutex<RunState>,
    /// Bumped on every wake-worthy event so a worker that raced a post never
    /// parks through it.
    epoch: AtomicU64,
    parked: Condvar,
    /// Guards parking; workers re-check the epoch under this lock.
    park_lock: Mutex<()>,
}

impl SchedulerShared {
    pub(crate) fn state(&self) -> RunState {
        *self.state.lock()
    }

    pub(crate) fn snapshot_queues(&self) -> Vec<Arc<Queue>> {
        self.queues.lock().clone()
    }

    pub(crate) fn next_rr_start(&self) -> usize {
        self.rr_cursor.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Parks the calling worker until the epoch moves past `seen`.
    pub(crate) fn park(&self, seen: u64) {
        let mut guard = self.park_lock.lock();
        while self.epoch.load(Ordering::SeqCst) == seen && self.state() == RunState::Running {
            self.parked.wait(&mut guard);
        }
    }

    fn wake_all(&self) {
        let _guard = self.park_lock.lock();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.parked.notify_all();
    }
}

impl Notify for SchedulerShared {
    fn notify(&self) {
        self.wake_all();
    }
}

impl fmt::Debug for SchedulerShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerShared")
            .field("queues", &self.queues.lock().len())
            .field("state", &self.state())
            .finish()
    }
}

/// Owns a pool of worker threads, each repeatedly pulling the next task from
/// the registered queues through a task-fetcher and executing it.
///
/// Scheduling is per-queue FIFO with explicit placement; there is no work
/// stealing. Across queues sharing the pool, the round-robin fetcher
/// guarantees a non-empty queue is serviced within bounded steps.
#[derive(Debug)]
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn builder() -> Builder {
        Builder::new()
    }

    fn start(config: SchedulerConfig) -> Result<Self> {
        let shared = Arc::new(SchedulerShared {
            queues: Mutex::new(Vec::new()),
            rr_cursor: AtomicUsize::new(0),
            state: Mutex::new(RunState::Running),
            epoch: AtomicU64::new(0),
            parked: Condvar::new(),
            park_lock: Mutex::new(()),
        });

        let mut workers = Vec::with_capacity(config.worker_threads);
        for index in 0..config.worker_threads {
            let fetcher = RoundRobinFetcher::new(shared.clone());
            let worker = Worker::new(index, shared.clone(), Box::new(fetcher));

            let mut builder = thread::Builder::new().name(config.thread_name.name_for(index));
            if let Some(stack_size) = config.thread_stack_size {
                builder = builder.stack_size(stack_size);
            }

            let handle = builder
                .spawn(move || worker.run())
                .map_err(|e| anyhow!("failed to spawn scheduler worker {index}: {e}"))?;
            workers.push(handle);
        }

        Ok(Scheduler {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Creates a new queue and registers it with this scheduler's workers.
    pub fn create_queue(&self) -> Result<Arc<Queue>> {
        let queue = Queue::new();
        self.attach_queue(&queue)?;
        Ok(queue)
    }

    /// Registers an externally-created queue. The queue's wake hook is
    /// pointed at this scheduler.
    pub fn attach_queue(&self, queue: &Arc<Queue>) -> Result<()> {
        if self.shared.state() != RunState::Running {
            return Err(crate::error::Error::SchedulerTerminated.into());
        }

        queue.set_notifier(self.shared.clone());
        self.shared.queues.lock().push(queue.clone());

        // The queue may already hold tasks posted before attachment.
        if !queue.is_empty() {
            self.shared.wake_all();
        }

        Ok(())
    }

    pub fn terminate(&self, mode: TerminationMode) {
        {
            let mut state = self.shared.state.lock();
            if *state == RunState::Stopped {
                return;
            }

            match mode {
                TerminationMode::Graceful => {
                    if *state == RunState::Running {
                        *state = RunState::Draining;
                    }
                }
                TerminationMode::Immediate => *state = RunState::Stopped,
            }
        }

        let queues = self.shared.snapshot_queues();
        let mut discarded = Vec::new();
        for queue in &queues {
            match mode {
                TerminationMode::Graceful => queue.close(),
                TerminationMode::Immediate => discarded.extend(queue.close_and_discard()),
            }
        }

        self.shared.wake_all();

        // Dropping a discarded task drops the deferreds its continuation
        // captured, rejecting the associated promises. Done outside any lock
        // since rejection handlers post to other queues.
        drop(discarded);
    }

    /// Blocks until every worker thread has exited. Callable after
    /// [`Scheduler::terminate`]; calling it on a running scheduler waits for
    /// a termination triggered elsewhere.
    pub fn await_termination(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!("scheduler worker panicked during shutdown");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Let still-running workers wind down on their own; joining here
        // could deadlock when the scheduler is dropped from one of its own
        // worker threads (the dispatcher's bootstrap pool does exactly that).
        self.terminate(TerminationMode::Graceful);
    }
}

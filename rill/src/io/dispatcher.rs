use crate::error::{Error, Rejection};
use crate::io::context::{install_core, take_core, with_core_mut};
use crate::io::core::Core;
use crate::io::events::{AttachedEvent, DescriptorTable, EventDescriptor};
use crate::io::poller::{Poller, PollerWaker};
use crate::io::resolver::{Resolver, ResolverResponse};
use crate::io::tcp::{ServerSocket, TcpSocket};
use crate::io::udp::{UdpReceiveOptions, UdpReceiver};
use crate::promise::{make_promise, rejected, with, Deferred, Promise};
use crate::queue::{Notify, Queue};
use crate::runtime::{Builder, Fetched, Scheduler, TaskFetcher, TerminationMode};
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::fmt;
use std::net::IpAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a dispatcher's loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherExit {
    /// Graceful termination completed.
    Normal,
    /// The loop ran out of events without an explicit terminate.
    Exited,
    /// Immediate termination: handles were torn down forcibly.
    Forced,
    /// A fatal poller error stopped the loop.
    Failed,
}

#[derive(Debug, Clone, Copy)]
enum LifecycleState {
    Running,
    Draining,
    Stopping,
    Stopped(DispatcherExit),
}

struct Lifecycle {
    state: LifecycleState,
    exit_waiters: Vec<Deferred<(DispatcherExit,)>>,
}

struct DispatcherNotify {
    waker: Arc<dyn PollerWaker>,
}

impl Notify for DispatcherNotify {
    fn notify(&self) {
        self.waker.wake();
    }
}

/// Close/detach control shared by the public I/O handles. Mutations are
/// marshaled onto the dispatcher thread; the generation guards against the
/// registry slot having been reused.
#[derive(Clone)]
pub(crate) struct HandleCtl {
    shared: Arc<DispatcherShared>,
    key: usize,
    gen: u32,
    closed: Arc<AtomicBool>,
}

impl HandleCtl {
    pub(crate) fn new(shared: Arc<DispatcherShared>, key: usize, gen: u32) -> Self {
        HandleCtl {
            shared,
            key,
            gen,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn request_close(&self, reason: Option<Rejection>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (key, gen) = (self.key, self.gen);
        let _ = self.shared.internal_queue.post(move || {
            with_core_mut(|core| core.close_entry_checked(key, gen, reason));
        });
    }
}

pub(crate) struct DispatcherShared {
    name: String,
    user_queue: Arc<Queue>,
    internal_queue: Arc<Queue>,
    waker: Arc<dyn PollerWaker>,
    backend: &'static str,
    descriptors: DescriptorTable,
    idle_mirror_key: usize,
    lifecycle: Mutex<Lifecycle>,
    /// The poller, parked here between construction and the loop taking it.
    boot_poller: Mutex<Option<Box<dyn Poller>>>,
    /// An embedding scheduler's fetcher, drained between polls.
    fetcher: Mutex<Option<Box<dyn TaskFetcher>>>,
    /// The private single-worker pool driving `start()`.
    runner: Mutex<Option<Scheduler>>,
}

impl DispatcherShared {
    pub(crate) fn user_queue(&self) -> &Arc<Queue> {
        &self.user_queue
    }

    pub(crate) fn internal_queue(&self) -> &Arc<Queue> {
        &self.internal_queue
    }

    pub(crate) fn descriptors(&self) -> &DescriptorTable {
        &self.descriptors
    }

    pub(crate) fn idle_mirror_key(&self) -> usize {
        self.idle_mirror_key
    }

    fn is_running(&self) -> bool {
        matches!(self.lifecycle.lock().state, LifecycleState::Running)
    }

    fn run(self: &Arc<Self>) -> Result<DispatcherExit> {
        let poller = self
            .boot_poller
            .lock()
            .take()
            .ok_or_else(|| anyhow!("dispatcher {:?} was already started", self.name))?;

        install_core(Core::new(self.clone(), poller));
        tracing::debug!(name = %self.name, backend = self.backend, "dispatcher loop starting");

        let outcome = self.run_loop();

        drop(take_core());
        // Tasks still queued can never run now; dropping them cascades
        // broken-promise rejections instead of hanging their chains. The
        // bootstrap pool, if `start()` made one, winds down the same way.
        drop(self.internal_queue.close_and_discard());
        drop(self.runner.lock().take());

        match &outcome {
            Ok(exit) => tracing::debug!(name = %self.name, ?exit, "dispatcher loop ended"),
            Err(err) => tracing::error!(name = %self.name, error = %err, "dispatcher loop failed"),
        }
        outcome
    }

    fn run_loop(self: &Arc<Self>) -> Result<DispatcherExit> {
        loop {
            self.drain_tasks();

            let now = Instant::now();
            let due = with_core_mut(|core| core.timers.pop_due(now));
            for timer in due {
                self.descriptors.remove(timer.mirror_key);
                timer.deferred.resolve(());
            }

            if let Some(exit) = self.check_exit() {
                return Ok(exit);
            }

            let timeout = with_core_mut(|core| core.timers.next_timeout(Instant::now()));
            let events = match with_core_mut(|core| core.poll(timeout)) {
                Ok(events) => events,
                Err(err) => {
                    self.shutdown_after_failure();
                    return Err(err.into());
                }
            };

            for event in events {
                with_core_mut(|core| core.dispatch(event));
            }
        }
    }

    /// Runs internal-queue tasks and the embedded fetcher until both are
    /// dry. This is the task-fetcher bridge: a post to the internal queue
    /// wakes the poller, and its continuation runs here, interleaved with
    /// I/O callbacks.
    fn drain_tasks(&self) {
        loop {
            let mut progressed = false;

            while let Some(task) = self.internal_queue.drain_one() {
                progressed = true;
                if catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
                    tracing::error!(name = %self.name, "dispatcher task panicked");
                }
            }

            let fetched = self.fetcher.lock().as_mut().map(|fetcher| fetcher.fetch());
            match fetched {
                Some(Fetched::Task(task)) => {
                    progressed = true;
                    if catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
                        tracing::error!(name = %self.name, "fetched task panicked");
                    }
                }
                Some(Fetched::Terminated) => {
                    *self.fetcher.lock() = None;
                }
                Some(Fetched::Empty) | None => {}
            }

            if !progressed {
                return;
            }
        }
    }

    fn check_exit(self: &Arc<Self>) -> Option<DispatcherExit> {
        let state = self.lifecycle.lock().state;
        match state {
            LifecycleState::Running | LifecycleState::Draining => {
                let (active, timers) =
                    with_core_mut(|core| (core.active_count(), core.timers.len()));
                if active != 0 || timers != 0 {
                    return None;
                }
                match state {
                    LifecycleState::Running => Some(self.finish(DispatcherExit::Exited)),
                    LifecycleState::Draining => {
                        if self.internal_queue.is_empty() {
                            Some(self.finish(DispatcherExit::Normal))
                        } else {
                            None
                        }
                    }
                    _ => unreachable!(),
                }
            }
            LifecycleState::Stopping => {
                self.force_close_everything();
                Some(self.finish(DispatcherExit::Forced))
            }
            LifecycleState::Stopped(exit) => Some(exit),
        }
    }

    fn force_close_everything(&self) {
        let drained = with_core_mut(|core| {
            core.close_all(Some(Rejection::from(Error::Canceled)));
            core.timers.drain()
        });
        for timer in drained {
            self.descriptors.remove(timer.mirror_key);
            timer.deferred.reject(Error::Canceled);
        }
    }

    fn shutdown_after_failure(self: &Arc<Self>) {
        self.force_close_everything();
        self.finish(DispatcherExit::Failed);
    }

    fn finish(&self, exit: DispatcherExit) -> DispatcherExit {
        let waiters = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.state = LifecycleState::Stopped(exit);
            std::mem::take(&mut lifecycle.exit_waiters)
        };
        for deferred in waiters {
            deferred.resolve((exit,));
        }
        exit
    }
}

impl fmt::Debug for DispatcherShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherShared")
            .field("name", &self.name)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

/// The I/O event dispatcher: binds a blocking OS poller to the promise and
/// queue world.
///
/// Completion callbacks land on the *user queue* given at construction;
/// continuations bound to [`Dispatcher::queue`] run on the poller thread
/// itself, interleaved with I/O events. Cloning is shallow.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    shared: Arc<DispatcherShared>,
}

impl Dispatcher {
    pub const DEFAULT_NAME: &'static str = "rill-io dispatcher";

    /// A dispatcher over the platform's default poller backend.
    #[cfg(target_os = "linux")]
    pub fn new(user_queue: &Arc<Queue>, name: impl Into<String>) -> Result<Dispatcher> {
        let poller = crate::io::poller::EpollPoller::new()?;
        Ok(Self::with_poller(user_queue, name, Box::new(poller)))
    }

    /// A dispatcher over a caller-supplied poller backend.
    pub fn with_poller(
        user_queue: &Arc<Queue>,
        name: impl Into<String>,
        poller: Box<dyn Poller>,
    ) -> Dispatcher {
        let waker = poller.waker();
        let backend = poller.backend_method();
        let internal_queue = Queue::new();

        let descriptors = DescriptorTable::new();
        let idle_mirror_key = descriptors.insert("dummy", None);

        let shared = Arc::new(DispatcherShared {
            name: name.into(),
            user_queue: user_queue.clone(),
            internal_queue: internal_queue.clone(),
            waker: waker.clone(),
            backend,
            descriptors,
            idle_mirror_key,
            lifecycle: Mutex::new(Lifecycle {
                state: LifecycleState::Running,
                exit_waiters: Vec::new(),
            }),
            boot_poller: Mutex::new(Some(poller)),
            fetcher: Mutex::new(None),
            runner: Mutex::new(None),
        });

        internal_queue.set_notifier(Arc::new(DispatcherNotify { waker }));

        Dispatcher { shared }
    }

    /// The queue whose continuations run on the poller thread.
    pub fn queue(&self) -> &Arc<Queue> {
        &self.shared.internal_queue
    }

    pub fn user_queue(&self) -> &Arc<Queue> {
        &self.shared.user_queue
    }

    /// A string describing the I/O multiplexing backend, e.g. "epoll".
    pub fn backend_method(&self) -> &'static str {
        self.shared.backend
    }

    /// Runs the poller loop on the calling thread; returns only on
    /// termination (or a fatal backend error).
    pub fn start_blocking(&self) -> Result<DispatcherExit> {
        self.shared.run()
    }

    /// Runs the poller loop on a private single-worker scheduler and
    /// returns immediately.
    pub fn start(&self) -> Result<()> {
        let scheduler = Builder::new()
            .worker_threads(1)
            .thread_name(self.shared.name.clone())
            .try_build()?;
        let bootstrap = scheduler.create_queue()?;

        let shared = self.shared.clone();
        bootstrap.post(move || {
            if let Err(err) = shared.run() {
                tracing::error!(error = %err, "dispatcher failed to run");
            }
        })?;

        *self.shared.runner.lock() = Some(scheduler);
        Ok(())
    }

    /// Installs the embedding scheduler's task-fetcher. Wake-ups for it must
    /// go through [`Dispatcher::notify`], which interrupts the poll so the
    /// fetcher is drained in-line with I/O events.
    pub fn set_task_fetcher(&self, fetcher: Box<dyn TaskFetcher>) {
        *self.shared.fetcher.lock() = Some(fetcher);
        self.notify();
    }

    /// Interrupts the poller so pending tasks get fetched promptly.
    pub fn notify(&self) {
        self.shared.waker.wake();
    }

    /// Registers a foreign event into this dispatcher's poller.
    pub fn attach_event(&self, event: Box<dyn AttachedEvent>) {
        if !self.shared.is_running() {
            tracing::warn!(name = %self.shared.name, "attach_event after terminate; dropped");
            return;
        }
        let posted = self.shared.internal_queue.post(move || {
            with_core_mut(|core| core.attach_foreign(event));
        });
        if posted.is_err() {
            tracing::warn!(name = %self.shared.name, "attach_event raced shutdown; dropped");
        }
    }

    /// A promise resolving after `duration`, on the user queue.
    pub fn delay(&self, duration: Duration) -> Promise<()> {
        if !self.shared.is_running() {
            return rejected(&self.shared.user_queue, Error::Canceled);
        }

        let deadline = Instant::now() + duration;
        let (deferred, promise) = make_promise::<()>(&self.shared.user_queue);
        let _ = self.shared.internal_queue.post(move || {
            with_core_mut(|core| core.add_timer(deadline, deferred));
        });
        promise
    }

    /// A DNS lookup through the system resolver, delivered on the user
    /// queue.
    pub fn lookup(&self, name: &str) -> Promise<(ResolverResponse,)> {
        Resolver::new(&self.shared.user_queue).lookup(name)
    }

    /// Connects to the first address that answers, in the order supplied.
    /// Rejects with the last error when every address fails.
    pub fn connect_to(&self, addresses: Vec<IpAddr>, port: u16) -> Promise<(TcpSocket,)> {
        if !self.shared.is_running() {
            return rejected(&self.shared.user_queue, Error::Canceled);
        }

        let (deferred, promise) = make_promise::<(TcpSocket,)>(&self.shared.user_queue);
        let _ = self.shared.internal_queue.post(move || {
            with_core_mut(|core| core.start_connect(addresses, port, deferred));
        });
        promise
    }

    /// Binds a listening socket and resolves once it accepts connections.
    pub fn listen(&self, port: u16, bind_to: IpAddr) -> Promise<(ServerSocket,)> {
        if !self.shared.is_running() {
            return rejected(&self.shared.user_queue, Error::Canceled);
        }

        let (deferred, promise) = make_promise::<(ServerSocket,)>(&self.shared.user_queue);
        let _ = self.shared.internal_queue.post(move || {
            with_core_mut(|core| core.create_listener(port, bind_to, deferred));
        });
        promise
    }

    /// Binds a UDP receiver and resolves once datagrams can arrive.
    pub fn udp_receive(
        &self,
        port: u16,
        options: UdpReceiveOptions,
    ) -> Promise<(UdpReceiver,)> {
        if !self.shared.is_running() {
            return rejected(&self.shared.user_queue, Error::Canceled);
        }

        let (deferred, promise) = make_promise::<(UdpReceiver,)>(&self.shared.user_queue);
        let _ = self.shared.internal_queue.post(move || {
            with_core_mut(|core| core.create_udp(port, options, deferred));
        });
        promise
    }

    /// Snapshot of every registered event, for diagnostics.
    pub fn dump_events(&self) -> Vec<EventDescriptor> {
        self.shared.descriptors.snapshot()
    }

    /// The same snapshot as a JSON array of
    /// `{handle, type, active, closing, fd, fd_err}` objects.
    pub fn dump_events_json(&self) -> String {
        serde_json::to_string(&self.dump_events())
            .expect("event descriptors always serialize")
    }

    /// Coarse shutdown. Graceful: stop accepting work, close the idle
    /// keepalive, let active handles finish. Immediate: close every handle
    /// and reject their pending promises with a cancellation error.
    pub fn terminate(&self, mode: TerminationMode) {
        enum Action {
            CloseIdle,
            CloseAll,
        }

        let action = {
            let mut lifecycle = self.shared.lifecycle.lock();
            match (lifecycle.state, mode) {
                (LifecycleState::Running, TerminationMode::Graceful) => {
                    lifecycle.state = LifecycleState::Draining;
                    Some(Action::CloseIdle)
                }
                (
                    LifecycleState::Running | LifecycleState::Draining,
                    TerminationMode::Immediate,
                ) => {
                    lifecycle.state = LifecycleState::Stopping;
                    Some(Action::CloseAll)
                }
                _ => None,
            }
        };

        match action {
            Some(Action::CloseIdle) => {
                let _ = self.shared.internal_queue.post(move || {
                    with_core_mut(|core| core.close_idle());
                });
            }
            Some(Action::CloseAll) => {
                // The loop performs the teardown itself when it observes
                // `Stopping`; the wake below is all that is needed.
            }
            None => {}
        }

        self.notify();
    }

    /// Resolves (on the user queue) with the loop's exit outcome once it
    /// has stopped.
    pub fn await_termination(&self) -> Promise<(DispatcherExit,)> {
        let mut lifecycle = self.shared.lifecycle.lock();
        match lifecycle.state {
            LifecycleState::Stopped(exit) => with(&self.shared.user_queue, (exit,)),
            _ => {
                let (deferred, promise) = make_promise(&self.shared.user_queue);
                lifecycle.exit_waiters.push(deferred);
                promise
            }
        }
    }
}

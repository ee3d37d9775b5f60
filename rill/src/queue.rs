use crate::error::Error;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A unit of deferred work: a callable bound to the queue it was posted to.
///
/// Created once, posted once, executed at most once, then destroyed.
pub struct Task {
    callable: Box<dyn FnOnce() + Send + 'static>,
    queue_id: QueueId,
}

impl Task {
    pub(crate) fn new<F>(queue_id: QueueId, callable: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            callable: Box::new(callable),
            queue_id,
        }
    }

    pub fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    pub fn run(self) {
        (self.callable)()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("queue_id", &self.queue_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(u64);

impl QueueId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        QueueId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wake hook installed when a queue is attached to a scheduler or a
/// dispatcher. `notify` must be cheap and must never run foreign code; it is
/// invoked right after a task lands on a previously-empty queue.
pub(crate) trait Notify: Send + Sync {
    fn notify(&self);
}

struct QueueInner {
    tasks: VecDeque<Task>,
    closed: bool,
}

/// An ordered FIFO buffer of tasks bound to a scheduling target.
///
/// Queues do not run tasks themselves; a scheduler worker (or the event
/// dispatcher's poll loop) pulls from them through a task-fetcher. Tasks
/// posted to one queue execute in posting order; there is no ordering or
/// fairness guarantee across queues.
pub struct Queue {
    id: QueueId,
    inner: Mutex<QueueInner>,
    notifier: Mutex<Option<Arc<dyn Notify>>>,
}

impl Queue {
    pub fn new() -> Arc<Queue> {
        Arc::new(Queue {
            id: QueueId::next(),
            inner: Mutex::new(QueueInner {
                tasks: VecDeque::new(),
                closed: false,
            }),
            notifier: Mutex::new(None),
        })
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Appends a task. If the queue was empty, the attached notifier is woken
    /// so a sleeping worker can pick the task up.
    pub fn post<F>(&self, callable: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let was_empty = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(Error::QueueClosed);
            }
            let was_empty = inner.tasks.is_empty();
            inner.tasks.push_back(Task::new(self.id, callable));
            was_empty
        };

        if was_empty {
            if let Some(notifier) = self.notifier.lock().clone() {
                notifier.notify();
            }
        }

        Ok(())
    }

    /// Pops and returns the head task, if any.
    pub fn drain_one(&self) -> Option<Task> {
        self.inner.lock().tasks.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().tasks.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Rejects new posts. Already-enqueued tasks stay drainable.
    pub(crate) fn close(&self) {
        self.inner.lock().closed = true;
    }

    /// Rejects new posts and discards everything enqueued. The discarded
    /// tasks are returned so the caller controls where their captured state
    /// (and any deferreds inside) is dropped.
    pub(crate) fn close_and_discard(&self) -> Vec<Task> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.tasks.drain(..).collect()
    }

    pub(crate) fn set_notifier(&self, notifier: Arc<dyn Notify>) {
        *self.notifier.lock() = Some(notifier);
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("len", &inner.tasks.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

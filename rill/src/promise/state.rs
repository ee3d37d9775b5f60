use crate::error::{report_unhandled_rejection, Error, Rejection};
use crate::promise::tuple::Tuple;
use crate::queue::Queue;
use parking_lot::Mutex;
use std::sync::Arc;

pub(crate) type Settlement<T> = Result<T, Rejection>;

/// A continuation registered on a pending promise, together with the queue
/// it must be posted to.
struct Waiter<T> {
    queue: Arc<Queue>,
    deliver: Box<dyn FnOnce(Settlement<T>) + Send>,
}

enum Inner<T> {
    /// Not yet settled. Holds at most one waiter: the public `Promise`
    /// handle is consumed when a continuation is attached, and shared
    /// consumption goes through `SharedPromise`'s own subscriber list.
    Pending(Option<Waiter<T>>),
    /// Settled, outcome not yet delivered to anyone.
    Settled(Option<Settlement<T>>),
    /// Settled and the outcome was handed to a waiter.
    Consumed,
}

/// The one-shot slot shared by a promise's producer and consumer.
///
/// The producer side (`Deferred` or an I/O completion) calls `settle`
/// exactly once; the consumer side attaches at most one waiter. Whichever
/// happens second triggers the hand-off, which always goes through a task
/// posted to the waiter's queue, never through a synchronous call.
pub(crate) struct SharedState<T: Tuple> {
    queue: Arc<Queue>,
    inner: Mutex<Inner<T>>,
}

impl<T: Tuple> SharedState<T> {
    pub(crate) fn pending(queue: Arc<Queue>) -> Self {
        SharedState {
            queue,
            inner: Mutex::new(Inner::Pending(None)),
        }
    }

    pub(crate) fn settled(queue: Arc<Queue>, outcome: Settlement<T>) -> Self {
        SharedState {
            queue,
            inner: Mutex::new(Inner::Settled(Some(outcome))),
        }
    }

    pub(crate) fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Moves the state to its terminal value and schedules the waiter, if
    /// one is already attached.
    pub(crate) fn settle(&self, outcome: Settlement<T>) {
        let waiter = {
            let mut inner = self.inner.lock();
            match &mut *inner {
                Inner::Pending(slot) => match slot.take() {
                    Some(waiter) => {
                        *inner = Inner::Consumed;
                        waiter
                    }
                    None => {
                        *inner = Inner::Settled(Some(outcome));
                        return;
                    }
                },
                // `Deferred` consumes itself on resolve/reject, so a second
                // settle cannot be expressed through the public API.
                Inner::Settled(_) | Inner::Consumed => {
                    tracing::error!("promise settled twice; second outcome dropped");
                    return;
                }
            }
        };

        post_delivery(&waiter.queue, waiter.deliver, outcome);
    }

    /// Attaches the continuation, scheduling it right away when the state is
    /// already terminal.
    pub(crate) fn add_waiter<F>(&self, queue: Arc<Queue>, deliver: F)
    where
        F: FnOnce(Settlement<T>) + Send + 'static,
    {
        let ready = {
            let mut inner = self.inner.lock();
            match &mut *inner {
                Inner::Pending(slot) => {
                    if slot.is_some() {
                        tracing::error!("second waiter attached to a promise; dropped");
                        return;
                    }
                    *slot = Some(Waiter {
                        queue,
                        deliver: Box::new(deliver),
                    });
                    return;
                }
                Inner::Settled(outcome) => {
                    let outcome = outcome.take();
                    *inner = Inner::Consumed;
                    match outcome {
                        Some(outcome) => (queue, outcome),
                        None => return,
                    }
                }
                Inner::Consumed => {
                    tracing::error!("waiter attached to an already-consumed promise; dropped");
                    return;
                }
            }
        };

        let (queue, outcome) = ready;
        post_delivery(&queue, Box::new(deliver), outcome);
    }
}

/// Posting is the only way a settlement reaches a continuation: even an
/// already-settled promise schedules, keeping stack depth bounded and the
/// observable asynchrony consistent.
fn post_delivery<T: Tuple>(
    queue: &Arc<Queue>,
    deliver: Box<dyn FnOnce(Settlement<T>) + Send>,
    outcome: Settlement<T>,
) {
    let posted = queue.post(move || deliver(outcome));
    if posted.is_err() {
        // The queue is gone (scheduler terminating). Dropping the closure
        // drops any downstream deferred it captured, which cascades a
        // rejection instead of silently losing the chain.
        tracing::debug!("continuation dropped: target queue is closed");
    }
}

impl<T: Tuple> Drop for SharedState<T> {
    fn drop(&mut self) {
        if let Inner::Settled(Some(Err(rejection))) = &*self.inner.get_mut() {
            report_unhandled_rejection(rejection);
        }
    }
}

/// The write side of a promise. Settling consumes the handle; dropping it
/// unsettled rejects the promise as broken.
pub(crate) struct ProducerHandle<T: Tuple> {
    state: Option<Arc<SharedState<T>>>,
}

impl<T: Tuple> ProducerHandle<T> {
    pub(crate) fn new(state: Arc<SharedState<T>>) -> Self {
        ProducerHandle { state: Some(state) }
    }

    pub(crate) fn settle(mut self, outcome: Settlement<T>) {
        if let Some(state) = self.state.take() {
            state.settle(outcome);
        }
    }
}

impl<T: Tuple> Drop for ProducerHandle<T> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            state.settle(Err(Rejection::from(Error::BrokenPromise)));
        }
    }
}

use crate::error::{Error, Rejection};
use crate::promise::continuation::Continuation;
use crate::promise::state::{ProducerHandle, Settlement, SharedState};
use crate::promise::tuple::Tuple;
use crate::queue::Queue;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// A one-shot handle to a value-to-be (or a failure), composable by chaining
/// continuations.
///
/// A promise is bound to a queue: every continuation chained onto it is
/// posted there (or to an explicitly supplied queue), never invoked
/// synchronously, not even when the promise is already settled. Combinators
/// consume the handle; use [`Promise::share`] when several consumers need
/// the outcome.
pub struct Promise<T: Tuple> {
    state: Arc<SharedState<T>>,
}

/// The write side of a promise, exposing `resolve`/`reject` callable exactly
/// once; both consume the handle. Dropping a `Deferred` without settling
/// rejects the promise with [`Error::BrokenPromise`].
pub struct Deferred<T: Tuple> {
    producer: ProducerHandle<T>,
}

impl<T: Tuple> Deferred<T> {
    pub fn resolve(self, values: T) {
        self.producer.settle(Ok(values));
    }

    pub fn reject(self, err: impl Into<Rejection>) {
        self.producer.settle(Err(err.into()));
    }

    pub(crate) fn settle(self, outcome: Settlement<T>) {
        self.producer.settle(outcome);
    }
}

impl<T: Tuple> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred").finish_non_exhaustive()
    }
}

/// Runs a user continuation, converting a panic into a rejection so it
/// propagates down the chain instead of unwinding the worker.
fn catch_invoke<R>(f: impl FnOnce() -> R) -> Result<R, Rejection> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(Rejection::from(Error::ContinuationPanicked(message)))
        }
    }
}

impl<T: Tuple> Promise<T> {
    pub(crate) fn new_pending(queue: Arc<Queue>) -> (Deferred<T>, Promise<T>) {
        let state = Arc::new(SharedState::pending(queue));
        let deferred = Deferred {
            producer: ProducerHandle::new(state.clone()),
        };
        (deferred, Promise { state })
    }

    pub(crate) fn from_settled(queue: Arc<Queue>, outcome: Settlement<T>) -> Promise<T> {
        Promise {
            state: Arc::new(SharedState::settled(queue, outcome)),
        }
    }

    /// The queue this promise's continuations run on.
    pub fn queue(&self) -> Arc<Queue> {
        self.state.queue().clone()
    }

    /// Chains a value transformation. On fulfillment `f` runs with the
    /// carried values (unpacked when its arity matches, or as one tuple)
    /// and the returned promise resolves with `f`'s return value. On
    /// rejection `f` is skipped and the rejection propagates.
    pub fn then<F, M>(self, f: F) -> Promise<(F::Output,)>
    where
        F: Continuation<T, M>,
    {
        let queue = self.queue();
        self.then_on(&queue, f)
    }

    /// Like [`Promise::then`] but runs `f` (and binds the downstream
    /// promise) on the given queue.
    pub fn then_on<F, M>(self, queue: &Arc<Queue>, f: F) -> Promise<(F::Output,)>
    where
        F: Continuation<T, M>,
    {
        let (deferred, promise) = Promise::new_pending(queue.clone());
        self.state.add_waiter(queue.clone(), move |outcome| match outcome {
            Ok(values) => match catch_invoke(move || f.invoke(values)) {
                Ok(value) => deferred.resolve((value,)),
                Err(rejection) => deferred.reject(rejection),
            },
            Err(rejection) => deferred.reject(rejection),
        });
        promise
    }

    /// Chains a continuation that itself returns a promise; the chain
    /// resolves with the inner promise's resolution, never with a nested
    /// promise.
    pub fn and_then<F, M, U>(self, f: F) -> Promise<U>
    where
        U: Tuple,
        F: Continuation<T, M, Output = Promise<U>>,
    {
        let queue = self.queue();
        self.and_then_on(&queue, f)
    }

    /// Like [`Promise::and_then`] on an explicit queue.
    pub fn and_then_on<F, M, U>(self, queue: &Arc<Queue>, f: F) -> Promise<U>
    where
        U: Tuple,
        F: Continuation<T, M, Output = Promise<U>>,
    {
        let (deferred, promise) = Promise::new_pending(queue.clone());
        self.state.add_waiter(queue.clone(), move |outcome| match outcome {
            Ok(values) => match catch_invoke(move || f.invoke(values)) {
                Ok(inner) => inner.pipe(deferred),
                Err(rejection) => deferred.reject(rejection),
            },
            Err(rejection) => deferred.reject(rejection),
        });
        promise
    }

    /// Handles a rejection. `g` may recover by returning the chain's values
    /// or rethrow by returning another rejection; the value path passes
    /// through untouched.
    pub fn fail<G>(self, g: G) -> Promise<T>
    where
        G: FnOnce(Rejection) -> Result<T, Rejection> + Send + 'static,
    {
        let queue = self.queue();
        let (deferred, promise) = Promise::new_pending(queue.clone());
        self.state.add_waiter(queue, move |outcome| match outcome {
            Ok(values) => deferred.resolve(values),
            Err(rejection) => match catch_invoke(move || g(rejection)) {
                Ok(Ok(values)) => deferred.resolve(values),
                Ok(Err(rejection)) => deferred.reject(rejection),
                Err(panic_rejection) => deferred.reject(panic_rejection),
            },
        });
        promise
    }

    /// Runs `h` on either outcome; the original outcome is forwarded unless
    /// `h` panics, in which case that error replaces it.
    pub fn finally<H>(self, h: H) -> Promise<T>
    where
        H: FnOnce() + Send + 'static,
    {
        let queue = self.queue();
        let (deferred, promise) = Promise::new_pending(queue.clone());
        self.state.add_waiter(queue, move |outcome| {
            match catch_invoke(h) {
                Ok(()) => deferred.settle(outcome),
                Err(rejection) => deferred.reject(rejection),
            }
        });
        promise
    }

    /// Observes the carried values for side effects; the original outcome is
    /// forwarded. Skipped on rejection.
    pub fn tap<O>(self, observer: O) -> Promise<T>
    where
        O: FnOnce(&T) + Send + 'static,
    {
        let queue = self.queue();
        let (deferred, promise) = Promise::new_pending(queue.clone());
        self.state.add_waiter(queue, move |outcome| match outcome {
            Ok(values) => match catch_invoke(|| observer(&values)) {
                Ok(()) => deferred.resolve(values),
                Err(rejection) => deferred.reject(rejection),
            },
            Err(rejection) => deferred.reject(rejection),
        });
        promise
    }

    /// Forwards this promise's outcome into `target` when it settles.
    pub(crate) fn pipe(self, target: Deferred<T>) {
        let queue = self.queue();
        self.state
            .add_waiter(queue, move |outcome| target.settle(outcome));
    }

    /// Consumes the promise, observing and discarding whatever outcome
    /// arrives. A rejection reaching a detached promise counts as handled
    /// and is never reported to the unhandled-rejection sink.
    pub fn detach(self) {
        let queue = self.queue();
        self.state.add_waiter(queue, |_outcome| {});
    }

    /// Converts into a cloneable promise distributing the outcome to any
    /// number of subscribers.
    pub fn share(self) -> SharedPromise<T>
    where
        T: Clone,
    {
        SharedPromise::from_promise(self)
    }
}

impl<T: Tuple> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

enum ShareInner<T: Tuple> {
    Waiting(Vec<Deferred<T>>),
    Done(Settlement<T>),
}

struct ShareState<T: Tuple> {
    queue: Arc<Queue>,
    inner: Mutex<ShareInner<T>>,
}

/// A promise whose outcome can be observed by any number of subscribers.
///
/// Each [`SharedPromise::subscribe`] call yields a fresh single-consumer
/// [`Promise`] carrying a clone of the values (or of the rejection).
pub struct SharedPromise<T: Tuple + Clone> {
    state: Arc<ShareState<T>>,
}

impl<T: Tuple + Clone> Clone for SharedPromise<T> {
    fn clone(&self) -> Self {
        SharedPromise {
            state: self.state.clone(),
        }
    }
}

impl<T: Tuple + Clone> SharedPromise<T> {
    fn from_promise(promise: Promise<T>) -> Self {
        let state = Arc::new(ShareState {
            queue: promise.queue(),
            inner: Mutex::new(ShareInner::Waiting(Vec::new())),
        });

        let delivery = state.clone();
        let queue = promise.queue();
        promise.state.add_waiter(queue, move |outcome| {
            let subscribers = {
                let mut inner = delivery.inner.lock();
                match std::mem::replace(&mut *inner, ShareInner::Done(outcome.clone())) {
                    ShareInner::Waiting(subscribers) => subscribers,
                    ShareInner::Done(_) => Vec::new(),
                }
            };
            for deferred in subscribers {
                deferred.settle(outcome.clone());
            }
        });

        SharedPromise { state }
    }

    pub fn subscribe(&self) -> Promise<T> {
        let (deferred, promise) = Promise::new_pending(self.state.queue.clone());

        let settled = {
            let mut inner = self.state.inner.lock();
            match &mut *inner {
                ShareInner::Waiting(subscribers) => {
                    subscribers.push(deferred);
                    None
                }
                ShareInner::Done(outcome) => Some((deferred, outcome.clone())),
            }
        };

        if let Some((deferred, outcome)) = settled {
            deferred.settle(outcome);
        }
        promise
    }

    /// Convenience for `subscribe().then(f)`.
    pub fn then<F, M>(&self, f: F) -> Promise<(F::Output,)>
    where
        F: Continuation<T, M>,
    {
        self.subscribe().then(f)
    }
}

impl<T: Tuple + Clone> fmt::Debug for SharedPromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPromise").finish_non_exhaustive()
    }
}

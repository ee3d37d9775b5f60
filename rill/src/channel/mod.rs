//! Bounded multi-producer / single-consumer value streams with
//! back-pressure, whose read side yields promises.

use crate::error::{Error, Rejection};
use crate::promise::{make_promise, rejected, with, Deferred, Promise};
use crate::queue::Queue;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[cfg(test)]
mod tests;

struct ResumeHook {
    callback: Box<dyn FnMut() + Send>,
    once: bool,
}

struct ChannelInner<T: Send + 'static> {
    buffer: VecDeque<T>,
    /// Readers parked while the buffer was empty. Non-empty waiters and a
    /// non-empty buffer are mutually exclusive: writes hand off to a waiter
    /// before they ever buffer.
    waiters: VecDeque<Deferred<(T,)>>,
    /// `Some` once closed; the inner option carries the close error.
    closed: Option<Option<Rejection>>,
    resume: Option<ResumeHook>,
    high_water: usize,
    low_water: usize,
}

struct ChannelShared<T: Send + 'static> {
    queue: Arc<Queue>,
    inner: Mutex<ChannelInner<T>>,
    writers: AtomicUsize,
}

impl<T: Send + 'static> ChannelShared<T> {
    fn close(&self, reason: Option<Rejection>) {
        let waiters: SmallVec<[Deferred<(T,)>; 4]> = {
            let mut inner = self.inner.lock();
            if inner.closed.is_some() {
                return;
            }
            inner.closed = Some(reason.clone());
            inner.resume = None;
            inner.waiters.drain(..).collect()
        };

        for deferred in waiters {
            match &reason {
                Some(err) => deferred.reject(err.clone()),
                None => deferred.reject(Error::ChannelClosed),
            }
        }
    }
}

/// A bounded channel bound to a queue; reads resolve on that queue.
///
/// The buffer has a soft limit (*high-water*): writes past it still succeed
/// but report back-pressure, and a *low-water* resume threshold at which a
/// registered notification fires so a paused producer can restart.
pub struct Channel<T: Send + 'static> {
    shared: Arc<ChannelShared<T>>,
}

impl<T: Send + 'static> Channel<T> {
    /// A channel whose high-water mark is `backlog` and whose low-water mark
    /// is `backlog - 1`.
    pub fn new(queue: &Arc<Queue>, backlog: usize) -> Self {
        let high = backlog.max(1);
        Self::with_watermarks(queue, high, high - 1)
    }

    /// A channel that never reports back-pressure.
    pub fn unbounded(queue: &Arc<Queue>) -> Self {
        Self::with_watermarks(queue, usize::MAX, usize::MAX - 1)
    }

    #[track_caller]
    pub fn with_watermarks(queue: &Arc<Queue>, high_water: usize, low_water: usize) -> Self {
        assert!(high_water > 0, "high-water mark must be positive");
        assert!(low_water < high_water, "low-water mark must be below high-water");

        Channel {
            shared: Arc::new(ChannelShared {
                queue: queue.clone(),
                inner: Mutex::new(ChannelInner {
                    buffer: VecDeque::new(),
                    waiters: VecDeque::new(),
                    closed: None,
                    resume: None,
                    high_water,
                    low_water,
                }),
                writers: AtomicUsize::new(0),
            }),
        }
    }

    pub fn split(self) -> (Writable<T>, Readable<T>) {
        self.shared.writers.store(1, Ordering::SeqCst);
        (
            Writable {
                shared: self.shared.clone(),
            },
            Readable {
                shared: self.shared,
            },
        )
    }
}

/// The producer end. Cloneable; the channel closes cleanly when the last
/// writer is dropped.
pub struct Writable<T: Send + 'static> {
    shared: Arc<ChannelShared<T>>,
}

impl<T: Send + 'static> Writable<T> {
    /// Writes a value, or hands it straight to a waiting reader.
    ///
    /// Returns `Ok(true)` when [`Writable::should_write`] held before the
    /// call; `Ok(false)` signals back-pressure, though the value was still
    /// accepted. Fails only when the channel is closed.
    pub fn write(&self, value: T) -> Result<bool, Error> {
        let (handoff, could_write) = {
            let mut inner = self.shared.inner.lock();
            if inner.closed.is_some() {
                return Err(Error::ChannelClosed);
            }

            let could_write = inner.buffer.len() < inner.high_water;
            match inner.waiters.pop_front() {
                Some(deferred) => (Some((deferred, value)), could_write),
                None => {
                    inner.buffer.push_back(value);
                    (None, could_write)
                }
            }
        };

        if let Some((deferred, value)) = handoff {
            deferred.resolve((value,));
        }
        Ok(could_write)
    }

    /// False once the buffered count reached the high-water mark, or the
    /// channel is closed.
    pub fn should_write(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner.closed.is_none() && inner.buffer.len() < inner.high_water
    }

    /// Registers `callback` to fire the next time (or each time, unless
    /// `once`) the buffered count drops below the low-water mark. Replaces
    /// any previous notification.
    ///
    /// When the count is already below low-water, the callback fires right
    /// away: the consumer may have drained the buffer between the
    /// producer's pause decision and this call, and the crossing it is
    /// waiting for would otherwise never come.
    pub fn set_resume_notification<F>(&self, mut callback: F, once: bool)
    where
        F: FnMut() + Send + 'static,
    {
        let fire_now = {
            let mut inner = self.shared.inner.lock();
            if inner.closed.is_some() {
                return;
            }
            if inner.buffer.len() < inner.low_water {
                true
            } else {
                inner.resume = Some(ResumeHook {
                    callback: Box::new(callback),
                    once,
                });
                return;
            }
        };

        if fire_now {
            callback();
            if !once {
                let mut inner = self.shared.inner.lock();
                if inner.resume.is_none() && inner.closed.is_none() {
                    inner.resume = Some(ResumeHook {
                        callback: Box::new(callback),
                        once,
                    });
                }
            }
        }
    }

    pub fn unset_resume_notification(&self) {
        self.shared.inner.lock().resume = None;
    }

    /// Closes the channel cleanly. Buffered values remain readable; once
    /// drained, readers observe the close. Idempotent.
    pub fn close(&self) {
        self.shared.close(None);
    }

    /// Closes the channel with an error readers will observe after the
    /// buffer drains.
    pub fn close_with(&self, err: impl Into<Rejection>) {
        self.shared.close(Some(err.into()));
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().closed.is_some()
    }

    /// A handle that can close the channel without keeping it open the way
    /// a writer clone would; used by I/O internals that must be able to
    /// fail pending writes while the user still owns the real writer.
    pub(crate) fn closer(&self) -> ChannelCloser<T> {
        ChannelCloser {
            shared: self.shared.clone(),
        }
    }
}

/// Closes a channel without participating in the writer count.
pub(crate) struct ChannelCloser<T: Send + 'static> {
    shared: Arc<ChannelShared<T>>,
}

impl<T: Send + 'static> ChannelCloser<T> {
    pub(crate) fn close(&self, reason: Option<Rejection>) {
        self.shared.close(reason);
    }
}

impl<T: Send + 'static> Clone for Writable<T> {
    fn clone(&self) -> Self {
        self.shared.writers.fetch_add(1, Ordering::SeqCst);
        Writable {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Drop for Writable<T> {
    fn drop(&mut self) {
        if self.shared.writers.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Last writer gone: readers observe a clean close after draining.
            // `close` is idempotent, so an earlier explicit close_with wins.
            self.shared.close(None);
        }
    }
}

/// The single-consumer end.
pub struct Readable<T: Send + 'static> {
    shared: Arc<ChannelShared<T>>,
}

enum Received<T: Send + 'static> {
    Value(T),
    Closed(Option<Rejection>),
    Parked(Promise<(T,)>),
}

impl<T: Send + 'static> Readable<T> {
    /// The next value, as a promise resolving on the channel's queue. After
    /// the buffer drains on a closed channel, rejects with
    /// [`Error::ChannelClosed`] or the close error.
    pub fn receive(&self) -> Promise<(T,)> {
        let (received, hook) = {
            let mut inner = self.shared.inner.lock();
            if let Some(value) = inner.buffer.pop_front() {
                let crossed = inner.buffer.len() + 1 >= inner.low_water
                    && inner.buffer.len() < inner.low_water;
                let hook = if crossed { inner.resume.take() } else { None };
                (Received::Value(value), hook)
            } else if let Some(reason) = inner.closed.clone() {
                (Received::Closed(reason), None)
            } else {
                let (deferred, promise) = make_promise::<(T,)>(&self.shared.queue);
                inner.waiters.push_back(deferred);
                (Received::Parked(promise), None)
            }
        };

        if let Some(mut hook) = hook {
            (hook.callback)();
            if !hook.once {
                let mut inner = self.shared.inner.lock();
                if inner.resume.is_none() && inner.closed.is_none() {
                    inner.resume = Some(hook);
                }
            }
        }

        match received {
            Received::Value(value) => with(&self.shared.queue, (value,)),
            Received::Closed(Some(err)) => rejected(&self.shared.queue, err),
            Received::Closed(None) => rejected(&self.shared.queue, Error::ChannelClosed),
            Received::Parked(promise) => promise,
        }
    }

    /// Number of buffered values not yet received.
    pub fn buffered(&self) -> usize {
        self.shared.inner.lock().buffer.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().closed.is_some()
    }
}

impl<T: Send + 'static> Drop for Readable<T> {
    fn drop(&mut self) {
        // The consumer is gone; writers must find out. Waiters cannot exist
        // here (single consumer), so only the flag matters.
        let mut inner = self.shared.inner.lock();
        if inner.closed.is_none() {
            inner.closed = Some(None);
            inner.resume = None;
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Writable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writable").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> fmt::Debug for Readable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readable").finish_non_exhaustive()
    }
}

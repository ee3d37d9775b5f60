use parking_lot::RwLock;
use std::fmt;
use std::io;
use std::sync::Arc;

/// A centralized error type for queue, promise, channel and dispatcher
/// operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("queue is closed and rejects new tasks")]
    QueueClosed,

    #[error("scheduler has been terminated")]
    SchedulerTerminated,

    #[error("promise abandoned before resolution")]
    BrokenPromise,

    #[error("operation canceled by dispatcher termination")]
    Canceled,

    #[error("channel is closed")]
    ChannelClosed,

    #[error("dns lookup failed for {0:?}")]
    DnsLookup(String),

    #[error("continuation panicked: {0}")]
    ContinuationPanicked(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A catch-all for any other type of unexpected error.
    #[error("unexpected error: {0}")]
    Other(#[from] anyhow::Error),
}

/// The failure value carried by a rejected promise.
///
/// Rejections are distributed to every waiter of a shared promise and stored
/// until observed, so they must be cheap to clone. The payload is an
/// `anyhow::Error` behind an `Arc`; typed inspection goes through
/// [`Rejection::is`] / [`Rejection::downcast_ref`].
#[derive(Clone)]
pub struct Rejection(Arc<anyhow::Error>);

impl Rejection {
    pub fn new<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Rejection(Arc::new(err.into()))
    }

    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Rejection(Arc::new(anyhow::Error::msg(message)))
    }

    /// Is the underlying error of type `E`, at any level of the source chain?
    pub fn is<E>(&self) -> bool
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.downcast_ref::<E>().is_some()
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl fmt::Debug for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl From<Error> for Rejection {
    fn from(err: Error) -> Self {
        Rejection::new(err)
    }
}

impl From<anyhow::Error> for Rejection {
    fn from(err: anyhow::Error) -> Self {
        Rejection(Arc::new(err))
    }
}

impl From<io::Error> for Rejection {
    fn from(err: io::Error) -> Self {
        Rejection::new(Error::Io(err))
    }
}

type RejectionHook = Box<dyn Fn(&Rejection) + Send + Sync>;

static UNHANDLED_HOOK: RwLock<Option<RejectionHook>> = RwLock::new(None);

/// Installs a process-wide hook invoked once per unhandled rejection, i.e.
/// whenever a rejected promise is released without its rejection ever having
/// been delivered to a waiter. Replaces any previous hook.
pub fn set_unhandled_rejection_hook<F>(hook: F)
where
    F: Fn(&Rejection) + Send + Sync + 'static,
{
    *UNHANDLED_HOOK.write() = Some(Box::new(hook));
}

/// Removes the hook; subsequent unhandled rejections fall back to the
/// default `tracing` sink.
pub fn unset_unhandled_rejection_hook() {
    *UNHANDLED_HOOK.write() = None;
}

pub(crate) fn report_unhandled_rejection(rejection: &Rejection) {
    let hook = UNHANDLED_HOOK.read();
    match &*hook {
        Some(hook) => hook(rejection),
        None => tracing::error!(error = %rejection, "unhandled promise rejection"),
    }
}

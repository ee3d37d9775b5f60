use bitflags::bitflags;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

#[cfg(target_os = "linux")]
pub mod epoll;
#[cfg(target_os = "linux")]
pub use epoll::EpollPoller;

bitflags! {
    /// Readiness interest registered for a file descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

/// A readiness event reported by a poller backend.
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// Wakes a blocked [`Poller::poll`] call from any thread.
pub trait PollerWaker: Send + Sync {
    fn wake(&self);
}

/// The opaque OS multiplexing backend the dispatcher drives.
///
/// Level-triggered semantics are assumed: a registered interest keeps being
/// reported while it holds, so pausing a producer means deregistering its
/// interest, not ignoring events. Timer support is expressed through the
/// `poll` timeout; the dispatcher owns the deadlines.
pub trait Poller: Send {
    /// A short name for the multiplexing method, e.g. "epoll".
    fn backend_method(&self) -> &'static str;

    /// A handle that interrupts a blocking `poll` promptly. Cloneable and
    /// callable from any thread; used by queues to notify the dispatcher.
    fn waker(&self) -> Arc<dyn PollerWaker>;

    fn register(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()>;

    fn reregister(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()>;

    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Blocks for up to `timeout` (forever when `None`) and appends readiness
    /// events to `events`. Wake-ups arrive as a normal return with possibly
    /// zero events.
    fn poll(&mut self, events: &mut Vec<PollEvent>, timeout: Option<Duration>) -> io::Result<()>;
}

use crate::io::poller::{Interest, PollEvent, Poller, PollerWaker};
use nix::fcntl::OFlag;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::unistd::pipe2;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

/// Token reserved for the wake pipe; never handed out to handles.
const WAKE_TOKEN: u64 = u64::MAX;

/// Epoll timeouts are clamped: a spurious timeout wake-up just re-enters the
/// loop, which recomputes the real deadline.
const MAX_POLL_MILLIS: u128 = 60_000;

struct PipeWaker {
    write_end: OwnedFd,
}

impl PollerWaker for PipeWaker {
    fn wake(&self) {
        let buf = [1u8];
        // EAGAIN means the pipe is already full of wake-ups; that is enough.
        let _ = unsafe {
            libc::write(
                self.write_end.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                1,
            )
        };
    }
}

/// The Linux readiness backend: level-triggered epoll plus a self-pipe for
/// cross-thread wake-ups.
pub struct EpollPoller {
    epoll: Epoll,
    wake_rx: OwnedFd,
    waker: Arc<PipeWaker>,
    events: Vec<EpollEvent>,
}

impl EpollPoller {
    pub fn new() -> io::Result<EpollPoller> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let (wake_rx, wake_tx) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;

        epoll.add(
            wake_rx.as_fd(),
            EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN),
        )?;

        Ok(EpollPoller {
            epoll,
            wake_rx,
            waker: Arc::new(PipeWaker { write_end: wake_tx }),
            events: vec![EpollEvent::empty(); 64],
        })
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.wake_rx.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

fn epoll_flags(interest: Interest) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if interest.contains(Interest::READABLE) {
        flags |= EpollFlags::EPOLLIN;
    }
    if interest.contains(Interest::WRITABLE) {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}

impl Poller for EpollPoller {
    fn backend_method(&self) -> &'static str {
        "epoll"
    }

    fn waker(&self) -> Arc<dyn PollerWaker> {
        self.waker.clone()
    }

    fn register(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .add(borrowed, EpollEvent::new(epoll_flags(interest), token as u64))?;
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut event = EpollEvent::new(epoll_flags(interest), token as u64);
        self.epoll.modify(borrowed, &mut event)?;
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.delete(borrowed)?;
        Ok(())
    }

    fn poll(&mut self, events: &mut Vec<PollEvent>, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = match timeout {
            Some(duration) => {
                let millis = duration.as_millis().min(MAX_POLL_MILLIS) as u16;
                EpollTimeout::from(millis)
            }
            None => EpollTimeout::NONE,
        };

        let count = match self.epoll.wait(&mut self.events, timeout) {
            Ok(count) => count,
            Err(nix::errno::Errno::EINTR) => 0,
            Err(err) => return Err(err.into()),
        };

        for event in &self.events[..count] {
            if event.data() == WAKE_TOKEN {
                self.drain_wake_pipe();
                continue;
            }

            let flags = event.events();
            events.push(PollEvent {
                token: event.data() as usize,
                readable: flags
                    .intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP),
                writable: flags.contains(EpollFlags::EPOLLOUT),
                error: flags.contains(EpollFlags::EPOLLERR),
            });
        }

        Ok(())
    }
}

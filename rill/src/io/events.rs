use crate::io::poller::Interest;
use parking_lot::Mutex;
use serde::Serialize;
use slab::Slab;
use std::os::fd::RawFd;

/// Introspection record for one event registered with a dispatcher.
/// Purely observational; never affects semantics.
#[derive(Debug, Clone, Serialize)]
pub struct EventDescriptor {
    /// Opaque id of the registration.
    pub handle: u64,
    /// What kind of event this is ("dummy", "timer", "tcp_socket", ...).
    #[serde(rename = "type")]
    pub kind: String,
    pub active: bool,
    pub closing: bool,
    pub fd: RawFd,
    pub fd_err: String,
}

#[derive(Debug, Clone)]
pub(crate) struct DescriptorEntry {
    pub(crate) kind: &'static str,
    pub(crate) active: bool,
    pub(crate) closing: bool,
    pub(crate) fd: Option<RawFd>,
}

/// The thread-safe mirror of the poller-thread registry, kept so
/// `dump_events` works from any thread without touching the live state.
pub(crate) struct DescriptorTable {
    entries: Mutex<Slab<DescriptorEntry>>,
}

impl DescriptorTable {
    pub(crate) fn new() -> Self {
        DescriptorTable {
            entries: Mutex::new(Slab::new()),
        }
    }

    pub(crate) fn insert(&self, kind: &'static str, fd: Option<RawFd>) -> usize {
        self.entries.lock().insert(DescriptorEntry {
            kind,
            active: true,
            closing: false,
            fd,
        })
    }

    pub(crate) fn update<F>(&self, key: usize, apply: F)
    where
        F: FnOnce(&mut DescriptorEntry),
    {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            apply(entry);
        }
    }

    pub(crate) fn remove(&self, key: usize) {
        let mut entries = self.entries.lock();
        if entries.contains(key) {
            entries.remove(key);
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<EventDescriptor> {
        let entries = self.entries.lock();
        let mut out: Vec<EventDescriptor> = entries
            .iter()
            .map(|(key, entry)| EventDescriptor {
                handle: key as u64,
                kind: entry.kind.to_string(),
                active: entry.active,
                closing: entry.closing,
                fd: entry.fd.unwrap_or(-1),
                fd_err: match entry.fd {
                    Some(_) => String::new(),
                    None => "no file descriptor".to_string(),
                },
            })
            .collect();
        out.sort_by_key(|descriptor| descriptor.handle);
        out
    }
}

/// A foreign event registered into a dispatcher's poller via
/// `attach_event`. Callbacks run on the poller thread.
pub trait AttachedEvent: Send + 'static {
    /// Type name surfaced by `dump_events`.
    fn kind(&self) -> &'static str;

    /// The descriptor to watch, if any. An event without one stays in the
    /// registry (keeping the dispatcher alive) but never fires.
    fn fd(&self) -> Option<RawFd> {
        None
    }

    fn interest(&self) -> Interest {
        Interest::empty()
    }

    fn on_ready(&mut self, readable: bool, writable: bool);

    /// Invoked once when the dispatcher closes the event (explicitly or at
    /// termination).
    fn on_close(&mut self) {}
}

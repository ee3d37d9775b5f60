use crate::channel::{Channel, ChannelCloser, Readable, Writable};
use crate::error::{Error, Rejection};
use crate::io::context::with_core_mut;
use crate::io::dispatcher::{DispatcherShared, HandleCtl};
use crate::io::events::AttachedEvent;
use crate::io::poller::{Interest, PollEvent, Poller};
use crate::io::sys::{self, AsRawFdExt};
use crate::io::tcp::{ServerSocket, TcpSocket};
use crate::io::timer::TimerDriver;
use crate::io::udp::{UdpBind, UdpPacket, UdpReceiveOptions, UdpReceiver};
use crate::promise::Deferred;
use slab::Slab;
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::{OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

/// Watermarks for the per-socket byte channels.
const STREAM_HIGH_WATER: usize = 8;
const STREAM_LOW_WATER: usize = 4;

/// Watermarks for a server socket's channel of accepted connections.
const ACCEPT_HIGH_WATER: usize = 16;
const ACCEPT_LOW_WATER: usize = 8;

const READ_BUFFER_SIZE: usize = 16 * 1024;
const UDP_BUFFER_SIZE: usize = 64 * 1024;

/// Bound on syscalls per readiness event so one busy handle cannot starve
/// the loop; level-triggered polling re-reports whatever is left.
const MAX_OPS_PER_EVENT: usize = 16;

const LISTEN_BACKLOG: i32 = 128;

fn unspecified_source() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}

fn encode_token(key: usize, gen: u32) -> usize {
    key | ((gen as usize) << 32)
}

fn decode_token(token: usize) -> (usize, u32) {
    (token & 0xFFFF_FFFF, (token >> 32) as u32)
}

pub(crate) struct Registered {
    kind: EventKind,
    fd: Option<RawFd>,
    interest: Interest,
    mirror_key: usize,
    gen: u32,
}

enum EventKind {
    /// The dummy keepalive registered at construction; keeps the loop alive
    /// while no real handles exist.
    Idle,
    Connect(ConnectState),
    Stream(StreamState),
    Listener(ListenerState),
    Udp(UdpState),
    Foreign(Box<dyn AttachedEvent>),
}

struct ConnectState {
    fd: Option<OwnedFd>,
    current: Option<SocketAddr>,
    remaining: VecDeque<IpAddr>,
    port: u16,
    deferred: Option<Deferred<(TcpSocket,)>>,
    last_err: Option<Rejection>,
}

struct StreamState {
    fd: OwnedFd,
    /// Producer side of the incoming byte channel; the user owns the reader.
    in_writable: Writable<Vec<u8>>,
    /// Closes the outgoing channel without counting as a writer, so the
    /// user's writer drop still closes the channel.
    out_closer: ChannelCloser<Vec<u8>>,
    /// The pump's reader, parked here while a partial send is in flight.
    parked_pump: Option<Readable<Vec<u8>>>,
    partial: Vec<u8>,
    partial_off: usize,
    /// Read side finished: peer EOF, read error, or the user dropped the
    /// reader.
    read_dead: bool,
    /// The user's writer closed and, once `partial` drains, the write side
    /// shuts down.
    out_done: bool,
}

struct ListenerState {
    fd: OwnedFd,
    incoming: Writable<TcpSocket>,
}

struct UdpState {
    fd: OwnedFd,
    packets: Writable<UdpPacket>,
    infinite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpNext {
    Continue,
    Parked,
    Gone,
}

enum AfterRead {
    Nothing,
    /// Drop read interest without a resume hook (EOF / reader gone).
    StopReading,
    /// Drop read interest and re-arm when the channel drains.
    PauseWithResume,
    CloseEntry(Option<Rejection>),
}

/// The thread-confined heart of a dispatcher: the poller, the live handle
/// registry, and the timer heap. Reached only through
/// [`crate::io::context::with_core_mut`] on the dispatcher's own thread.
pub(crate) struct Core {
    shared: Arc<DispatcherShared>,
    poller: Box<dyn Poller>,
    registry: Slab<Registered>,
    pub(crate) timers: TimerDriver,
    next_gen: u32,
}

impl Core {
    pub(crate) fn new(shared: Arc<DispatcherShared>, poller: Box<dyn Poller>) -> Self {
        let mut core = Core {
            shared: shared.clone(),
            poller,
            registry: Slab::new(),
            timers: TimerDriver::new(),
            next_gen: 0,
        };

        // The dummy idle event mirrors the descriptor inserted at
        // construction time.
        core.insert_entry(EventKind::Idle, None, shared.idle_mirror_key());
        core
    }

    fn insert_entry(&mut self, kind: EventKind, fd: Option<RawFd>, mirror_key: usize) -> (usize, u32) {
        let gen = self.next_gen;
        self.next_gen = self.next_gen.wrapping_add(1);
        let key = self.registry.insert(Registered {
            kind,
            fd,
            interest: Interest::empty(),
            mirror_key,
            gen,
        });
        (key, gen)
    }

    /// Removes an entry: mirror record dropped, fd deregistered. The caller
    /// decides what to do with the carried state.
    fn take_entry(&mut self, key: usize) -> Option<Registered> {
        let entry = self.registry.try_remove(key)?;
        self.shared.descriptors().remove(entry.mirror_key);
        if let Some(fd) = entry.fd {
            if !entry.interest.is_empty() {
                let _ = self.poller.deregister(fd);
            }
        }
        Some(entry)
    }

    fn gen_of(&self, key: usize) -> Option<u32> {
        self.registry.get(key).map(|entry| entry.gen)
    }

    fn update_interest(&mut self, key: usize, interest: Interest) -> io::Result<()> {
        let (fd, old, gen) = match self.registry.get(key) {
            Some(entry) => match entry.fd {
                Some(fd) => (fd, entry.interest, entry.gen),
                None => return Ok(()),
            },
            None => return Ok(()),
        };

        if old == interest {
            return Ok(());
        }

        let token = encode_token(key, gen);
        if old.is_empty() {
            self.poller.register(fd, token, interest)?;
        } else if interest.is_empty() {
            self.poller.deregister(fd)?;
        } else {
            self.poller.reregister(fd, token, interest)?;
        }

        let mirror_key = match self.registry.get_mut(key) {
            Some(entry) => {
                entry.interest = interest;
                entry.mirror_key
            }
            None => return Ok(()),
        };
        // Paused handles (no interest) show up as inactive in dump_events.
        self.shared
            .descriptors()
            .update(mirror_key, |entry| entry.active = !interest.is_empty());
        Ok(())
    }

    fn add_interest(&mut self, key: usize, add: Interest) -> io::Result<()> {
        let current = match self.registry.get(key) {
            Some(entry) => entry.interest,
            None => return Ok(()),
        };
        self.update_interest(key, current | add)
    }

    fn remove_interest(&mut self, key: usize, remove: Interest) -> io::Result<()> {
        let current = match self.registry.get(key) {
            Some(entry) => entry.interest,
            None => return Ok(()),
        };
        self.update_interest(key, current - remove)
    }

    pub(crate) fn active_count(&self) -> usize {
        self.registry.len()
    }

    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<PollEvent>> {
        let mut events = Vec::new();
        self.poller.poll(&mut events, timeout)?;
        Ok(events)
    }

    pub(crate) fn backend_method(&self) -> &'static str {
        self.poller.backend_method()
    }

    pub(crate) fn dispatch(&mut self, event: PollEvent) {
        let (key, gen) = decode_token(event.token);
        match self.registry.get(key) {
            Some(entry) if entry.gen == gen => {}
            // Stale event for a handle that closed inside this batch.
            _ => return,
        }

        enum Tag {
            Idle,
            Connect,
            Stream,
            Listener,
            Udp,
            Foreign,
        }
        let tag = match &self.registry.get(key).expect("checked above").kind {
            EventKind::Idle => Tag::Idle,
            EventKind::Connect(_) => Tag::Connect,
            EventKind::Stream(_) => Tag::Stream,
            EventKind::Listener(_) => Tag::Listener,
            EventKind::Udp(_) => Tag::Udp,
            EventKind::Foreign(_) => Tag::Foreign,
        };

        match tag {
            Tag::Idle => {}
            Tag::Connect => {
                if event.writable || event.error || event.readable {
                    self.connect_ready(key);
                }
            }
            Tag::Stream => {
                if event.readable || event.error {
                    self.stream_readable(key);
                }
                if event.writable {
                    self.stream_writable(key);
                }
            }
            Tag::Listener => {
                if event.readable || event.error {
                    self.listener_readable(key);
                }
            }
            Tag::Udp => {
                if event.readable || event.error {
                    self.udp_readable(key);
                }
            }
            Tag::Foreign => {
                if let Some(entry) = self.registry.get_mut(key) {
                    if let EventKind::Foreign(attached) = &mut entry.kind {
                        attached.on_ready(event.readable, event.writable);
                    }
                }
            }
        }
    }

    // --- Timers ---

    pub(crate) fn add_timer(&mut self, deadline: std::time::Instant, deferred: Deferred<()>) {
        let mirror_key = self.shared.descriptors().insert("timer", None);
        self.timers.insert(deadline, deferred, mirror_key);
    }

    // --- Lifecycle ---

    pub(crate) fn close_idle(&mut self) {
        let idle_key = self
            .registry
            .iter()
            .find(|(_, entry)| matches!(entry.kind, EventKind::Idle))
            .map(|(key, _)| key);
        if let Some(key) = idle_key {
            self.close_entry(key, None);
        }
    }

    pub(crate) fn close_all(&mut self, reason: Option<Rejection>) {
        let keys: Vec<usize> = self.registry.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.close_entry(key, reason.clone());
        }
    }

    pub(crate) fn close_entry_checked(&mut self, key: usize, gen: u32, reason: Option<Rejection>) {
        if self.gen_of(key) == Some(gen) {
            self.close_entry(key, reason);
        }
    }

    /// Tears one registration down: channels closed, deferreds rejected, fd
    /// released. Idempotent per handle because the entry is gone afterwards.
    fn close_entry(&mut self, key: usize, reason: Option<Rejection>) {
        let Some(entry) = self.take_entry(key) else {
            return;
        };

        match entry.kind {
            EventKind::Idle => {}
            EventKind::Connect(mut state) => {
                if let Some(deferred) = state.deferred.take() {
                    let rejection = reason
                        .or(state.last_err)
                        .unwrap_or_else(|| Rejection::from(Error::Canceled));
                    deferred.reject(rejection);
                }
            }
            EventKind::Stream(state) => {
                match &reason {
                    Some(err) => state.in_writable.close_with(err.clone()),
                    None => state.in_writable.close(),
                }
                state.out_closer.close(reason);
                // parked_pump (if any) and the fd drop with the state.
            }
            EventKind::Listener(state) => match &reason {
                Some(err) => state.incoming.close_with(err.clone()),
                None => state.incoming.close(),
            },
            EventKind::Udp(state) => {
                state.packets.unset_resume_notification();
                match &reason {
                    Some(err) => state.packets.close_with(err.clone()),
                    None => state.packets.close(),
                }
            }
            EventKind::Foreign(mut attached) => attached.on_close(),
        }
    }

    // --- Foreign events ---

    pub(crate) fn attach_foreign(&mut self, attached: Box<dyn AttachedEvent>) {
        let fd = attached.fd();
        let interest = attached.interest();
        let mirror_key = self.shared.descriptors().insert(attached.kind(), fd);
        let (key, _gen) = self.insert_entry(EventKind::Foreign(attached), fd, mirror_key);

        if fd.is_some() && !interest.is_empty() {
            if let Err(err) = self.update_interest(key, interest) {
                tracing::error!(error = %err, "failed to register attached event");
                self.close_entry(key, Some(Rejection::from(Error::Io(err))));
            }
        }
    }

    // --- Connect ---

    pub(crate) fn start_connect(
        &mut self,
        addresses: Vec<IpAddr>,
        port: u16,
        deferred: Deferred<(TcpSocket,)>,
    ) {
        let state = ConnectState {
            fd: None,
            current: None,
            remaining: addresses.into(),
            port,
            deferred: Some(deferred),
            last_err: None,
        };
        self.drive_connect(state);
    }

    /// Tries the remaining addresses in order: resolve on the first
    /// completed handshake, park in the registry while one is in flight,
    /// reject with the last error once exhausted.
    fn drive_connect(&mut self, mut state: ConnectState) {
        loop {
            let Some(ip) = state.remaining.pop_front() else {
                if let Some(deferred) = state.deferred.take() {
                    let rejection = state.last_err.take().unwrap_or_else(|| {
                        Rejection::from(Error::Io(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "no addresses to connect to",
                        )))
                    });
                    deferred.reject(rejection);
                }
                return;
            };

            let addr = SocketAddr::new(ip, state.port);
            let fd = match sys::tcp_socket(addr.is_ipv6()) {
                Ok(fd) => fd,
                Err(err) => {
                    state.last_err = Some(Rejection::from(Error::Io(err)));
                    continue;
                }
            };

            match sys::connect(fd.raw(), &addr) {
                Ok(true) => {
                    match self.finalize_stream(fd, Some(addr)) {
                        Ok(socket) => {
                            if let Some(deferred) = state.deferred.take() {
                                deferred.resolve((socket,));
                            }
                        }
                        Err(err) => {
                            state.last_err = Some(Rejection::from(Error::Io(err)));
                            continue;
                        }
                    }
                    return;
                }
                Ok(false) => {
                    let raw = fd.raw();
                    let mirror_key = self.shared.descriptors().insert("tcp_connect", Some(raw));
                    state.fd = Some(fd);
                    state.current = Some(addr);
                    let (key, _gen) =
                        self.insert_entry(EventKind::Connect(state), Some(raw), mirror_key);

                    if let Err(err) = self.update_interest(key, Interest::WRITABLE) {
                        if let Some(entry) = self.take_entry(key) {
                            if let EventKind::Connect(mut state) = entry.kind {
                                state.fd = None;
                                state.last_err = Some(Rejection::from(Error::Io(err)));
                                self.drive_connect(state);
                            }
                        }
                    }
                    return;
                }
                Err(err) => {
                    state.last_err = Some(Rejection::from(Error::Io(err)));
                    continue;
                }
            }
        }
    }

    fn connect_ready(&mut self, key: usize) {
        let Some(entry) = self.take_entry(key) else {
            return;
        };
        let EventKind::Connect(mut state) = entry.kind else {
            return;
        };
        let Some(fd) = state.fd.take() else {
            return;
        };
        let peer = state.current.take();

        match sys::take_socket_error(fd.raw()) {
            Ok(()) => match self.finalize_stream(fd, peer) {
                Ok(socket) => {
                    if let Some(deferred) = state.deferred.take() {
                        deferred.resolve((socket,));
                    }
                }
                Err(err) => {
                    state.last_err = Some(Rejection::from(Error::Io(err)));
                    self.drive_connect(state);
                }
            },
            Err(err) => {
                state.last_err = Some(Rejection::from(Error::Io(err)));
                drop(fd);
                self.drive_connect(state);
            }
        }
    }

    // --- Streams ---

    /// Registers a connected socket: channel pair, read interest, write
    /// pump. Returns the user-facing handle.
    fn finalize_stream(
        &mut self,
        fd: OwnedFd,
        peer: Option<SocketAddr>,
    ) -> io::Result<TcpSocket> {
        let user_queue = self.shared.user_queue().clone();
        let (in_writable, in_readable) =
            Channel::with_watermarks(&user_queue, STREAM_HIGH_WATER, STREAM_LOW_WATER).split();
        let (out_writable, out_readable) =
            Channel::with_watermarks(&user_queue, STREAM_HIGH_WATER, STREAM_LOW_WATER).split();
        let out_closer = out_writable.closer();

        let raw = fd.raw();
        let mirror_key = self.shared.descriptors().insert("tcp_socket", Some(raw));
        let state = StreamState {
            fd,
            in_writable,
            out_closer,
            parked_pump: None,
            partial: Vec::new(),
            partial_off: 0,
            read_dead: false,
            out_done: false,
        };
        let (key, gen) = self.insert_entry(EventKind::Stream(state), Some(raw), mirror_key);

        if let Err(err) = self.update_interest(key, Interest::READABLE) {
            self.take_entry(key);
            return Err(err);
        }

        pump_stream(self.shared.clone(), key, gen, out_readable);

        let ctl = HandleCtl::new(self.shared.clone(), key, gen);
        Ok(TcpSocket::new(in_readable, out_writable, ctl, peer))
    }

    fn stream_readable(&mut self, key: usize) {
        let mut after = AfterRead::Nothing;
        let mut resume_ctx: Option<(u32, Writable<Vec<u8>>)> = None;

        {
            let Some(entry) = self.registry.get_mut(key) else {
                return;
            };
            let gen = entry.gen;
            let EventKind::Stream(state) = &mut entry.kind else {
                return;
            };
            if state.read_dead {
                return;
            }
            let fd = state.fd.raw();

            for _ in 0..MAX_OPS_PER_EVENT {
                let mut buf = vec![0u8; READ_BUFFER_SIZE];
                match sys::read(fd, &mut buf) {
                    Ok(Some(0)) => {
                        state.in_writable.close();
                        state.read_dead = true;
                        after = if state.out_done && state.partial.is_empty() {
                            AfterRead::CloseEntry(None)
                        } else {
                            AfterRead::StopReading
                        };
                        break;
                    }
                    Ok(Some(n)) => {
                        buf.truncate(n);
                        match state.in_writable.write(buf) {
                            Ok(true) => continue,
                            Ok(false) => {
                                // Back-pressure: pause OS reads, resume when
                                // the consumer drains below low-water.
                                resume_ctx = Some((gen, state.in_writable.clone()));
                                after = AfterRead::PauseWithResume;
                                break;
                            }
                            Err(_) => {
                                state.read_dead = true;
                                after = if state.out_done && state.partial.is_empty() {
                                    AfterRead::CloseEntry(None)
                                } else {
                                    AfterRead::StopReading
                                };
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let rejection = Rejection::from(Error::Io(err));
                        state.in_writable.close_with(rejection.clone());
                        state.read_dead = true;
                        after = AfterRead::CloseEntry(Some(rejection));
                        break;
                    }
                }
            }
        }

        match after {
            AfterRead::Nothing => {}
            AfterRead::StopReading => {
                let _ = self.remove_interest(key, Interest::READABLE);
            }
            AfterRead::PauseWithResume => {
                let _ = self.remove_interest(key, Interest::READABLE);
                if let Some((gen, writable)) = resume_ctx {
                    let shared = self.shared.clone();
                    writable.set_resume_notification(
                        move || {
                            let _ = shared.internal_queue().post(move || {
                                with_core_mut(|core| core.resume_read(key, gen));
                            });
                        },
                        true,
                    );
                }
            }
            AfterRead::CloseEntry(reason) => self.close_entry(key, reason),
        }
    }

    pub(crate) fn resume_read(&mut self, key: usize, gen: u32) {
        match self.registry.get(key) {
            Some(entry) if entry.gen == gen => {}
            _ => return,
        }
        if let Some(entry) = self.registry.get(key) {
            if let EventKind::Stream(state) = &entry.kind {
                if state.read_dead {
                    return;
                }
            }
        }
        // Level-triggered polling re-reports pending data as soon as the
        // interest is back.
        let _ = self.add_interest(key, Interest::READABLE);
    }

    pub(crate) fn stream_send(&mut self, key: usize, gen: u32, block: Vec<u8>) -> PumpNext {
        let mut outcome = PumpNext::Continue;
        let mut close_reason: Option<Option<Rejection>> = None;

        {
            let Some(entry) = self.registry.get_mut(key) else {
                return PumpNext::Gone;
            };
            if entry.gen != gen {
                return PumpNext::Gone;
            }
            let EventKind::Stream(state) = &mut entry.kind else {
                return PumpNext::Gone;
            };

            if state.partial.is_empty() {
                state.partial = block;
                state.partial_off = 0;
            } else {
                // The pump sends one block at a time, so a pending partial
                // here means an out-of-band send; append behind it.
                state.partial.extend_from_slice(&block);
            }

            let fd = state.fd.raw();
            loop {
                if state.partial_off == state.partial.len() {
                    state.partial.clear();
                    state.partial_off = 0;
                    break;
                }
                match sys::write(fd, &state.partial[state.partial_off..]) {
                    Ok(Some(n)) => state.partial_off += n,
                    Ok(None) => {
                        outcome = PumpNext::Parked;
                        break;
                    }
                    Err(err) => {
                        close_reason = Some(Some(Rejection::from(Error::Io(err))));
                        outcome = PumpNext::Gone;
                        break;
                    }
                }
            }
        }

        if let Some(reason) = close_reason {
            self.close_entry(key, reason);
        } else if outcome == PumpNext::Parked {
            let _ = self.add_interest(key, Interest::WRITABLE);
        }
        outcome
    }

    pub(crate) fn park_pump(&mut self, key: usize, gen: u32, pump: Readable<Vec<u8>>) {
        if let Some(entry) = self.registry.get_mut(key) {
            if entry.gen == gen {
                if let EventKind::Stream(state) = &mut entry.kind {
                    state.parked_pump = Some(pump);
                    return;
                }
            }
        }
        // Entry is gone; dropping the reader finishes closing the channel.
    }

    fn stream_writable(&mut self, key: usize) {
        let mut close_reason: Option<Option<Rejection>> = None;
        let mut flushed = false;
        let mut resume: Option<(u32, Readable<Vec<u8>>)> = None;
        let mut finish_output = false;

        {
            let Some(entry) = self.registry.get_mut(key) else {
                return;
            };
            let gen = entry.gen;
            let EventKind::Stream(state) = &mut entry.kind else {
                return;
            };
            let fd = state.fd.raw();

            loop {
                if state.partial_off == state.partial.len() {
                    state.partial.clear();
                    state.partial_off = 0;
                    flushed = true;
                    break;
                }
                match sys::write(fd, &state.partial[state.partial_off..]) {
                    Ok(Some(n)) => state.partial_off += n,
                    Ok(None) => break,
                    Err(err) => {
                        close_reason = Some(Some(Rejection::from(Error::Io(err))));
                        break;
                    }
                }
            }

            if flushed {
                if let Some(pump) = state.parked_pump.take() {
                    resume = Some((gen, pump));
                }
                if state.out_done {
                    finish_output = true;
                }
            }
        }

        if let Some(reason) = close_reason {
            self.close_entry(key, reason);
            return;
        }

        if flushed {
            let _ = self.remove_interest(key, Interest::WRITABLE);
            if let Some((gen, pump)) = resume {
                pump_stream(self.shared.clone(), key, gen, pump);
            }
            if finish_output {
                self.finish_output(key);
            }
        }
    }

    /// The user's writer closed; once the partial buffer drains, shut the
    /// write side down (and the whole handle, when reading ended too).
    pub(crate) fn stream_output_closed(&mut self, key: usize, gen: u32) {
        let mut done_now = false;
        {
            let Some(entry) = self.registry.get_mut(key) else {
                return;
            };
            if entry.gen != gen {
                return;
            }
            let EventKind::Stream(state) = &mut entry.kind else {
                return;
            };
            state.out_done = true;
            if state.partial.is_empty() {
                done_now = true;
            }
        }

        self.shared.descriptors().update(
            self.registry.get(key).map(|e| e.mirror_key).unwrap_or(usize::MAX),
            |entry| entry.closing = true,
        );

        if done_now {
            self.finish_output(key);
        }
    }

    fn finish_output(&mut self, key: usize) {
        let mut close_now = false;
        {
            let Some(entry) = self.registry.get_mut(key) else {
                return;
            };
            let EventKind::Stream(state) = &mut entry.kind else {
                return;
            };
            if state.read_dead {
                close_now = true;
            } else {
                let _ = sys::shutdown_write(state.fd.raw());
            }
        }
        if close_now {
            self.close_entry(key, None);
        } else {
            let _ = self.remove_interest(key, Interest::WRITABLE);
        }
    }

    // --- Listener ---

    pub(crate) fn create_listener(
        &mut self,
        port: u16,
        bind_to: IpAddr,
        deferred: Deferred<(ServerSocket,)>,
    ) {
        let result = self.try_create_listener(port, bind_to);
        match result {
            Ok(server) => deferred.resolve((server,)),
            Err(err) => deferred.reject(Error::Io(err)),
        }
    }

    fn try_create_listener(&mut self, port: u16, bind_to: IpAddr) -> io::Result<ServerSocket> {
        let fd = sys::tcp_socket(bind_to.is_ipv6())?;
        sys::set_reuseaddr(fd.raw())?;
        sys::bind(fd.raw(), &SocketAddr::new(bind_to, port))?;
        sys::listen(fd.raw(), LISTEN_BACKLOG)?;
        let local_addr = sys::local_addr(fd.raw())?;

        let user_queue = self.shared.user_queue().clone();
        let (incoming_writable, incoming_readable) =
            Channel::with_watermarks(&user_queue, ACCEPT_HIGH_WATER, ACCEPT_LOW_WATER).split();

        let raw = fd.raw();
        let mirror_key = self.shared.descriptors().insert("server_socket", Some(raw));
        let state = ListenerState {
            fd,
            incoming: incoming_writable,
        };
        let (key, gen) = self.insert_entry(EventKind::Listener(state), Some(raw), mirror_key);

        if let Err(err) = self.update_interest(key, Interest::READABLE) {
            self.take_entry(key);
            return Err(err);
        }

        let ctl = HandleCtl::new(self.shared.clone(), key, gen);
        Ok(ServerSocket::new(incoming_readable, ctl, local_addr))
    }

    fn listener_readable(&mut self, key: usize) {
        let (fd, gen) = match self.registry.get(key) {
            Some(entry) => match (&entry.kind, entry.fd) {
                (EventKind::Listener(_), Some(fd)) => (fd, entry.gen),
                _ => return,
            },
            None => return,
        };

        for _ in 0..MAX_OPS_PER_EVENT {
            match sys::accept(fd) {
                Ok(Some((accepted, peer))) => {
                    let socket = match self.finalize_stream(accepted, peer) {
                        Ok(socket) => socket,
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to set up accepted connection");
                            continue;
                        }
                    };

                    let write_result = match self.registry.get(key) {
                        Some(entry) => match &entry.kind {
                            EventKind::Listener(state) => state.incoming.write(socket),
                            _ => return,
                        },
                        None => return,
                    };

                    match write_result {
                        Ok(true) => continue,
                        Ok(false) => {
                            self.pause_accept(key, gen);
                            return;
                        }
                        Err(_) => {
                            // Consumer dropped the server socket's channel.
                            self.close_entry(key, None);
                            return;
                        }
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    match err.raw_os_error() {
                        // Transient pressure; try again on the next event.
                        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ECONNABORTED) => {
                            tracing::warn!(error = %err, "accept failed transiently");
                            return;
                        }
                        _ => {
                            self.close_entry(key, Some(Rejection::from(Error::Io(err))));
                            return;
                        }
                    }
                }
            }
        }
    }

    fn pause_accept(&mut self, key: usize, gen: u32) {
        let _ = self.remove_interest(key, Interest::READABLE);
        let writable = match self.registry.get(key) {
            Some(entry) => match &entry.kind {
                EventKind::Listener(state) => state.incoming.clone(),
                _ => return,
            },
            None => return,
        };

        let shared = self.shared.clone();
        writable.set_resume_notification(
            move || {
                let _ = shared.internal_queue().post(move || {
                    with_core_mut(|core| {
                        let _ = core.add_interest_checked(key, gen, Interest::READABLE);
                    });
                });
            },
            true,
        );
    }

    fn add_interest_checked(&mut self, key: usize, gen: u32, add: Interest) -> io::Result<()> {
        match self.registry.get(key) {
            Some(entry) if entry.gen == gen => self.add_interest(key, add),
            _ => Ok(()),
        }
    }

    // --- UDP ---

    pub(crate) fn create_udp(
        &mut self,
        port: u16,
        options: UdpReceiveOptions,
        deferred: Deferred<(UdpReceiver,)>,
    ) {
        match self.try_create_udp(port, options) {
            Ok(receiver) => deferred.resolve((receiver,)),
            Err(err) => deferred.reject(Error::Io(err)),
        }
    }

    fn try_create_udp(&mut self, port: u16, options: UdpReceiveOptions) -> io::Result<UdpReceiver> {
        let v6 = options.bind_to.is_ipv6();
        let fd = sys::udp_socket(v6)?;
        if options.flags.contains(UdpBind::REUSEADDR) {
            sys::set_reuseaddr(fd.raw())?;
        }
        if v6 && options.flags.contains(UdpBind::IPV6_ONLY) {
            sys::set_ipv6_only(fd.raw())?;
        }
        sys::bind(fd.raw(), &SocketAddr::new(options.bind_to, port))?;
        let local_addr = sys::local_addr(fd.raw())?;

        let user_queue = self.shared.user_queue().clone();
        let infinite = options.backlog.is_none();
        let channel = match options.backlog {
            Some(backlog) => Channel::new(&user_queue, backlog),
            None => Channel::unbounded(&user_queue),
        };
        let (packets_writable, packets_readable) = channel.split();

        let raw = fd.raw();
        let mirror_key = self.shared.descriptors().insert("udp_receiver", Some(raw));
        let state = UdpState {
            fd,
            packets: packets_writable,
            infinite,
        };
        let (key, gen) = self.insert_entry(EventKind::Udp(state), Some(raw), mirror_key);

        if let Err(err) = self.update_interest(key, Interest::READABLE) {
            self.take_entry(key);
            return Err(err);
        }

        let ctl = HandleCtl::new(self.shared.clone(), key, gen);
        Ok(UdpReceiver::new(packets_readable, ctl, local_addr))
    }

    fn udp_readable(&mut self, key: usize) {
        enum AfterRecv {
            Nothing,
            Pause,
            Close,
        }
        let mut after = AfterRecv::Nothing;
        let mut resume_ctx: Option<(u32, Writable<UdpPacket>)> = None;

        {
            let Some(entry) = self.registry.get_mut(key) else {
                return;
            };
            let gen = entry.gen;
            let EventKind::Udp(state) = &mut entry.kind else {
                return;
            };
            let fd = state.fd.raw();

            for _ in 0..MAX_OPS_PER_EVENT {
                let mut buf = vec![0u8; UDP_BUFFER_SIZE];
                let packet = match sys::recv_from(fd, &mut buf) {
                    Ok(Some((n, source))) => {
                        buf.truncate(n);
                        UdpPacket {
                            payload: Ok(buf),
                            source: source.unwrap_or_else(unspecified_source),
                            flags: 0,
                        }
                    }
                    Ok(None) => break,
                    Err(err) => UdpPacket {
                        payload: Err(Rejection::from(Error::Io(err))),
                        source: unspecified_source(),
                        flags: 0,
                    },
                };
                let errored = packet.payload.is_err();

                match state.packets.write(packet) {
                    Ok(_) => {
                        if !state.infinite && !state.packets.should_write() {
                            resume_ctx = Some((gen, state.packets.clone()));
                            after = AfterRecv::Pause;
                            break;
                        }
                    }
                    Err(_) => {
                        after = AfterRecv::Close;
                        break;
                    }
                }

                if errored {
                    // One failure report per event; let the loop breathe.
                    break;
                }
            }
        }

        match after {
            AfterRecv::Nothing => {}
            AfterRecv::Pause => {
                let _ = self.remove_interest(key, Interest::READABLE);
                if let Some((gen, writable)) = resume_ctx {
                    let shared = self.shared.clone();
                    writable.set_resume_notification(
                        move || {
                            let _ = shared.internal_queue().post(move || {
                                with_core_mut(|core| {
                                    let _ = core.add_interest_checked(
                                        key,
                                        gen,
                                        Interest::READABLE,
                                    );
                                });
                            });
                        },
                        true,
                    );
                }
            }
            AfterRecv::Close => self.close_entry(key, None),
        }
    }
}

/// Feeds blocks from the socket's outgoing channel to the OS, one block at a
/// time, entirely as a promise chain on the dispatcher's internal queue.
/// Channel back-pressure to the user falls out of the channel's own
/// watermarks.
pub(crate) fn pump_stream(
    shared: Arc<DispatcherShared>,
    key: usize,
    gen: u32,
    out_readable: Readable<Vec<u8>>,
) {
    let internal = shared.internal_queue().clone();
    let shared_next = shared.clone();

    out_readable
        .receive()
        .then_on(&internal, move |block: Vec<u8>| {
            let next = with_core_mut(|core| core.stream_send(key, gen, block));
            match next {
                PumpNext::Continue => pump_stream(shared_next, key, gen, out_readable),
                PumpNext::Parked => {
                    with_core_mut(|core| core.park_pump(key, gen, out_readable))
                }
                PumpNext::Gone => {}
            }
        })
        .fail(move |_rejection| {
            // The user's writer closed (or the handle is going away): flush
            // what is pending, then shut the write side down.
            with_core_mut(|core| core.stream_output_closed(key, gen));
            Ok(((),))
        })
        .detach();
}

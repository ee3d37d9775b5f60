use crate::error::Error;
use crate::io::dispatcher::{Dispatcher, DispatcherExit};
use crate::io::events::AttachedEvent;
use crate::io::poller::Interest;
use crate::io::tcp::TcpSocket;
use crate::io::udp::{UdpReceiveOptions, UdpReceiver};
use crate::runtime::TerminationMode;
use crate::test_utils::{settle_of, Rig, Tracker, SETTLE_TIMEOUT};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

struct IoRig {
    rig: Rig,
    dispatcher: Dispatcher,
}

impl IoRig {
    fn new() -> IoRig {
        let rig = Rig::new();
        let dispatcher = Dispatcher::new(&rig.queue, "rill-io test").unwrap();
        dispatcher.start().unwrap();
        IoRig { rig, dispatcher }
    }

    fn shutdown(self, mode: TerminationMode) -> DispatcherExit {
        self.dispatcher.terminate(mode);
        let exit = settle_of(self.dispatcher.await_termination())
            .expect("await_termination rejected")
            .0;
        self.rig.shutdown();
        exit
    }
}

fn read_exact_bytes(socket: &TcpSocket, n: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while out.len() < n {
        let (block,) = settle_of(socket.read()).expect("stream closed early");
        out.extend_from_slice(&block);
    }
    out
}

#[test]
fn backend_method_reports_epoll() {
    let io = IoRig::new();
    assert_eq!(io.dispatcher.backend_method(), "epoll");
    assert_eq!(io.shutdown(TerminationMode::Graceful), DispatcherExit::Normal);
}

#[test]
fn delay_resolves_after_the_duration() {
    let io = IoRig::new();

    let started = Instant::now();
    settle_of(io.dispatcher.delay(Duration::from_millis(50))).expect("delay rejected");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(45), "woke early: {elapsed:?}");

    assert_eq!(io.shutdown(TerminationMode::Graceful), DispatcherExit::Normal);
}

#[test]
fn delays_fire_in_deadline_order() {
    let io = IoRig::new();
    let tracker = Tracker::new();

    let (t_long, t_short) = (tracker.clone(), tracker.clone());
    let long = io.dispatcher.delay(Duration::from_millis(80)).then(move |_: ()| {
        t_long.expect_calls("short", 1);
        t_long.hit("long");
    });
    let short = io.dispatcher.delay(Duration::from_millis(20)).then(move |_: ()| {
        t_short.hit("short");
    });

    settle_of(short).unwrap();
    settle_of(long).unwrap();
    tracker.expect_calls("long", 1);

    assert_eq!(io.shutdown(TerminationMode::Graceful), DispatcherExit::Normal);
}

#[test]
fn tcp_round_trip_and_graceful_termination() {
    let io = IoRig::new();

    let (server,) = settle_of(io.dispatcher.listen(0, LOCALHOST)).expect("listen failed");
    let port = server.local_addr().port();

    let accept = server.accept();
    let (client,) =
        settle_of(io.dispatcher.connect_to(vec![LOCALHOST], port)).expect("connect failed");
    let (peer,) = settle_of(accept).expect("accept failed");

    // Client to server.
    assert!(client.write(b"ping".to_vec()).unwrap());
    assert_eq!(read_exact_bytes(&peer, 4), b"ping");

    // Server to client, proving both directions flow.
    assert!(peer.write(b"pong!".to_vec()).unwrap());
    assert_eq!(read_exact_bytes(&client, 5), b"pong!");

    // In-flight write, then everything dropped before terminate: graceful
    // shutdown must still flush and close cleanly.
    client.write(b"bye".to_vec()).unwrap();
    assert_eq!(read_exact_bytes(&peer, 3), b"bye");

    drop(client);
    drop(peer);
    drop(server);

    assert_eq!(io.shutdown(TerminationMode::Graceful), DispatcherExit::Normal);
}

#[test]
fn peer_close_surfaces_as_channel_close() {
    let io = IoRig::new();

    let (server,) = settle_of(io.dispatcher.listen(0, LOCALHOST)).expect("listen failed");
    let accept = server.accept();
    let (client,) = settle_of(io.dispatcher.connect_to(vec![LOCALHOST], server.local_addr().port()))
        .expect("connect failed");
    let (peer,) = settle_of(accept).expect("accept failed");

    drop(client);

    // The peer eventually observes EOF as a channel close.
    let rejection = loop {
        match settle_of(peer.read()) {
            Ok(_) => continue,
            Err(rejection) => break rejection,
        }
    };
    assert!(matches!(
        rejection.downcast_ref::<Error>(),
        Some(Error::ChannelClosed)
    ));

    drop(peer);
    drop(server);
    assert_eq!(io.shutdown(TerminationMode::Graceful), DispatcherExit::Normal);
}

#[test]
fn connect_to_a_dead_port_rejects_with_io_error() {
    let io = IoRig::new();

    // Grab a port the OS just released; nothing listens there.
    let dead_port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let rejection = settle_of(io.dispatcher.connect_to(vec![LOCALHOST], dead_port))
        .expect_err("nothing is listening");
    assert!(matches!(
        rejection.downcast_ref::<Error>(),
        Some(Error::Io(_))
    ));

    assert_eq!(io.shutdown(TerminationMode::Graceful), DispatcherExit::Normal);
}

#[test]
fn connect_with_no_addresses_rejects() {
    let io = IoRig::new();

    let rejection =
        settle_of(io.dispatcher.connect_to(Vec::new(), 4242)).expect_err("no addresses given");
    assert!(rejection.is::<Error>());

    assert_eq!(io.shutdown(TerminationMode::Graceful), DispatcherExit::Normal);
}

#[test]
fn udp_backpressure_delivers_every_packet() {
    let io = IoRig::new();

    let options = UdpReceiveOptions {
        bind_to: LOCALHOST,
        backlog: Some(2),
        ..Default::default()
    };
    let (receiver,): (UdpReceiver,) =
        settle_of(io.dispatcher.udp_receive(0, options)).expect("udp bind failed");
    let target = receiver.local_addr();

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let payloads: Vec<Vec<u8>> = (0u8..5).map(|i| vec![i; 32]).collect();
    for payload in &payloads {
        sender.send_to(payload, target).unwrap();
    }

    // Give the dispatcher time to fill the channel and pause OS reads; the
    // remaining datagrams wait in the socket buffer, not on the floor.
    std::thread::sleep(Duration::from_millis(100));

    let mut received: Vec<Vec<u8>> = (0..5)
        .map(|_| {
            let (packet,) = settle_of(receiver.receive()).expect("receiver closed early");
            packet.payload.expect("packet carried an error")
        })
        .collect();
    received.sort();

    let mut expected = payloads.clone();
    expected.sort();
    assert_eq!(received, expected, "no packet may be dropped by the receiver");

    drop(receiver);
    assert_eq!(io.shutdown(TerminationMode::Graceful), DispatcherExit::Normal);
}

#[test]
fn udp_close_is_idempotent() {
    let io = IoRig::new();

    let options = UdpReceiveOptions {
        bind_to: LOCALHOST,
        backlog: Some(4),
        ..Default::default()
    };
    let (receiver,) = settle_of(io.dispatcher.udp_receive(0, options)).expect("udp bind failed");

    receiver.close();
    receiver.close();

    let rejection = settle_of(receiver.receive()).expect_err("closed receiver");
    assert!(matches!(
        rejection.downcast_ref::<Error>(),
        Some(Error::ChannelClosed)
    ));

    drop(receiver);
    assert_eq!(io.shutdown(TerminationMode::Graceful), DispatcherExit::Normal);
}

#[test]
fn detach_then_drop_equals_close() {
    let io = IoRig::new();

    let options = UdpReceiveOptions {
        bind_to: LOCALHOST,
        backlog: Some(4),
        ..Default::default()
    };
    let (receiver,) = settle_of(io.dispatcher.udp_receive(0, options)).expect("udp bind failed");
    receiver.detach();

    // The handle is gone, so graceful termination completes.
    assert_eq!(io.shutdown(TerminationMode::Graceful), DispatcherExit::Normal);
}

#[test]
fn immediate_termination_cancels_pending_io() {
    let io = IoRig::new();

    let (server,) = settle_of(io.dispatcher.listen(0, LOCALHOST)).expect("listen failed");
    let long_delay = io.dispatcher.delay(Duration::from_secs(300));

    io.dispatcher.terminate(TerminationMode::Immediate);

    let rejection = settle_of(long_delay).expect_err("delay must be canceled");
    assert!(matches!(
        rejection.downcast_ref::<Error>(),
        Some(Error::Canceled)
    ));

    let exit = settle_of(io.dispatcher.await_termination()).unwrap().0;
    assert_eq!(exit, DispatcherExit::Forced);

    drop(server);
    io.rig.shutdown();
}

#[test]
fn factories_reject_after_terminate() {
    let io = IoRig::new();
    io.dispatcher.terminate(TerminationMode::Graceful);

    let rejection = settle_of(io.dispatcher.delay(Duration::from_millis(1)))
        .expect_err("draining dispatcher accepts no new work");
    assert!(matches!(
        rejection.downcast_ref::<Error>(),
        Some(Error::Canceled)
    ));

    let exit = settle_of(io.dispatcher.await_termination()).unwrap().0;
    assert_eq!(exit, DispatcherExit::Normal);
    io.rig.shutdown();
}

#[test]
fn dump_events_reflects_registered_handles() {
    let io = IoRig::new();

    let (server,) = settle_of(io.dispatcher.listen(0, LOCALHOST)).expect("listen failed");

    let events = io.dispatcher.dump_events();
    let kinds: Vec<&str> = events.iter().map(|event| event.kind.as_str()).collect();
    assert!(kinds.contains(&"dummy"));
    assert!(kinds.contains(&"server_socket"));

    let json: serde_json::Value = serde_json::from_str(&io.dispatcher.dump_events_json()).unwrap();
    let entries = json.as_array().unwrap();
    assert_eq!(entries.len(), events.len());
    for entry in entries {
        for key in ["handle", "type", "active", "closing", "fd", "fd_err"] {
            assert!(entry.get(key).is_some(), "missing key {key}");
        }
    }

    drop(server);
    assert_eq!(io.shutdown(TerminationMode::Graceful), DispatcherExit::Normal);
}

#[test]
fn lookup_resolves_localhost() {
    let io = IoRig::new();

    let (response,) = settle_of(io.dispatcher.lookup("localhost")).expect("lookup failed");
    assert!(
        response.addresses.iter().any(|ip| ip.is_loopback()),
        "unexpected addresses: {:?}",
        response.addresses
    );

    assert_eq!(io.shutdown(TerminationMode::Graceful), DispatcherExit::Normal);
}

#[test]
fn lookup_of_invalid_name_rejects_with_dns_error() {
    let io = IoRig::new();

    let rejection = settle_of(io.dispatcher.lookup("name.invalid."))
        .expect_err("reserved invalid TLD must not resolve");
    assert!(matches!(
        rejection.downcast_ref::<Error>(),
        Some(Error::DnsLookup(_))
    ));

    assert_eq!(io.shutdown(TerminationMode::Graceful), DispatcherExit::Normal);
}

struct PipeEvent {
    fd: OwnedFd,
    tracker: Tracker,
}

impl AttachedEvent for PipeEvent {
    fn kind(&self) -> &'static str {
        "pipe"
    }

    fn fd(&self) -> Option<RawFd> {
        Some(self.fd.as_raw_fd())
    }

    fn interest(&self) -> Interest {
        Interest::READABLE
    }

    fn on_ready(&mut self, readable: bool, _writable: bool) {
        if readable {
            let mut buf = [0u8; 16];
            let _ = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            self.tracker.hit("ready");
        }
    }

    fn on_close(&mut self) {
        self.tracker.hit("closed");
    }
}

#[test]
fn attached_event_fires_and_closes_with_the_dispatcher() {
    let io = IoRig::new();
    let tracker = Tracker::new();

    let (rx, tx) = nix::unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK).unwrap();
    io.dispatcher.attach_event(Box::new(PipeEvent {
        fd: rx,
        tracker: tracker.clone(),
    }));

    let buf = [9u8];
    let written = unsafe { libc::write(tx.as_raw_fd(), buf.as_ptr() as *const libc::c_void, 1) };
    assert_eq!(written, 1);

    let deadline = Instant::now() + SETTLE_TIMEOUT;
    while tracker.count("ready") == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(tracker.count("ready") >= 1, "attached event never fired");

    assert_eq!(io.shutdown(TerminationMode::Immediate), DispatcherExit::Forced);
    tracker.expect_calls("closed", 1);
}

#[test]
fn start_blocking_returns_on_terminate() {
    let rig = Rig::new();
    let dispatcher = Dispatcher::new(&rig.queue, "rill-io blocking test").unwrap();

    let handle = {
        let dispatcher = dispatcher.clone();
        std::thread::spawn(move || dispatcher.start_blocking().unwrap())
    };

    settle_of(dispatcher.delay(Duration::from_millis(20))).unwrap();
    dispatcher.terminate(TerminationMode::Graceful);

    let exit = handle.join().unwrap();
    assert_eq!(exit, DispatcherExit::Normal);
    rig.shutdown();
}

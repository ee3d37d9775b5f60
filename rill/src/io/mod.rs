//! The I/O side of the runtime: an event dispatcher multiplexing OS-level
//! sockets, DNS and timers onto queues, with handles surfacing as promises
//! and back-pressured channels.

// Public API
pub mod dispatcher;
pub use dispatcher::{Dispatcher, DispatcherExit};

pub mod events;
pub use events::{AttachedEvent, EventDescriptor};

pub mod poller;

pub mod resolver;
pub use resolver::{Resolver, ResolverResponse};

pub mod tcp;
pub use tcp::{ServerSocket, TcpSocket};

pub mod udp;
pub use udp::{UdpBind, UdpPacket, UdpReceiveOptions, UdpReceiver};

// Exports
pub(crate) mod context;
pub(crate) mod core;
pub(crate) mod sys;
pub(crate) mod timer;

#[cfg(all(test, target_os = "linux"))]
mod tests;

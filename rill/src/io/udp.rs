use crate::channel::Readable;
use crate::error::Rejection;
use crate::io::dispatcher::HandleCtl;
use crate::promise::Promise;
use bitflags::bitflags;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

bitflags! {
    /// Socket options applied before binding the UDP receiver.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UdpBind: u8 {
        const IPV6_ONLY = 1 << 0;
        const REUSEADDR = 1 << 1;
    }
}

/// Configuration for [`crate::io::Dispatcher::udp_receive`].
#[derive(Debug, Clone)]
pub struct UdpReceiveOptions {
    /// Interface to bind; defaults to `0.0.0.0`.
    pub bind_to: IpAddr,
    pub flags: UdpBind,
    /// Channel high-water mark, in packets. `None` means unbounded: the
    /// receiver then never pauses OS reads.
    pub backlog: Option<usize>,
}

impl Default for UdpReceiveOptions {
    fn default() -> Self {
        UdpReceiveOptions {
            bind_to: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            flags: UdpBind::empty(),
            backlog: None,
        }
    }
}

/// One received datagram, or a transport-level failure.
pub struct UdpPacket {
    /// The payload, or the error the OS reported for this receive.
    pub payload: Result<Vec<u8>, Rejection>,
    pub source: SocketAddr,
    pub flags: u32,
}

impl fmt::Debug for UdpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpPacket")
            .field("len", &self.payload.as_ref().map(Vec::len).unwrap_or(0))
            .field("source", &self.source)
            .field("flags", &self.flags)
            .finish()
    }
}

/// A bound UDP socket delivering datagrams through a back-pressured channel.
///
/// With a finite backlog, the receiver stops reading from the OS once the
/// channel hits its high-water mark, and a one-shot resume notification
/// restarts it when the consumer drains below low-water. The receiver
/// itself never drops a packet while the channel has capacity.
pub struct UdpReceiver {
    packets: Readable<UdpPacket>,
    ctl: HandleCtl,
    local_addr: SocketAddr,
}

impl UdpReceiver {
    pub(crate) fn new(
        packets: Readable<UdpPacket>,
        ctl: HandleCtl,
        local_addr: SocketAddr,
    ) -> Self {
        UdpReceiver {
            packets,
            ctl,
            local_addr,
        }
    }

    pub fn packets(&self) -> &Readable<UdpPacket> {
        &self.packets
    }

    /// Next datagram.
    pub fn receive(&self) -> Promise<(UdpPacket,)> {
        self.packets.receive()
    }

    /// The bound address; useful after binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Closes the receiver and releases the OS handle on the dispatcher
    /// thread. Idempotent.
    pub fn close(&self) {
        self.ctl.request_close(None);
    }

    /// Severs the packet channel and closes. Equivalent to
    /// [`UdpReceiver::close`] followed by dropping the receiver.
    pub fn detach(self) {
        self.ctl.request_close(None);
    }
}

impl Drop for UdpReceiver {
    fn drop(&mut self) {
        self.ctl.request_close(None);
    }
}

impl fmt::Debug for UdpReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpReceiver")
            .field("local_addr", &self.local_addr)
            .field("closed", &self.ctl.is_closed())
            .finish()
    }
}

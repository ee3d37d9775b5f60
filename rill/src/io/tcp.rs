use crate::channel::{Readable, Writable};
use crate::io::dispatcher::HandleCtl;
use crate::promise::Promise;
use std::fmt;
use std::net::SocketAddr;

/// A connected TCP stream presented as a pair of back-pressured byte
/// channels.
///
/// Incoming bytes arrive on the readable end (bound to the dispatcher's user
/// queue); blocks written to the writable end are flushed to the peer by the
/// dispatcher. When the incoming channel stops accepting, the dispatcher
/// drops read interest until the consumer drains it; partial sends register
/// write interest until flushed.
///
/// Dropping the socket closes it gracefully: in-flight writes are flushed
/// first. [`TcpSocket::close`] tears both directions down right away.
pub struct TcpSocket {
    input: Readable<Vec<u8>>,
    output: Writable<Vec<u8>>,
    ctl: HandleCtl,
    peer: Option<SocketAddr>,
}

impl TcpSocket {
    pub(crate) fn new(
        input: Readable<Vec<u8>>,
        output: Writable<Vec<u8>>,
        ctl: HandleCtl,
        peer: Option<SocketAddr>,
    ) -> Self {
        TcpSocket {
            input,
            output,
            ctl,
            peer,
        }
    }

    /// The stream of incoming byte blocks. Rejects with
    /// [`crate::error::Error::ChannelClosed`] once the peer closed and the
    /// buffer drained.
    pub fn input(&self) -> &Readable<Vec<u8>> {
        &self.input
    }

    /// The outgoing byte sink.
    pub fn output(&self) -> &Writable<Vec<u8>> {
        &self.output
    }

    /// Next incoming block, shorthand for `input().receive()`.
    pub fn read(&self) -> Promise<(Vec<u8>,)> {
        self.input.receive()
    }

    /// Queues a block for sending; the returned flag signals back-pressure
    /// exactly like [`Writable::write`].
    pub fn write(&self, block: Vec<u8>) -> Result<bool, crate::error::Error> {
        self.output.write(block)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Closes both directions now. Pending reads observe the close; pending
    /// writes reject. Idempotent.
    pub fn close(&self) {
        self.ctl.request_close(None);
    }

    /// Severs the channel ends and closes the handle. Equivalent to
    /// [`TcpSocket::close`] followed by dropping the socket.
    pub fn detach(self) {
        self.ctl.request_close(None);
    }
}

impl fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpSocket")
            .field("peer", &self.peer)
            .field("closed", &self.ctl.is_closed())
            .finish()
    }
}

/// A listening socket delivering accepted connections through a readable
/// channel of [`TcpSocket`]s. Accepting pauses while the channel is above
/// its high-water mark.
pub struct ServerSocket {
    incoming: Readable<TcpSocket>,
    ctl: HandleCtl,
    local_addr: SocketAddr,
}

impl ServerSocket {
    pub(crate) fn new(
        incoming: Readable<TcpSocket>,
        ctl: HandleCtl,
        local_addr: SocketAddr,
    ) -> Self {
        ServerSocket {
            incoming,
            ctl,
            local_addr,
        }
    }

    pub fn incoming(&self) -> &Readable<TcpSocket> {
        &self.incoming
    }

    /// Next accepted connection.
    pub fn accept(&self) -> Promise<(TcpSocket,)> {
        self.incoming.receive()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn close(&self) {
        self.ctl.request_close(None);
    }
}

impl Drop for ServerSocket {
    fn drop(&mut self) {
        self.ctl.request_close(None);
    }
}

impl fmt::Debug for ServerSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSocket")
            .field("local_addr", &self.local_addr)
            .field("closed", &self.ctl.is_closed())
            .finish()
    }
}

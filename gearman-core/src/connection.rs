//! Connection collaborator.
//!
//! The context never touches sockets itself: it asks each [`Connection`] for
//! its descriptor and the readiness it wants, polls, and calls back into the
//! connection to move bytes. [`StreamConnection`] is the stock implementation
//! over any non-blocking stream socket.

use crate::alloc::WorkloadAllocator;
use crate::buffer::OutboundQueue;
use crate::error::{GearmanError, Result};
use crate::packet::{self, Packet};
use bitflags::bitflags;
use bytes::BytesMut;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use tracing::{debug, trace};

bitflags! {
    /// Readiness a connection asks the poll engine to watch for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Interest: u8 {
        const READABLE = 0b01;
        const WRITABLE = 0b10;
    }
}

bitflags! {
    /// Readiness reported by the last poll cycle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Readiness: u8 {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        const ERROR = 0b0100;
        const HANGUP = 0b1000;
    }
}

impl Interest {
    pub(crate) fn to_poll_events(self) -> libc::c_short {
        let mut events = 0;
        if self.contains(Self::READABLE) {
            events |= libc::POLLIN;
        }
        if self.contains(Self::WRITABLE) {
            events |= libc::POLLOUT;
        }
        events
    }
}

impl Readiness {
    pub(crate) fn from_poll_revents(revents: libc::c_short) -> Self {
        let mut readiness = Self::empty();
        readiness.set(Self::READABLE, revents & libc::POLLIN != 0);
        readiness.set(Self::WRITABLE, revents & libc::POLLOUT != 0);
        readiness.set(Self::ERROR, revents & (libc::POLLERR | libc::POLLNVAL) != 0);
        readiness.set(Self::HANGUP, revents & libc::POLLHUP != 0);
        readiness
    }
}

/// Outcome of an I/O step that may not complete immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress<T> {
    Ready(T),
    WouldBlock,
}

impl<T> Progress<T> {
    #[must_use]
    pub const fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(value) => Some(value),
            Self::WouldBlock => None,
        }
    }
}

/// A network endpoint owned by a context.
///
/// Implementations must never block: every method either completes or
/// reports `Progress::WouldBlock`.
pub trait Connection: Send {
    /// Descriptor to poll, `None` once closed.
    fn fd(&self) -> Option<RawFd>;

    /// Readiness this connection currently needs to make progress.
    fn wants(&self) -> Interest;

    /// Queue a packet for sending. Does not write to the socket.
    fn send(&mut self, packet: &Packet) -> Result<()>;

    /// Write as much queued data as the socket accepts.
    fn flush(&mut self) -> Result<Progress<()>>;

    fn has_pending_send(&self) -> bool;

    /// Read and decode the next packet. Packets come out in arrival order.
    fn receive(&mut self, alloc: &WorkloadAllocator) -> Result<Progress<Packet>>;

    fn close(&mut self);

    fn is_closed(&self) -> bool {
        self.fd().is_none()
    }

    /// Human-readable peer name for logs and errors.
    fn peer(&self) -> String {
        "unknown".to_string()
    }
}

/// Default read chunk size.
pub const READ_BUFFER_SIZE: usize = 8192;

/// [`Connection`] over a non-blocking byte stream.
pub struct StreamConnection<S> {
    stream: Option<S>,
    peer: String,
    outbound: OutboundQueue,
    inbound: BytesMut,
    read_size: usize,
}

impl StreamConnection<TcpStream> {
    /// Adopt a connected TCP stream, switching it to non-blocking mode.
    pub fn tcp(stream: TcpStream) -> Result<Self> {
        stream
            .set_nonblocking(true)
            .map_err(|e| GearmanError::io("set_nonblocking", e))?;
        crate::tcp::enable_tcp_nodelay(&stream).map_err(|e| GearmanError::io("setsockopt", e))?;
        let peer = stream
            .peer_addr()
            .map_or_else(|_| "tcp://?".to_string(), |addr| format!("tcp://{addr}"));
        Ok(Self::new(stream, peer))
    }
}

impl StreamConnection<UnixStream> {
    /// Adopt a connected Unix stream, switching it to non-blocking mode.
    pub fn unix(stream: UnixStream) -> Result<Self> {
        stream
            .set_nonblocking(true)
            .map_err(|e| GearmanError::io("set_nonblocking", e))?;
        let peer = stream
            .peer_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(|p| format!("unix://{}", p.display())))
            .unwrap_or_else(|| "unix://(unnamed)".to_string());
        Ok(Self::new(stream, peer))
    }
}

impl<S> StreamConnection<S>
where
    S: Read + Write + AsRawFd + Send,
{
    /// Wrap a stream that is already in non-blocking mode.
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream: Some(stream),
            peer: peer.into(),
            outbound: OutboundQueue::new(),
            inbound: BytesMut::with_capacity(READ_BUFFER_SIZE),
            read_size: READ_BUFFER_SIZE,
        }
    }

    #[must_use]
    pub fn with_read_size(mut self, size: usize) -> Self {
        self.read_size = size.max(packet::HEADER_SIZE);
        self
    }

    /// Bytes queued but not yet written.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.outbound.len()
    }

    fn fail(&mut self, error: GearmanError) -> GearmanError {
        if error.is_connection_error() {
            self.close();
        }
        error
    }
}

impl<S> Connection for StreamConnection<S>
where
    S: Read + Write + AsRawFd + Send,
{
    fn fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn wants(&self) -> Interest {
        if self.stream.is_none() {
            return Interest::empty();
        }
        if self.outbound.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    fn send(&mut self, packet: &Packet) -> Result<()> {
        if self.stream.is_none() {
            return Err(GearmanError::lost_connection(self.peer.clone()));
        }
        let wire = packet.encode()?;
        trace!(peer = %self.peer, command = %packet.command(), bytes = wire.len(), "queued packet");
        self.outbound.push(wire);
        Ok(())
    }

    fn flush(&mut self) -> Result<Progress<()>> {
        while !self.outbound.is_empty() {
            let Some(stream) = self.stream.as_mut() else {
                return Err(GearmanError::lost_connection(self.peer.clone()));
            };
            match self.outbound.write_to(stream) {
                Ok(0) => {
                    let err = GearmanError::lost_connection(self.peer.clone());
                    return Err(self.fail(err));
                }
                Ok(n) => trace!(peer = %self.peer, bytes = n, "flushed"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Progress::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let err = GearmanError::io("send", e);
                    return Err(self.fail(err));
                }
            }
        }
        Ok(Progress::Ready(()))
    }

    fn has_pending_send(&self) -> bool {
        !self.outbound.is_empty()
    }

    fn receive(&mut self, alloc: &WorkloadAllocator) -> Result<Progress<Packet>> {
        loop {
            if let Some(packet) = packet::decode(&mut self.inbound, alloc)? {
                trace!(peer = %self.peer, command = %packet.command(), "received packet");
                return Ok(Progress::Ready(packet));
            }

            let read_size = self.read_size;
            let start = self.inbound.len();
            self.inbound.resize(start + read_size, 0);
            let Some(stream) = self.stream.as_mut() else {
                self.inbound.truncate(start);
                return Err(GearmanError::lost_connection(self.peer.clone()));
            };
            match stream.read(&mut self.inbound[start..]) {
                Ok(0) => {
                    self.inbound.truncate(start);
                    debug!(peer = %self.peer, "peer closed connection");
                    let err = GearmanError::lost_connection(self.peer.clone());
                    return Err(self.fail(err));
                }
                Ok(n) => self.inbound.truncate(start + n),
                Err(e) => {
                    self.inbound.truncate(start);
                    match e.kind() {
                        io::ErrorKind::WouldBlock => return Ok(Progress::WouldBlock),
                        io::ErrorKind::Interrupted => continue,
                        _ => {
                            let err = GearmanError::io("recv", e);
                            return Err(self.fail(err));
                        }
                    }
                }
            }
        }
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(peer = %self.peer, "connection closed");
        }
        self.outbound.clear();
        self.inbound.clear();
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

impl<S> fmt::Debug for StreamConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConnection")
            .field("peer", &self.peer)
            .field("open", &self.stream.is_some())
            .field("pending", &self.outbound.len())
            .field("buffered", &self.inbound.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Command, Magic};
    use bytes::Bytes;

    fn pair() -> (StreamConnection<UnixStream>, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        (StreamConnection::unix(ours).unwrap(), theirs)
    }

    #[test]
    fn test_interest_follows_outbound_queue() {
        let (mut con, _peer) = pair();
        assert_eq!(con.wants(), Interest::READABLE);
        con.send(&Packet::echo_request(Bytes::from_static(b"x"))).unwrap();
        assert_eq!(con.wants(), Interest::READABLE | Interest::WRITABLE);
        assert!(con.flush().unwrap() == Progress::Ready(()));
        assert_eq!(con.wants(), Interest::READABLE);
    }

    #[test]
    fn test_receive_would_block_then_packet() {
        let (mut con, mut peer) = pair();
        let alloc = WorkloadAllocator::new();
        assert!(con.receive(&alloc).unwrap().is_would_block());

        let reply = Packet::new(Magic::Response, Command::EchoRes).with_data(Bytes::from_static(b"pong"));
        peer.write_all(&reply.encode().unwrap()).unwrap();
        let packet = con.receive(&alloc).unwrap().ready().unwrap();
        assert_eq!(packet, reply);
    }

    #[test]
    fn test_peer_close_is_lost_connection() {
        let (mut con, peer) = pair();
        drop(peer);
        let err = con.receive(&WorkloadAllocator::new()).unwrap_err();
        assert!(matches!(err, GearmanError::LostConnection(_)));
        assert!(con.is_closed());
        assert_eq!(con.wants(), Interest::empty());
    }

    #[test]
    fn test_send_after_close_fails() {
        let (mut con, _peer) = pair();
        con.close();
        assert!(con.send(&Packet::echo_request(Bytes::new())).is_err());
    }

    #[test]
    fn test_poll_event_mapping() {
        let events = (Interest::READABLE | Interest::WRITABLE).to_poll_events();
        assert_eq!(events, libc::POLLIN | libc::POLLOUT);
        let readiness = Readiness::from_poll_revents(libc::POLLIN | libc::POLLHUP);
        assert_eq!(readiness, Readiness::READABLE | Readiness::HANGUP);
    }
}

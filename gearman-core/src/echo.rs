//! Liveness check across every connection of a context.

use crate::connection::Progress;
use crate::context::Context;
use crate::error::{GearmanError, Result};
use crate::log::Verbose;
use crate::packet::{Command, Packet};
use crate::poll::Deadline;
use crate::registry::ConnectionId;
use bytes::Bytes;

impl Context {
    /// Send `ECHO_REQ` with `payload` to every connection and check that each
    /// replies with an identical `ECHO_RES`.
    ///
    /// Every connection is checked even after one fails; the first failure in
    /// registry order is the one returned and left in
    /// [`last_error`](Context::last_error). Each connection gets at most
    /// [`timeout`](Context::timeout) to answer, and only that connection is
    /// polled while it is checked, so ready flags seen by
    /// [`ready`](Context::ready) are left alone. The caller's non-blocking
    /// mode is restored before returning.
    pub fn echo(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        let request = Packet::echo_request(payload.clone());

        self.push_non_blocking();
        let mut first_failure = None;
        for id in self.connection_ids() {
            match self.echo_one(id, &request, &payload) {
                Ok(()) => self.log(Verbose::Debug, format_args!("echo ok on {id}")),
                Err(e) => {
                    self.log(Verbose::Info, format_args!("echo failed on {id}: {e}"));
                    first_failure.get_or_insert(e);
                }
            }
        }
        self.pop_non_blocking();

        match first_failure {
            None => Ok(()),
            Some(e) => {
                self.set_error("echo", &e);
                Err(e)
            }
        }
    }

    fn echo_one(&mut self, id: ConnectionId, request: &Packet, payload: &Bytes) -> Result<()> {
        let deadline = Deadline::after_millis(self.timeout());
        // Would-block here just leaves the request queued; wait_on flushes it.
        self.send(id, request)?;

        let reply = loop {
            match self.receive(id)? {
                Progress::Ready(packet) => break packet,
                Progress::WouldBlock => self.wait_on("echo", id, deadline)?,
            }
        };

        if reply.command() != Command::EchoRes {
            return Err(GearmanError::UnexpectedPacket {
                expected: Command::EchoRes.name(),
                got: reply.command().name(),
            });
        }
        if reply.data() != payload {
            return Err(GearmanError::EchoDataCorruption);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::StreamConnection;
    use crate::packet::Magic;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::thread;

    /// Answer one echo request, replacing its payload with `reply` if given.
    fn echo_peer(mut peer: UnixStream, reply: Option<&'static [u8]>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let mut header = [0u8; 12];
            peer.read_exact(&mut header).unwrap();
            let size = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
            let mut body = vec![0u8; size];
            peer.read_exact(&mut body).unwrap();

            let data = reply.map_or_else(|| Bytes::from(body), Bytes::from_static);
            let response = Packet::new(Magic::Response, Command::EchoRes).with_data(data);
            peer.write_all(&response.encode().unwrap()).unwrap();
        })
    }

    #[test]
    fn test_echo_single_connection() {
        let mut ctx = Context::new();
        ctx.set_timeout(2000);
        let (ours, theirs) = UnixStream::pair().unwrap();
        ctx.add_connection(Box::new(StreamConnection::unix(ours).unwrap()));
        let peer = echo_peer(theirs, None);

        ctx.echo(&b"ping"[..]).unwrap();
        peer.join().unwrap();
        assert!(!ctx.is_non_blocking());
        assert_eq!(ctx.last_error(), None);
    }

    #[test]
    fn test_echo_detects_corruption() {
        let mut ctx = Context::new();
        ctx.set_timeout(2000);
        let (ours, theirs) = UnixStream::pair().unwrap();
        ctx.add_connection(Box::new(StreamConnection::unix(ours).unwrap()));
        let peer = echo_peer(theirs, Some(b"pong"));

        let err = ctx.echo(&b"ping"[..]).unwrap_err();
        peer.join().unwrap();
        assert!(matches!(err, GearmanError::EchoDataCorruption));
        assert_eq!(ctx.last_error(), Some("echo: corruption during echo"));
    }

    #[test]
    fn test_echo_restores_non_blocking() {
        let mut ctx = Context::new();
        ctx.set_timeout(2000);
        ctx.push_non_blocking();
        let (ours, theirs) = UnixStream::pair().unwrap();
        ctx.add_connection(Box::new(StreamConnection::unix(ours).unwrap()));
        let peer = echo_peer(theirs, None);

        ctx.echo(Bytes::from_static(b"x")).unwrap();
        peer.join().unwrap();
        assert!(ctx.is_non_blocking());
    }

    #[test]
    fn test_echo_leaves_no_ready_connections() {
        let mut ctx = Context::new();
        ctx.set_timeout(2000);
        let mut peers = Vec::new();
        for _ in 0..2 {
            let (ours, theirs) = UnixStream::pair().unwrap();
            ctx.add_connection(Box::new(StreamConnection::unix(ours).unwrap()));
            peers.push(echo_peer(theirs, None));
        }

        ctx.echo(&b"hi"[..]).unwrap();
        for peer in peers {
            peer.join().unwrap();
        }
        assert_eq!(ctx.ready(), None);
    }

    #[test]
    fn test_echo_without_connections_succeeds() {
        let mut ctx = Context::new();
        ctx.echo(Bytes::new()).unwrap();
    }
}

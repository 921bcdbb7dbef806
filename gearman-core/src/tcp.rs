//! Socket setup for job server connections.
//!
//! Opening sockets is left to the caller or to these helpers; once connected a
//! stream is handed to [`StreamConnection`] and owned by a context.

use crate::connection::StreamConnection;
use crate::endpoint::Endpoint;
use crate::error::{GearmanError, Result};
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::time::Duration;
use tracing::debug;

/// Disable Nagle's algorithm. Gearman traffic is small request/response
/// packets, so latency wins over coalescing.
#[inline]
pub fn enable_tcp_nodelay(stream: &TcpStream) -> io::Result<()> {
    SockRef::from(stream).set_nodelay(true)
}

/// Enable SO_KEEPALIVE with the given idle time so dead job servers are
/// detected by the OS.
pub fn configure_tcp_keepalive(stream: &TcpStream, idle: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(idle);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Connect to a job server, trying every resolved address in turn.
///
/// The connect itself is blocking, bounded by `timeout` per address when one
/// is given; the returned connection is non-blocking.
pub fn connect_tcp(host: &str, port: u16, timeout: Option<Duration>) -> Result<StreamConnection<TcpStream>> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| GearmanError::io("getaddrinfo", e))?;

    let mut last_err = None;
    for addr in addrs {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => {
                debug!(%addr, "connected");
                return StreamConnection::tcp(stream);
            }
            Err(e) => {
                debug!(%addr, error = %e, "connect failed");
                last_err = Some(e);
            }
        }
    }

    Err(match last_err {
        Some(e) => GearmanError::io("connect", e),
        None => GearmanError::lost_connection(format!("{host}:{port} (no addresses)")),
    })
}

/// Connect to a job server listening on a Unix domain socket.
pub fn connect_unix(path: &std::path::Path) -> Result<StreamConnection<UnixStream>> {
    let stream = UnixStream::connect(path).map_err(|e| GearmanError::io("connect", e))?;
    debug!(path = %path.display(), "connected");
    StreamConnection::unix(stream)
}

/// Connect to any supported endpoint.
pub fn connect(endpoint: &Endpoint, timeout: Option<Duration>) -> Result<Box<dyn crate::connection::Connection>> {
    match endpoint {
        Endpoint::Tcp { host, port } => Ok(Box::new(connect_tcp(host, *port, timeout)?)),
        Endpoint::Unix(path) => Ok(Box::new(connect_unix(path)?)),
    }
}

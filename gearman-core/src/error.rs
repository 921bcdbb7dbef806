//! Gearman Error Types
//!
//! Every failing operation on a [`Context`](crate::context::Context) produces one
//! of these. The context renders it into its bounded last-error slot; callers
//! still receive the structured value.

use std::io;
use thiserror::Error;

/// Main error type for Gearman core operations
#[derive(Error, Debug)]
pub enum GearmanError {
    /// OS-level failure, errno is carried by `source`
    #[error("{origin}: {source}")]
    Io {
        origin: &'static str,
        #[source]
        source: io::Error,
    },

    /// Nothing registered with the context wants readiness
    #[error("no active file descriptors")]
    NoActiveFds,

    /// Peer closed the connection or the connection was never established
    #[error("lost connection to {0}")]
    LostConnection(String),

    /// Handle does not refer to a live registry entry
    #[error("unknown handle: {0}")]
    UnknownHandle(String),

    /// Rejected option, timeout or other caller-supplied value
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Packet header carried neither `\0REQ` nor `\0RES`
    #[error("invalid magic: {0:02x?}")]
    InvalidMagic([u8; 4]),

    /// Packet header carried a command number outside the command table
    #[error("invalid command: {0}")]
    InvalidCommand(u32),

    /// Packet is structurally broken (size, argument count)
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// A well-formed packet arrived where another command was expected
    #[error("unexpected packet: expected {expected}, got {got}")]
    UnexpectedPacket {
        expected: &'static str,
        got: &'static str,
    },

    /// Echo reply payload differs from the request payload
    #[error("corruption during echo")]
    EchoDataCorruption,

    /// Workload malloc hook returned no buffer
    #[error("workload allocation of {0} bytes failed")]
    WorkloadAllocFailed(usize),

    /// Blocking I/O did not complete within the context timeout
    #[error("timed out after {0} ms")]
    TimedOut(i32),

    /// Event-watch hook refused an interest change
    #[error("event watch hook failed: {0}")]
    EventWatch(String),
}

/// Result type alias for Gearman core operations
pub type Result<T> = std::result::Result<T, GearmanError>;

impl GearmanError {
    /// Wrap an `io::Error` with the name of the operation that produced it.
    pub fn io(origin: &'static str, source: io::Error) -> Self {
        Self::Io { origin, source }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn invalid_packet(msg: impl Into<String>) -> Self {
        Self::InvalidPacket(msg.into())
    }

    pub fn lost_connection(peer: impl Into<String>) -> Self {
        Self::LostConnection(peer.into())
    }

    pub fn event_watch(msg: impl Into<String>) -> Self {
        Self::EventWatch(msg.into())
    }

    /// OS error code carried by this error, `0` when there is none.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Io { source, .. } => source.raw_os_error().unwrap_or(0),
            _ => 0,
        }
    }

    /// Check if retrying the same operation may succeed
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            Self::TimedOut(_) => true,
            _ => false,
        }
    }

    /// Check if this error means the connection is unusable
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::LostConnection(_) => true,
            Self::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

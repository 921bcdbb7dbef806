//! # Gearman
//!
//! The transport core of a Gearman job-queue client, worker or server.
//!
//! ## Architecture
//!
//! - **`gearman-core`**: context, registries, poll engine, packet codec
//! - **`gearman`**: Public API surface (this crate)
//!
//! A [`Context`] owns every connection and packet of one coordination scope.
//! Callers flush, wait for readiness, then service whatever is ready:
//!
//! ```rust,no_run
//! use gearman::prelude::*;
//!
//! # fn example() -> gearman::Result<()> {
//! let mut ctx = Context::with_config(ContextConfig::new().with_timeout(1000));
//! let endpoint: Endpoint = "127.0.0.1:4730".parse().expect("valid endpoint");
//! let server = ctx.add_connection(gearman::connect(&endpoint, None)?);
//!
//! // Liveness check against every job server
//! ctx.echo(&b"ping"[..])?;
//!
//! ctx.send(server, &Packet::new(Magic::Request, Command::Noop))?;
//! if let WaitOutcome::Ready(_) = ctx.wait()? {
//!     while let Some(id) = ctx.ready() {
//!         if let Progress::Ready(packet) = ctx.receive(id)? {
//!             println!("{id}: {}", packet.command());
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Blocking and non-blocking use
//!
//! In blocking mode (the default) [`Context::send`] and [`Context::receive`]
//! wait internally until they complete or the timeout expires. With
//! [`ContextOption::NonBlocking`] set they return [`Progress::WouldBlock`]
//! instead, and [`Context::wait`] is the only call that sleeps.
//!
//! ## Errors
//!
//! Every fallible call returns [`GearmanError`]. The context also keeps the
//! rendered message of the most recent failure ([`Context::last_error`]) and
//! the last OS error code ([`Context::last_errno`]).
#![warn(missing_docs)]
#![warn(clippy::all)]

// Re-export core types
pub use bytes::Bytes;

pub use gearman_core::alloc::{Workload, WorkloadAllocator};
pub use gearman_core::connection::{Connection, Interest, Progress, Readiness, StreamConnection};
pub use gearman_core::context::{Context, Registration, WaitOutcome};
pub use gearman_core::endpoint::{Endpoint, EndpointError, DEFAULT_PORT};
pub use gearman_core::error::{GearmanError, Result};
pub use gearman_core::log::{Verbose, MAX_ERROR_SIZE};
pub use gearman_core::options::{ContextConfig, ContextOption, OptionFlags};
pub use gearman_core::packet::{Command, Magic, Packet};
pub use gearman_core::registry::{ConnectionId, PacketId};
pub use gearman_core::tcp::{configure_tcp_keepalive, connect, enable_tcp_nodelay};

/// Binary protocol framing.
pub mod protocol {
    pub use gearman_core::packet::{decode, CommandInfo, HEADER_SIZE, MAX_BODY_SIZE};
}

/// Development utilities (tracing setup).
pub mod dev_tracing;

/// Commonly used types.
pub mod prelude {
    pub use gearman_core::prelude::*;
}

//! Gearman Core
//!
//! This crate contains the transport core shared by Gearman clients, workers
//! and servers:
//! - The connection/packet owning context (`context`)
//! - Readiness polling over `poll(2)` (`poll`)
//! - Arena registries with stable handles (`registry`)
//! - Binary protocol packets (`packet`)
//! - Connection trait + non-blocking stream connection (`connection`)
//! - Workload allocation hooks (`alloc`)
//! - Last-error slot, log and event-watch hooks (`log`)
//! - Echo liveness check (`echo`)
//! - Endpoint parsing and TCP setup (`endpoint`, `tcp`)
//! - Error types (`error`)

// The poll module needs to call libc::poll on raw descriptors
#![cfg_attr(not(test), deny(unsafe_code))]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
pub mod alloc;
pub mod buffer;
pub mod connection;
pub mod context;
pub mod echo;
pub mod endpoint;
pub mod error;
pub mod log;
pub mod options;
pub mod packet;
pub mod poll;
pub mod registry;
pub mod tcp;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::alloc::{Workload, WorkloadAllocator};
    pub use crate::connection::{Connection, Interest, Progress, Readiness, StreamConnection};
    pub use crate::context::{Context, Registration, WaitOutcome};
    pub use crate::endpoint::Endpoint;
    pub use crate::error::{GearmanError, Result};
    pub use crate::log::Verbose;
    pub use crate::options::{ContextConfig, ContextOption, OptionFlags};
    pub use crate::packet::{Command, Magic, Packet};
    pub use crate::registry::{ConnectionId, PacketId};
    pub use crate::tcp::{configure_tcp_keepalive, connect, enable_tcp_nodelay};
}

//! The shared context owning every connection and packet of one client,
//! worker or server.
//!
//! A [`Context`] is single-threaded: it is `Send`, so it may be handed to
//! another thread, but it is never shared. All blocking funnels through
//! [`Context::wait`]; everything else completes or reports would-block.
//!
//! A typical caller loop:
//!
//! ```text
//!   loop {
//!       ctx.wait()?;                     // flushes queued sends, then polls
//!       while let Some(id) = ctx.ready() {
//!           match ctx.receive(id)? { ... }
//!       }
//!   }
//! ```

use crate::alloc::{FreeFn, MallocFn, Workload, WorkloadAllocator};
use crate::connection::{Connection, Interest, Progress, Readiness};
use crate::error::{GearmanError, Result};
use crate::log::{ErrorSlot, EventWatchFn, LogHook, Verbose};
use crate::options::{ContextConfig, ContextOption, OptionFlags};
use crate::packet::Packet;
use crate::poll::{Deadline, PollSet};
use crate::registry::{ConnectionId, PacketId, Registry};
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use tracing::{debug, error, info, trace};

/// Result of one [`Context::wait`] cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// This many connections reported readiness.
    Ready(usize),
    /// The timeout elapsed without any readiness. Not an error.
    TimedOut,
}

impl WaitOutcome {
    #[must_use]
    pub const fn is_timed_out(self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

/// What [`Context::add_packet`] did with a packet.
#[derive(Debug)]
pub enum Registration {
    /// Owned by the context until removed.
    Tracked(PacketId),
    /// Packet tracking is off; ownership stays with the caller.
    Untracked(Packet),
}

struct ConnectionSlot {
    connection: Box<dyn Connection>,
    ready: bool,
    readiness: Readiness,
    /// Interest last reported to the event-watch hook.
    watched: Interest,
}

#[derive(Clone, Default)]
struct Hooks {
    log: Option<LogHook>,
    event_watch: Option<Arc<EventWatchFn>>,
    workload: WorkloadAllocator,
}

/// Connection and packet owner for one coordination scope.
pub struct Context {
    options: OptionFlags,
    verbose: Verbose,
    timeout: i32,
    connections: Registry<ConnectionSlot>,
    packets: Registry<Packet>,
    poll: PollSet,
    error: ErrorSlot,
    hooks: Hooks,
}

// Tell the event-watch hook about an interest change. Returns the descriptor
// and interest to poll, if any.
fn sync_interest(
    hooks: &Hooks,
    id: ConnectionId,
    slot: &mut ConnectionSlot,
) -> Result<Option<(RawFd, Interest)>> {
    let Some(fd) = slot.connection.fd() else {
        return Ok(None);
    };
    let interest = slot.connection.wants();
    if interest != slot.watched {
        if let Some(watch) = &hooks.event_watch {
            watch(id, fd, interest)?;
        }
        slot.watched = interest;
    }
    Ok((!interest.is_empty()).then_some((fd, interest)))
}

impl Context {
    /// Create a caller-owned context with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ContextConfig::default())
    }

    #[must_use]
    pub fn with_config(config: ContextConfig) -> Self {
        debug!(?config, "creating context");
        Self {
            options: config.flags(),
            verbose: config.verbose,
            timeout: config.timeout,
            connections: Registry::new(),
            packets: Registry::new(),
            poll: PollSet::with_capacity(config.poll_capacity),
            error: ErrorSlot::new(),
            hooks: Hooks::default(),
        }
    }

    /// Create a heap-allocated context; it reports
    /// [`is_allocated`](Self::is_allocated).
    #[must_use]
    pub fn boxed() -> Box<Self> {
        Self::boxed_with_config(ContextConfig::default())
    }

    #[must_use]
    pub fn boxed_with_config(config: ContextConfig) -> Box<Self> {
        let mut context = Box::new(Self::with_config(config));
        context.options.insert(OptionFlags::ALLOCATED);
        context
    }

    /// Heap-allocated copy of this context's settings and hooks, with empty
    /// registries.
    #[must_use]
    pub fn clone_boxed(&self) -> Box<Self> {
        let mut context = Box::new(self.clone());
        context.options.insert(OptionFlags::ALLOCATED);
        context
    }

    /// Re-initialise in place: every connection and packet is released and
    /// all settings return to their defaults.
    pub fn reset(&mut self) {
        let allocated = self.is_allocated();
        let mut fresh = Self::new();
        fresh.options.set(OptionFlags::ALLOCATED, allocated);
        *self = fresh;
    }

    // ---------------------------------------------------------------
    // Options
    // ---------------------------------------------------------------

    /// Whether the constructor allocated this context's storage.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.options.contains(OptionFlags::ALLOCATED)
    }

    #[must_use]
    pub fn options(&self) -> OptionFlags {
        self.options
    }

    #[must_use]
    pub fn option(&self, option: ContextOption) -> bool {
        self.options.contains(option.flag())
    }

    /// Toggle one option. Only `NonBlocking` and `DontTrackPackets` may be
    /// set directly.
    pub fn set_option(&mut self, option: ContextOption, value: bool) -> Result<()> {
        if !option.is_settable() {
            let err = GearmanError::invalid_argument(format!("option {option} cannot be set"));
            return Err(self.fail("set_option", err));
        }
        self.options.set(option.flag(), value);
        Ok(())
    }

    #[must_use]
    pub fn is_non_blocking(&self) -> bool {
        self.options.contains(OptionFlags::NON_BLOCKING)
    }

    #[must_use]
    pub fn is_stored_non_blocking(&self) -> bool {
        self.options.contains(OptionFlags::STORED_NON_BLOCKING)
    }

    /// Save the current non-blocking mode and force non-blocking on.
    ///
    /// The save slot holds one value: a second push before the matching
    /// [`pop_non_blocking`](Self::pop_non_blocking) overwrites it.
    pub fn push_non_blocking(&mut self) {
        let current = self.is_non_blocking();
        self.options.set(OptionFlags::STORED_NON_BLOCKING, current);
        self.options.insert(OptionFlags::NON_BLOCKING);
    }

    /// Restore the mode saved by the last push.
    pub fn pop_non_blocking(&mut self) {
        let stored = self.is_stored_non_blocking();
        self.options.set(OptionFlags::NON_BLOCKING, stored);
    }

    /// Poll timeout in milliseconds; negative means wait forever.
    #[must_use]
    pub fn timeout(&self) -> i32 {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: i32) {
        self.timeout = timeout;
    }

    #[must_use]
    pub fn verbose(&self) -> Verbose {
        self.verbose
    }

    pub fn set_verbose(&mut self, verbose: Verbose) {
        self.verbose = verbose;
        if let Some(hook) = &mut self.hooks.log {
            hook.verbose = verbose;
        }
    }

    // ---------------------------------------------------------------
    // Hooks
    // ---------------------------------------------------------------

    /// Install the log hook. It receives every message at or below `verbose`.
    pub fn set_log_fn<F>(&mut self, function: F, verbose: Verbose)
    where
        F: Fn(&str, Verbose) + Send + Sync + 'static,
    {
        self.verbose = verbose;
        self.hooks.log = Some(LogHook {
            function: Arc::new(function),
            verbose,
        });
    }

    pub fn clear_log_fn(&mut self) {
        self.hooks.log = None;
    }

    /// Install the event-watch hook, called whenever the readiness a
    /// connection waits for changes.
    pub fn set_event_watch_fn<F>(&mut self, function: F)
    where
        F: Fn(ConnectionId, RawFd, Interest) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.event_watch = Some(Arc::new(function));
    }

    pub fn clear_event_watch_fn(&mut self) {
        self.hooks.event_watch = None;
    }

    /// Route workload allocations through `function`. Returning `None`
    /// fails the allocation.
    pub fn set_workload_malloc_fn<F>(&mut self, function: F)
    where
        F: Fn(usize) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        let function: Arc<MallocFn> = Arc::new(function);
        self.hooks.workload.set_malloc(Some(function));
    }

    /// Route workload releases through `function`. Buffers allocated before
    /// this call keep the release hook they were allocated with.
    pub fn set_workload_free_fn<F>(&mut self, function: F)
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        let function: Arc<FreeFn> = Arc::new(function);
        self.hooks.workload.set_free(Some(function));
    }

    /// Go back to the system allocator for new workloads.
    pub fn clear_workload_fns(&mut self) {
        self.hooks.workload.set_malloc(None);
        self.hooks.workload.set_free(None);
    }

    #[must_use]
    pub fn workload_allocator(&self) -> &WorkloadAllocator {
        &self.hooks.workload
    }

    pub fn alloc_workload(&mut self, size: usize) -> Result<Workload> {
        match self.hooks.workload.alloc(size) {
            Ok(workload) => Ok(workload),
            Err(e) => Err(self.fail("alloc_workload", e)),
        }
    }

    // ---------------------------------------------------------------
    // Errors and logging
    // ---------------------------------------------------------------

    /// Record `error` as the most recent failure.
    ///
    /// Errno is only updated when the error carries an OS code.
    pub fn set_error(&mut self, origin: &str, error: &GearmanError) {
        let errno = error.errno();
        if errno != 0 {
            self.error.set_errno(errno);
        }
        self.error.set(origin, error);
        if let Some(message) = self.error.message() {
            self.log(Verbose::Error, format_args!("{message}"));
        }
    }

    /// Message of the most recent failure, `None` if none is pending.
    ///
    /// Successful operations leave it untouched; use
    /// [`clear_error`](Self::clear_error) to acknowledge it.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.error.message()
    }

    /// OS error code of the most recent failing syscall, `0` if none.
    #[must_use]
    pub fn last_errno(&self) -> i32 {
        self.error.errno()
    }

    pub fn clear_error(&mut self) {
        self.error.clear();
    }

    /// Emit a message to `tracing` and to the log hook.
    pub fn log(&self, level: Verbose, args: fmt::Arguments<'_>) {
        match level {
            Verbose::Never => return,
            Verbose::Fatal | Verbose::Error => error!("{args}"),
            Verbose::Info => info!("{args}"),
            Verbose::Debug => debug!("{args}"),
            Verbose::Crazy => trace!("{args}"),
        }
        if let Some(hook) = &self.hooks.log {
            if hook.wants(level) {
                (hook.function)(&args.to_string(), level);
            }
        }
    }

    fn fail(&mut self, origin: &'static str, error: GearmanError) -> GearmanError {
        self.set_error(origin, &error);
        error
    }

    // ---------------------------------------------------------------
    // Connection registry
    // ---------------------------------------------------------------

    /// Take ownership of a connection.
    pub fn add_connection(&mut self, connection: Box<dyn Connection>) -> ConnectionId {
        let peer = connection.peer();
        let id = ConnectionId(self.connections.insert(ConnectionSlot {
            connection,
            ready: false,
            readiness: Readiness::empty(),
            watched: Interest::empty(),
        }));
        self.log(Verbose::Debug, format_args!("added connection {id} to {peer}"));
        id
    }

    /// Release ownership of a connection and hand it back.
    pub fn remove_connection(&mut self, id: ConnectionId) -> Option<Box<dyn Connection>> {
        let slot = self.connections.remove(id.0)?;
        self.poll.forget(id);
        self.log(Verbose::Debug, format_args!("removed connection {id}"));
        Some(slot.connection)
    }

    /// Close and drop every connection.
    pub fn free_all_connections(&mut self) {
        let count = self.connections.len();
        for mut slot in self.connections.drain() {
            slot.connection.close();
        }
        self.poll.clear();
        if count > 0 {
            self.log(Verbose::Debug, format_args!("freed {count} connections"));
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Snapshot of connection handles in registry order. Removing
    /// connections while walking it is safe.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().into_iter().map(ConnectionId).collect()
    }

    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<&dyn Connection> {
        self.connections.get(id.0).map(|slot| slot.connection.as_ref())
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut dyn Connection> {
        let connection: &mut dyn Connection = self.connections.get_mut(id.0)?.connection.as_mut();
        Some(connection)
    }

    /// Readiness reported for `id` by the last [`wait`](Self::wait).
    #[must_use]
    pub fn readiness(&self, id: ConnectionId) -> Option<Readiness> {
        self.connections.get(id.0).map(|slot| slot.readiness)
    }

    /// Connections with queued outbound data.
    #[must_use]
    pub fn pending_sends(&self) -> usize {
        self.connections
            .iter()
            .filter(|(_, slot)| slot.connection.has_pending_send())
            .count()
    }

    // ---------------------------------------------------------------
    // Packet registry
    // ---------------------------------------------------------------

    /// Take ownership of a packet, unless packet tracking is off.
    pub fn add_packet(&mut self, packet: Packet) -> Registration {
        if self.options.contains(OptionFlags::DONT_TRACK_PACKETS) {
            return Registration::Untracked(packet);
        }
        Registration::Tracked(PacketId(self.packets.insert(packet)))
    }

    pub fn remove_packet(&mut self, id: PacketId) -> Option<Packet> {
        self.packets.remove(id.0)
    }

    #[must_use]
    pub fn packet(&self, id: PacketId) -> Option<&Packet> {
        self.packets.get(id.0)
    }

    pub fn packet_mut(&mut self, id: PacketId) -> Option<&mut Packet> {
        self.packets.get_mut(id.0)
    }

    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    #[must_use]
    pub fn packet_ids(&self) -> Vec<PacketId> {
        self.packets.keys().into_iter().map(PacketId).collect()
    }

    pub fn free_all_packets(&mut self) {
        let count = self.packets.drain().len();
        if count > 0 {
            self.log(Verbose::Debug, format_args!("freed {count} packets"));
        }
    }

    // ---------------------------------------------------------------
    // Poll engine
    // ---------------------------------------------------------------

    /// Flush every connection with queued data.
    ///
    /// A connection whose socket is full keeps its data queued and is not a
    /// failure; the first hard error stops the pass.
    pub fn flush_all(&mut self) -> Result<()> {
        for position in 0..self.connections.len() {
            let Some(key) = self.connections.key_at(position) else {
                break;
            };
            let Some(slot) = self.connections.get_mut(key) else {
                continue;
            };
            if !slot.connection.has_pending_send() {
                continue;
            }
            if let Err(e) = slot.connection.flush() {
                return Err(self.fail("flush_all", e));
            }
        }
        Ok(())
    }

    /// Wait for readiness on any connection.
    ///
    /// Queued sends are flushed first. Connections that report readiness are
    /// then handed out by [`ready`](Self::ready). A timeout is
    /// [`WaitOutcome::TimedOut`], not an error.
    pub fn wait(&mut self) -> Result<WaitOutcome> {
        if self.pending_sends() > 0 {
            self.flush_all()?;
        }

        self.poll.reserve(self.connections.len());
        self.poll.clear();

        let mut watch_failure = None;
        for position in 0..self.connections.len() {
            let Some(key) = self.connections.key_at(position) else {
                break;
            };
            let Some(slot) = self.connections.get_mut(key) else {
                continue;
            };
            let id = ConnectionId(key);
            match sync_interest(&self.hooks, id, slot) {
                Ok(Some((fd, interest))) => {
                    slot.readiness = Readiness::empty();
                    self.poll.push(id, fd, interest);
                }
                Ok(None) => {}
                Err(e) => {
                    watch_failure = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = watch_failure {
            return Err(self.fail("wait", e));
        }

        if self.poll.is_empty() {
            return Err(self.fail("wait", GearmanError::NoActiveFds));
        }

        trace!(fds = self.poll.len(), timeout = self.timeout, "polling");
        let count = match self.poll.poll(self.timeout) {
            Ok(count) => count,
            Err(e) => return Err(self.fail("wait", GearmanError::io("poll", e))),
        };

        if count == 0 {
            self.log(Verbose::Crazy, format_args!("wait timed out after {} ms", self.timeout));
            return Ok(WaitOutcome::TimedOut);
        }

        for (id, readiness) in self.poll.events() {
            if let Some(slot) = self.connections.get_mut(id.0) {
                slot.readiness = readiness;
                slot.ready = true;
            }
        }
        Ok(WaitOutcome::Ready(count))
    }

    /// Next connection flagged by the last [`wait`](Self::wait), in registry
    /// order. The flag is cleared, so each readiness is handed out once.
    pub fn ready(&mut self) -> Option<ConnectionId> {
        let key = self
            .connections
            .iter()
            .find(|(_, slot)| slot.ready)
            .map(|(key, _)| key)?;
        if let Some(slot) = self.connections.get_mut(key) {
            slot.ready = false;
        }
        Some(ConnectionId(key))
    }

    // ---------------------------------------------------------------
    // Connection I/O
    // ---------------------------------------------------------------

    fn with_connection<T>(
        &mut self,
        id: ConnectionId,
        f: impl FnOnce(&mut ConnectionSlot, &WorkloadAllocator) -> Result<T>,
    ) -> Result<T> {
        match self.connections.get_mut(id.0) {
            Some(slot) => f(slot, &self.hooks.workload),
            None => Err(GearmanError::UnknownHandle(id.to_string())),
        }
    }

    /// Block until `id` itself reports readiness or `deadline` passes.
    ///
    /// Queued sends on `id` are flushed first. Only `id` is polled: other
    /// connections keep their ready flags and readiness.
    pub(crate) fn wait_on(
        &mut self,
        origin: &'static str,
        id: ConnectionId,
        deadline: Deadline,
    ) -> Result<()> {
        if deadline.is_expired() {
            let timeout = self.timeout;
            return Err(self.fail(origin, GearmanError::TimedOut(timeout)));
        }

        let synced = match self.connections.get_mut(id.0) {
            Some(slot) => {
                let flushed = if slot.connection.has_pending_send() {
                    slot.connection.flush().map(|_| ())
                } else {
                    Ok(())
                };
                flushed.and_then(|()| sync_interest(&self.hooks, id, slot))
            }
            None => Err(GearmanError::UnknownHandle(id.to_string())),
        };
        let (fd, interest) = match synced {
            Ok(Some(polled)) => polled,
            Ok(None) => return Err(self.fail(origin, GearmanError::NoActiveFds)),
            Err(e) => return Err(self.fail(origin, e)),
        };

        self.poll.clear();
        self.poll.push(id, fd, interest);
        let count = match self.poll.poll(deadline.remaining_millis()) {
            Ok(count) => count,
            Err(e) => return Err(self.fail(origin, GearmanError::io("poll", e))),
        };
        if count == 0 {
            let timeout = self.timeout;
            return Err(self.fail(origin, GearmanError::TimedOut(timeout)));
        }

        if let Some((_, readiness)) = self.poll.events().next() {
            if let Some(slot) = self.connections.get_mut(id.0) {
                slot.readiness = readiness;
            }
        }
        Ok(())
    }

    // In non-blocking mode publish the connection's interest and give up;
    // otherwise wait on `id` alone. `Ok(true)` means retry.
    fn would_block(
        &mut self,
        origin: &'static str,
        id: ConnectionId,
        deadline: Deadline,
    ) -> Result<bool> {
        if self.is_non_blocking() {
            let synced = match self.connections.get_mut(id.0) {
                Some(slot) => sync_interest(&self.hooks, id, slot).map(|_| ()),
                None => Ok(()),
            };
            return match synced {
                Ok(()) => Ok(false),
                Err(e) => Err(self.fail(origin, e)),
            };
        }

        self.wait_on(origin, id, deadline)?;
        Ok(true)
    }

    /// Queue `packet` on a connection and flush it.
    pub fn send(&mut self, id: ConnectionId, packet: &Packet) -> Result<Progress<()>> {
        if let Err(e) = self.with_connection(id, |slot, _| slot.connection.send(packet)) {
            return Err(self.fail("send", e));
        }
        self.flush(id)
    }

    /// Write a connection's queued data. Blocks in blocking mode, for at
    /// most [`timeout`](Self::timeout) in total.
    pub fn flush(&mut self, id: ConnectionId) -> Result<Progress<()>> {
        let deadline = Deadline::after_millis(self.timeout);
        loop {
            match self.with_connection(id, |slot, _| slot.connection.flush()) {
                Ok(Progress::Ready(())) => return Ok(Progress::Ready(())),
                Ok(Progress::WouldBlock) => {
                    if !self.would_block("flush", id, deadline)? {
                        return Ok(Progress::WouldBlock);
                    }
                }
                Err(e) => return Err(self.fail("flush", e)),
            }
        }
    }

    /// Read the next packet from a connection. Blocks in blocking mode, for
    /// at most [`timeout`](Self::timeout) in total.
    pub fn receive(&mut self, id: ConnectionId) -> Result<Progress<Packet>> {
        let deadline = Deadline::after_millis(self.timeout);
        loop {
            match self.with_connection(id, |slot, alloc| slot.connection.receive(alloc)) {
                Ok(Progress::Ready(packet)) => return Ok(Progress::Ready(packet)),
                Ok(Progress::WouldBlock) => {
                    if !self.would_block("receive", id, deadline)? {
                        return Ok(Progress::WouldBlock);
                    }
                }
                Err(e) => return Err(self.fail("receive", e)),
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Copies options, verbosity, timeout and hooks. The copy starts with no
/// connections, no packets and no pending error, and is never
/// [`allocated`](Context::is_allocated).
impl Clone for Context {
    fn clone(&self) -> Self {
        Self {
            options: self.options - OptionFlags::ALLOCATED,
            verbose: self.verbose,
            timeout: self.timeout,
            connections: Registry::new(),
            packets: Registry::new(),
            poll: PollSet::with_capacity(self.poll.capacity()),
            error: ErrorSlot::new(),
            hooks: self.hooks.clone(),
        }
    }

    /// Re-initialise `self` as a clone of `source`, releasing everything it
    /// owned. `self` keeps its own allocated flag.
    fn clone_from(&mut self, source: &Self) {
        let allocated = self.is_allocated();
        let mut fresh = source.clone();
        fresh.options.set(OptionFlags::ALLOCATED, allocated);
        *self = fresh;
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.free_all_connections();
        self.free_all_packets();
        self.hooks = Hooks::default();
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("options", &self.options)
            .field("verbose", &self.verbose)
            .field("timeout", &self.timeout)
            .field("connections", &self.connections.len())
            .field("packets", &self.packets.len())
            .field("poll_capacity", &self.poll.capacity())
            .field("last_error", &self.error.message())
            .finish_non_exhaustive()
    }
}

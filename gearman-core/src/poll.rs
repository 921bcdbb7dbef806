//! Readiness polling over every connection of a context.
//!
//! One `pollfd` per interested connection, rebuilt each cycle into a buffer
//! that only ever grows (to the next power of two), so steady-state cycles do
//! not allocate.
//!
//! This module is the only place that calls into `libc::poll` directly.

#![allow(unsafe_code)]

use crate::connection::{Interest, Readiness};
use crate::registry::ConnectionId;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};
use tracing::trace;

/// Poll timeout in milliseconds, negative meaning no limit.
///
/// * `-1` (any negative): block until readiness
/// * `0`: check and return immediately
/// * `n`: wait up to `n` ms in total, across `EINTR` restarts
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub(crate) fn after_millis(timeout: i32) -> Self {
        let at = u64::try_from(timeout)
            .ok()
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        Self { at }
    }

    /// Whether a finite deadline has passed.
    pub(crate) fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Milliseconds left for the next `poll` call, rounded up so a sub-ms
    /// remainder still waits instead of spinning.
    pub(crate) fn remaining_millis(&self) -> libc::c_int {
        let Some(at) = self.at else {
            return -1;
        };
        let left = at.saturating_duration_since(Instant::now());
        let ms = left.as_micros().div_ceil(1000);
        libc::c_int::try_from(ms).unwrap_or(libc::c_int::MAX)
    }
}

/// Reusable descriptor buffer plus the connection each descriptor belongs to.
#[derive(Default)]
pub struct PollSet {
    fds: Vec<libc::pollfd>,
    owners: Vec<ConnectionId>,
    capacity: usize,
}

impl PollSet {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut set = Self::default();
        set.reserve(capacity);
        set
    }

    /// Slots allocated. Never decreases.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Make room for `wanted` descriptors, growing to the next power of two.
    pub fn reserve(&mut self, wanted: usize) {
        if wanted <= self.capacity {
            return;
        }
        let capacity = wanted.next_power_of_two();
        self.fds.reserve_exact(capacity - self.fds.len());
        self.owners.reserve_exact(capacity - self.owners.len());
        trace!(from = self.capacity, to = capacity, "grew poll set");
        self.capacity = capacity;
    }

    /// Start a new cycle. Keeps the allocation.
    pub fn clear(&mut self) {
        self.fds.clear();
        self.owners.clear();
    }

    pub fn push(&mut self, owner: ConnectionId, fd: RawFd, interest: Interest) {
        self.reserve(self.fds.len() + 1);
        self.fds.push(libc::pollfd {
            fd,
            events: interest.to_poll_events(),
            revents: 0,
        });
        self.owners.push(owner);
    }

    /// Drop any descriptor belonging to `owner`.
    pub fn forget(&mut self, owner: ConnectionId) {
        let mut i = 0;
        while i < self.owners.len() {
            if self.owners[i] == owner {
                self.owners.swap_remove(i);
                self.fds.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Block in `poll(2)` until readiness or until `timeout` ms elapse.
    ///
    /// Returns the number of descriptors with events, `0` on timeout.
    /// `EINTR` restarts the call with whatever time remains.
    pub fn poll(&mut self, timeout: i32) -> io::Result<usize> {
        let deadline = Deadline::after_millis(timeout);
        let mut wait = timeout;

        loop {
            for pfd in &mut self.fds {
                pfd.revents = 0;
            }

            // SAFETY: `fds` is a live, exclusively borrowed buffer of
            // initialised `pollfd`s and its length is passed alongside.
            let rc = unsafe {
                libc::poll(
                    self.fds.as_mut_ptr(),
                    self.fds.len() as libc::nfds_t,
                    wait,
                )
            };

            if rc >= 0 {
                return Ok(rc as usize);
            }

            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
            wait = deadline.remaining_millis();
            trace!(remaining_ms = wait, "poll interrupted, retrying");
        }
    }

    /// Descriptors that reported any event in the last [`poll`](Self::poll).
    pub fn events(&self) -> impl Iterator<Item = (ConnectionId, Readiness)> + '_ {
        self.fds
            .iter()
            .zip(&self.owners)
            .filter(|(pfd, _)| pfd.revents != 0)
            .map(|(pfd, owner)| (*owner, Readiness::from_poll_revents(pfd.revents)))
    }
}

impl fmt::Debug for PollSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollSet")
            .field("len", &self.fds.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

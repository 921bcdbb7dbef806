//! Workload buffer allocation.
//!
//! Job payloads ("workloads") are allocated through a pluggable malloc/free
//! hook pair so the application can pool or account payload memory
//! separately from everything else the context allocates.
//!
//! Invariant: a [`Workload`] remembers the free hook that was installed when it
//! was allocated and releases itself through that hook, whatever hook is
//! installed by then. Buffers can therefore never be released through the
//! wrong allocator.

use crate::error::{GearmanError, Result};
use bytes::Bytes;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Workload malloc hook. Returns a buffer of at least the requested length,
/// or `None` when the allocation cannot be satisfied.
pub type MallocFn = dyn Fn(usize) -> Option<Vec<u8>> + Send + Sync;

/// Workload free hook. Receives every buffer allocated while it was installed.
pub type FreeFn = dyn Fn(Vec<u8>) + Send + Sync;

/// The malloc/free hook pair of one context.
///
/// With no hook installed the system allocator is used directly.
#[derive(Clone, Default)]
pub struct WorkloadAllocator {
    malloc: Option<Arc<MallocFn>>,
    free: Option<Arc<FreeFn>>,
}

impl fmt::Debug for WorkloadAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadAllocator")
            .field("malloc", &self.malloc.is_some())
            .field("free", &self.free.is_some())
            .finish()
    }
}

impl WorkloadAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            malloc: None,
            free: None,
        }
    }

    pub fn set_malloc(&mut self, malloc: Option<Arc<MallocFn>>) {
        self.malloc = malloc;
    }

    pub fn set_free(&mut self, free: Option<Arc<FreeFn>>) {
        self.free = free;
    }

    #[must_use]
    pub fn has_hooks(&self) -> bool {
        self.malloc.is_some() || self.free.is_some()
    }

    /// Allocate a zeroed workload buffer of `size` bytes.
    pub fn alloc(&self, size: usize) -> Result<Workload> {
        let mut buf = match &self.malloc {
            Some(malloc) => malloc(size).ok_or(GearmanError::WorkloadAllocFailed(size))?,
            None => Vec::with_capacity(size),
        };
        if buf.len() < size {
            buf.resize(size, 0);
        }
        buf.truncate(size);

        Ok(Workload {
            buf,
            free: self.free.clone(),
        })
    }

    /// Allocate a workload buffer holding a copy of `data`.
    pub fn alloc_copy(&self, data: &[u8]) -> Result<Workload> {
        let mut workload = self.alloc(data.len())?;
        workload.copy_from_slice(data);
        Ok(workload)
    }
}

/// A payload buffer owned by the allocator hook that produced it.
pub struct Workload {
    buf: Vec<u8>,
    free: Option<Arc<FreeFn>>,
}

impl Workload {
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Freeze into immutable `Bytes`.
    ///
    /// The buffer is released through its free hook when the last `Bytes`
    /// referencing it is dropped.
    #[must_use]
    pub fn freeze(self) -> Bytes {
        if self.free.is_none() {
            let mut this = self;
            return Bytes::from(std::mem::take(&mut this.buf));
        }
        Bytes::from_owner(self)
    }
}

impl Deref for Workload {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for Workload {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl AsRef<[u8]> for Workload {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl fmt::Debug for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workload")
            .field("len", &self.buf.len())
            .field("hooked", &self.free.is_some())
            .finish()
    }
}

impl Drop for Workload {
    fn drop(&mut self) {
        if let Some(free) = self.free.take() {
            free(std::mem::take(&mut self.buf));
        }
    }
}

//! Owning registries for connections and packets.
//!
//! Entries live in a `Slab`; callers hold small `Copy` handles. A handle carries
//! the slab key plus a serial number, so a handle to a removed entry never
//! resolves to whatever later reuses the same slot.
//!
//! ```text
//!   order:  [k2, k0, k5]        insertion order, drives iteration
//!   slab:   k0 -> (serial 7, T)
//!           k2 -> (serial 4, T)
//!           k5 -> (serial 9, T)
//! ```

use slab::Slab;
use std::fmt;

/// Slot address inside a [`Registry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    index: usize,
    serial: u64,
}

impl Key {
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub const fn serial(&self) -> u64 {
        self.serial
    }
}

/// Handle to a connection owned by a [`Context`](crate::context::Context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) Key);

/// Handle to a packet owned by a [`Context`](crate::context::Context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId(pub(crate) Key);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "con#{}", self.0.serial)
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "packet#{}", self.0.serial)
    }
}

struct Entry<T> {
    serial: u64,
    value: T,
}

/// Insertion-ordered arena.
pub struct Registry<T> {
    slab: Slab<Entry<T>>,
    order: Vec<usize>,
    next_serial: u64,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slab: Slab::new(),
            order: Vec::new(),
            next_serial: 1,
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.slab.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    pub fn insert(&mut self, value: T) -> Key {
        let serial = self.next_serial;
        self.next_serial += 1;
        let index = self.slab.insert(Entry { serial, value });
        self.order.push(index);
        Key { index, serial }
    }

    pub fn remove(&mut self, key: Key) -> Option<T> {
        if !self.contains(key) {
            return None;
        }
        self.order.retain(|&index| index != key.index);
        Some(self.slab.remove(key.index).value)
    }

    #[must_use]
    pub fn contains(&self, key: Key) -> bool {
        self.slab
            .get(key.index)
            .is_some_and(|entry| entry.serial == key.serial)
    }

    #[must_use]
    pub fn get(&self, key: Key) -> Option<&T> {
        self.slab
            .get(key.index)
            .filter(|entry| entry.serial == key.serial)
            .map(|entry| &entry.value)
    }

    pub fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        self.slab
            .get_mut(key.index)
            .filter(|entry| entry.serial == key.serial)
            .map(|entry| &mut entry.value)
    }

    /// Snapshot of live keys in insertion order.
    ///
    /// Safe to hold while removing entries; removed keys simply stop resolving.
    #[must_use]
    pub fn keys(&self) -> Vec<Key> {
        self.order
            .iter()
            .map(|&index| Key {
                index,
                serial: self.slab[index].serial,
            })
            .collect()
    }

    /// Key at `position` in insertion order.
    #[must_use]
    pub fn key_at(&self, position: usize) -> Option<Key> {
        let &index = self.order.get(position)?;
        Some(Key {
            index,
            serial: self.slab[index].serial,
        })
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Key, &T)> + '_ {
        self.order.iter().map(move |&index| {
            let entry = &self.slab[index];
            (
                Key {
                    index,
                    serial: entry.serial,
                },
                &entry.value,
            )
        })
    }

    /// Remove every entry, yielding them in insertion order.
    pub fn drain(&mut self) -> Vec<T> {
        let order = std::mem::take(&mut self.order);
        let drained = order
            .into_iter()
            .map(|index| self.slab.remove(index).value)
            .collect();
        self.slab.clear();
        drained
    }
}

impl<T> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("len", &self.slab.len())
            .field("next_serial", &self.next_serial)
            .finish()
    }
}

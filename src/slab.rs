//! Slab allocator mapping small integer ids to values.
//!
//! Free slots store the index of the next free slot, so the backing vector
//! doubles as a singly linked free list: allocate and free are O(1) and the
//! most recently freed slot is always reused first.
//!
//! Used on both ends of the boundary: the worker keeps live objects in one,
//! the UI side keeps pending call continuations in another.

use crate::error::{BridgeError, Result};

#[derive(Debug)]
enum Slot<T> {
    Live(T),
    /// Index of the next free slot (`entries.len()` terminates the list).
    Free(usize),
}

/// Id-to-value table with free-list slot reuse.
#[derive(Debug)]
pub struct Slab<T> {
    entries: Vec<Slot<T>>,
    next_free: usize,
    live: usize,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Slab<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_free: 0,
            live: 0,
        }
    }

    /// Insert a value and return its id.
    pub fn allocate(&mut self, value: T) -> u32 {
        let idx = self.next_free;
        if idx == self.entries.len() {
            self.entries.push(Slot::Live(value));
            self.next_free = self.entries.len();
        } else {
            let next = match self.entries[idx] {
                Slot::Free(next) => next,
                Slot::Live(_) => unreachable!("free list points at live slot {idx}"),
            };
            self.entries[idx] = Slot::Live(value);
            self.next_free = next;
        }
        self.live += 1;
        idx as u32
    }

    /// Remove the value at `id`, making the slot the head of the free list.
    ///
    /// Fails with [`BridgeError::InvalidHandle`] if the slot is already free
    /// (double free) or was never allocated.
    pub fn free(&mut self, id: u32) -> Result<T> {
        let idx = id as usize;
        match self.entries.get(idx) {
            Some(Slot::Live(_)) => {}
            _ => return Err(BridgeError::InvalidHandle(id)),
        }
        let slot = std::mem::replace(&mut self.entries[idx], Slot::Free(self.next_free));
        self.next_free = idx;
        self.live -= 1;
        match slot {
            Slot::Live(value) => Ok(value),
            Slot::Free(_) => unreachable!(),
        }
    }

    pub fn get(&self, id: u32) -> Result<&T> {
        match self.entries.get(id as usize) {
            Some(Slot::Live(value)) => Ok(value),
            _ => Err(BridgeError::InvalidHandle(id)),
        }
    }

    pub fn get_mut(&mut self, id: u32) -> Result<&mut T> {
        match self.entries.get_mut(id as usize) {
            Some(Slot::Live(value)) => Ok(value),
            _ => Err(BridgeError::InvalidHandle(id)),
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        matches!(self.entries.get(id as usize), Some(Slot::Live(_)))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Iterate over live entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| match slot {
                Slot::Live(value) => Some((idx as u32, value)),
                Slot::Free(_) => None,
            })
    }

    /// Remove every live entry, leaving an empty slab.
    pub fn drain(&mut self) -> Vec<(u32, T)> {
        let entries = std::mem::take(&mut self.entries);
        self.next_free = 0;
        self.live = 0;
        entries
            .into_iter()
            .enumerate()
            .filter_map(|(idx, slot)| match slot {
                Slot::Live(value) => Some((idx as u32, value)),
                Slot::Free(_) => None,
            })
            .collect()
    }
}

//! Generation-checked object arena.
//!
//! The arena owns one `Arc` per live entry. Everyone else holds a
//! [`DeviceRef`]; a ref whose slot was freed (and possibly reused) no longer
//! resolves because the slot generation moved on.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

/// Stable reference to an arena entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceRef {
    index: u32,
    generation: u32,
}

impl DeviceRef {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation at the time the reference was taken
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}g{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    entry: Option<Arc<T>>,
}

/// Slot arena with generation checks
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    /// Create an empty arena
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Store an entry, taking the arena's reference
    pub fn insert(&mut self, value: Arc<T>) -> DeviceRef {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(value);
            return DeviceRef::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(value),
        });
        DeviceRef::new(index, 0)
    }

    /// Resolve a reference
    pub fn get(&self, r: DeviceRef) -> Option<&Arc<T>> {
        self.slots
            .get(r.index as usize)
            .filter(|slot| slot.generation == r.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    /// Drop the arena's reference; stale refs return `None`
    pub fn remove(&mut self, r: DeviceRef) -> Option<Arc<T>> {
        let slot = self.slots.get_mut(r.index as usize)?;
        if slot.generation != r.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(r.index);
        self.len -= 1;
        Some(entry)
    }

    /// Live entries
    pub fn iter(&self) -> impl Iterator<Item = (DeviceRef, &Arc<T>)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry
                .as_ref()
                .map(|entry| (DeviceRef::new(index as u32, slot.generation), entry))
        })
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the arena is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("len", &self.len)
            .field("slots", &self.slots.len())
            .finish()
    }
}

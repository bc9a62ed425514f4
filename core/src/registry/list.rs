//! Per-class device list: live entries plus a staging list.
//!
//! Handle lookups go through a hash index. Handles change on the device
//! objects themselves, so an index hit is checked against the device's
//! current handle and a miss falls back to a scan that repairs the index.

use super::arena::{Arena, DeviceRef};
use super::device::Identified;
use crate::error::{HbaError, HbaResult};
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use hba_hal::DeviceHandle;
use spin::Mutex;

/// Which list an entry is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    /// Visible to the upstream layer
    Live,
    /// Discovered during start-up, not yet exposed
    Staging,
}

/// One device class
#[derive(Debug)]
pub struct DeviceList<T> {
    arena: Arena<T>,
    live: Vec<DeviceRef>,
    staging: Vec<DeviceRef>,
    by_handle: Mutex<HashMap<DeviceHandle, DeviceRef>>,
}

impl<T: Identified> DeviceList<T> {
    /// Create an empty list
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
            live: Vec::new(),
            staging: Vec::new(),
            by_handle: Mutex::new(HashMap::new()),
        }
    }

    fn refs(&self) -> impl Iterator<Item = DeviceRef> + '_ {
        self.live.iter().chain(self.staging.iter()).copied()
    }

    fn entries(&self) -> impl Iterator<Item = (DeviceRef, &Arc<T>)> {
        self.refs()
            .filter_map(move |r| self.arena.get(r).map(|entry| (r, entry)))
    }

    /// Look up by firmware handle (live and staging)
    pub fn find_by_handle(&self, handle: DeviceHandle) -> Option<Arc<T>> {
        if !handle.is_valid() {
            return None;
        }
        let mut index = self.by_handle.lock();
        if let Some(dev) = index.get(&handle).and_then(|r| self.arena.get(*r)) {
            if dev.handle() == handle {
                return Some(dev.clone());
            }
        }
        match self.entries().find(|(_, dev)| dev.handle() == handle) {
            Some((r, dev)) => {
                index.insert(handle, r);
                Some(dev.clone())
            }
            None => {
                index.remove(&handle);
                None
            }
        }
    }

    /// Look up by stable identity (live and staging)
    pub fn find_by_key(&self, key: T::Key) -> Option<Arc<T>> {
        self.entries()
            .find(|(_, dev)| dev.key() == key)
            .map(|(_, dev)| dev.clone())
    }

    /// Reference of a stored object
    pub fn find_ref(&self, dev: &Arc<T>) -> Option<DeviceRef> {
        self.entries()
            .find(|(_, entry)| Arc::ptr_eq(entry, dev))
            .map(|(r, _)| r)
    }

    /// Resolve a reference
    pub fn get(&self, r: DeviceRef) -> Option<Arc<T>> {
        self.arena.get(r).cloned()
    }

    /// Store a new object; the list takes its own reference
    pub fn insert(&mut self, dev: Arc<T>, membership: Membership) -> HbaResult<DeviceRef> {
        let key = dev.key();
        let handle = dev.handle();
        for (_, entry) in self.entries() {
            if entry.key() == key {
                return Err(HbaError::DuplicateDevice);
            }
            if handle.is_valid() && entry.handle() == handle {
                return Err(HbaError::HandleInUse(handle));
            }
        }
        let r = self.arena.insert(dev);
        if handle.is_valid() {
            self.by_handle.lock().insert(handle, r);
        }
        match membership {
            Membership::Live => self.live.push(r),
            Membership::Staging => self.staging.push(r),
        }
        Ok(r)
    }

    /// Unlink and release an object; a no-op if it is not stored
    pub fn remove(&mut self, dev: &Arc<T>) -> Option<Arc<T>> {
        let r = self.find_ref(dev)?;
        self.remove_ref(r)
    }

    /// Unlink and release by reference; stale references are a no-op
    pub fn remove_ref(&mut self, r: DeviceRef) -> Option<Arc<T>> {
        let entry = self.arena.remove(r)?;
        self.by_handle.lock().retain(|_, indexed| *indexed != r);
        self.live.retain(|x| *x != r);
        self.staging.retain(|x| *x != r);
        Some(entry)
    }

    /// Move a staged entry to the live list
    pub fn promote(&mut self, r: DeviceRef) -> bool {
        match self.staging.iter().position(|x| *x == r) {
            Some(pos) => {
                self.staging.remove(pos);
                self.live.push(r);
                true
            }
            None => false,
        }
    }

    /// Which list holds the reference
    pub fn membership(&self, r: DeviceRef) -> Option<Membership> {
        if self.live.contains(&r) {
            Some(Membership::Live)
        } else if self.staging.contains(&r) {
            Some(Membership::Staging)
        } else {
            None
        }
    }

    /// Snapshot of the live entries
    pub fn live(&self) -> Vec<Arc<T>> {
        self.live
            .iter()
            .filter_map(|r| self.arena.get(*r).cloned())
            .collect()
    }

    /// Snapshot of the staged entries in discovery order
    pub fn staged(&self) -> Vec<(DeviceRef, Arc<T>)> {
        self.staging
            .iter()
            .filter_map(|r| self.arena.get(*r).map(|dev| (*r, dev.clone())))
            .collect()
    }

    /// Snapshot of every entry
    pub fn all(&self) -> Vec<Arc<T>> {
        self.entries().map(|(_, dev)| dev.clone()).collect()
    }

    /// Number of entries on both lists
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    /// Whether both lists are empty
    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

impl<T: Identified> Default for DeviceList<T> {
    fn default() -> Self {
        Self::new()
    }
}

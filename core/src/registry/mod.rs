//! # Device Registry
//!
//! Owns every discovered device object. Each class lives in its own
//! [`DeviceList`] behind its own lock; expanders, the host node and the
//! enclosure cache share the node lock. Lists hold the owning `Arc` inside
//! a generation-checked arena, so a [`DeviceRef`] held elsewhere (the
//! upstream target, the removal handshake) resolves only while the entry is
//! still registered.
//!
//! Locks are only ever taken for the duration of a closure; none of the
//! methods here call out to the upstream layer.

mod arena;
mod device;
mod list;
mod node;

pub use arena::{Arena, DeviceRef};
pub use device::{
    DeviceFlags, DeviceState, Identified, PcieDevice, RaidDevice, SasDevice, SlotLocation,
    TrackedDevice,
};
pub use list::{DeviceList, Membership};
pub use node::{
    DownstreamPort, EnclosureNode, Expander, HbaPort, HostNode, HostPhyReport, LinkTable,
    NodeTable, PortKind, PortRefresh, SasPhy, VirtualPhy,
};

use crate::error::HbaResult;
use crate::host::{DeviceClass, TargetId, TargetPrivate};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use hba_hal::{DeviceHandle, PortId, SasAddress};
use spin::Mutex;

/// Entry counts per class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryCounts {
    /// SAS/SATA devices
    pub sas: usize,
    /// PCIe devices
    pub pcie: usize,
    /// RAID volumes
    pub raid: usize,
    /// Expanders
    pub expanders: usize,
}

/// The device registry
#[derive(Debug)]
pub struct DeviceRegistry {
    pub(crate) sas: Mutex<DeviceList<SasDevice>>,
    pub(crate) pcie: Mutex<DeviceList<PcieDevice>>,
    pub(crate) raid: Mutex<DeviceList<RaidDevice>>,
    nodes: Mutex<NodeTable>,
    next_target_id: [AtomicU32; 3],
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            sas: Mutex::new(DeviceList::new()),
            pcie: Mutex::new(DeviceList::new()),
            raid: Mutex::new(DeviceList::new()),
            nodes: Mutex::new(NodeTable::new()),
            next_target_id: [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)],
        }
    }

    /// Run `f` with the list of class `T` locked
    pub fn with_list<T: TrackedDevice, R>(&self, f: impl FnOnce(&mut DeviceList<T>) -> R) -> R {
        f(&mut T::list(self).lock())
    }

    /// Run `f` with the node table locked
    pub fn with_nodes<R>(&self, f: impl FnOnce(&mut NodeTable) -> R) -> R {
        f(&mut self.nodes.lock())
    }

    /// Device of class `T` with this handle
    pub fn find_by_handle<T: TrackedDevice>(&self, handle: DeviceHandle) -> Option<Arc<T>> {
        self.with_list::<T, _>(|list| list.find_by_handle(handle))
    }

    /// Device of class `T` with this identity
    pub fn find_by_key<T: TrackedDevice>(&self, key: T::Key) -> Option<Arc<T>> {
        self.with_list::<T, _>(|list| list.find_by_key(key))
    }

    /// SAS device by address and port
    pub fn find_by_address(&self, sas_address: SasAddress, port: PortId) -> Option<Arc<SasDevice>> {
        self.find_by_key::<SasDevice>((sas_address, port))
    }

    /// Resolve a reference held outside the registry
    pub fn resolve<T: TrackedDevice>(&self, r: DeviceRef) -> Option<Arc<T>> {
        self.with_list::<T, _>(|list| list.get(r))
    }

    /// Register a device
    pub fn insert<T: TrackedDevice>(&self, dev: Arc<T>, membership: Membership) -> HbaResult<DeviceRef> {
        self.with_list::<T, _>(|list| list.insert(dev, membership))
    }

    /// Unregister a device; a no-op if it is not registered
    pub fn remove<T: TrackedDevice>(&self, dev: &Arc<T>) -> Option<Arc<T>> {
        self.with_list::<T, _>(|list| list.remove(dev))
    }

    /// Reference of a registered device
    pub fn find_ref<T: TrackedDevice>(&self, dev: &Arc<T>) -> Option<DeviceRef> {
        self.with_list::<T, _>(|list| list.find_ref(dev))
    }

    /// Snapshot of every device of class `T`
    pub fn all<T: TrackedDevice>(&self) -> Vec<Arc<T>> {
        self.with_list::<T, _>(|list| list.all())
    }

    /// Expander by handle
    pub fn expander_by_handle(&self, handle: DeviceHandle) -> Option<Arc<Expander>> {
        self.with_nodes(|nodes| nodes.expanders.find_by_handle(handle))
    }

    /// Expander by address and port
    pub fn expander_by_key(&self, sas_address: SasAddress, port: PortId) -> Option<Arc<Expander>> {
        self.with_nodes(|nodes| nodes.expanders.find_by_key((sas_address, port)))
    }

    /// Whether the handle names the controller itself
    pub fn host_owns(&self, handle: DeviceHandle) -> bool {
        self.with_nodes(|nodes| nodes.host.owns_handle(handle))
    }

    /// Host SAS address
    pub fn host_address(&self) -> SasAddress {
        self.with_nodes(|nodes| nodes.host.sas_address)
    }

    /// Cached enclosure
    pub fn enclosure(&self, handle: DeviceHandle) -> Option<EnclosureNode> {
        self.with_nodes(|nodes| nodes.enclosures.get(&handle).copied())
    }

    /// Allocate the next upstream target id for a class
    pub fn allocate_target_id(&self, class: DeviceClass) -> TargetId {
        let channel = class.channel();
        let id = self.next_target_id[channel as usize].fetch_add(1, Ordering::Relaxed);
        TargetId::new(channel, id)
    }

    fn target_in<T: TrackedDevice>(&self, id: TargetId) -> Option<Arc<TargetPrivate>> {
        self.with_list::<T, _>(|list| {
            list.all()
                .into_iter()
                .filter_map(|dev| dev.state().target())
                .find(|target| target.id() == id)
        })
    }

    /// Upstream target by id
    pub fn find_target(&self, id: TargetId) -> Option<Arc<TargetPrivate>> {
        match DeviceClass::from_channel(id.channel)? {
            DeviceClass::Sas => self.target_in::<SasDevice>(id),
            DeviceClass::Pcie => self.target_in::<PcieDevice>(id),
            DeviceClass::RaidVolume => self.target_in::<RaidDevice>(id),
        }
    }

    /// Clear every reconciliation marker
    pub fn mark_all_unresponding(&self) {
        fn clear<T: TrackedDevice>(registry: &DeviceRegistry) {
            registry.with_list::<T, _>(|list| {
                for dev in list.all() {
                    dev.state().set_responding(false);
                }
            });
        }
        clear::<SasDevice>(self);
        clear::<PcieDevice>(self);
        clear::<RaidDevice>(self);
        self.with_nodes(|nodes| {
            for expander in nodes.expanders.all() {
                expander.set_responding(false);
            }
        });
    }

    /// Entry counts
    pub fn counts(&self) -> RegistryCounts {
        RegistryCounts {
            sas: self.sas.lock().len(),
            pcie: self.pcie.lock().len(),
            raid: self.raid.lock().len(),
            expanders: self.nodes.lock().expanders.len(),
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//! Device objects tracked by the registry.

use super::{DeviceList, DeviceRegistry};
use crate::host::{DeviceClass, TargetFlags, TargetPrivate};
use alloc::string::String;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use hba_hal::config_page::{PcieDeviceInfo, SasDeviceInfo, VolumeState};
use hba_hal::scsi::InquiryIdentity;
use hba_hal::{DeviceHandle, PortId, SasAddress, Wwid};
use spin::Mutex;

bitflags! {
    /// Device-class properties
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceFlags: u32 {
        /// Hidden member disk of a RAID volume; never exposed upstream
        const RAID_COMPONENT = 1 << 0;
        /// Fast-path capable
        const FAST_PATH = 1 << 1;
        /// SATA device
        const SATA = 1 << 2;
        /// NVMe device
        const NVME = 1 << 3;
        /// SCSI device behind a PCIe switch
        const PCIE_SCSI = 1 << 4;
        /// Enclosure services device
        const SEP = 1 << 5;
        /// Selected as a boot device
        const BOOT = 1 << 6;
    }
}

impl DeviceFlags {
    /// Target flags the upstream layer sees for these device flags
    pub fn target_flags(self) -> TargetFlags {
        let mut flags = TargetFlags::empty();
        if self.contains(Self::RAID_COMPONENT) {
            flags |= TargetFlags::RAID_COMPONENT;
        }
        if self.contains(Self::FAST_PATH) {
            flags |= TargetFlags::FAST_PATH;
        }
        if self.contains(Self::SATA) {
            flags |= TargetFlags::SATA;
        }
        if self.contains(Self::NVME) {
            flags |= TargetFlags::NVME;
        }
        if self.contains(Self::PCIE_SCSI) {
            flags |= TargetFlags::PCIE_SCSI;
        }
        flags
    }
}

/// Enclosure and slot a device sits in
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotLocation {
    /// Enclosure handle
    pub enclosure_handle: DeviceHandle,
    /// Enclosure logical id, when the enclosure is known
    pub enclosure_logical_id: Option<u64>,
    /// Slot number
    pub slot: u16,
    /// Chassis slot
    pub chassis_slot: Option<u8>,
    /// Enclosure level
    pub enclosure_level: Option<u8>,
    /// Connector name
    pub connector_name: String,
}

/// Identity and handle lookup for list members
pub trait Identified: Send + Sync + 'static {
    /// Stable identity key
    type Key: Copy + Eq + fmt::Debug;

    /// Stable identity
    fn key(&self) -> Self::Key;

    /// Current firmware handle
    fn handle(&self) -> DeviceHandle;
}

/// A device class the registry exposes upstream
pub trait TrackedDevice: Identified + Sized {
    /// Class of the device
    const CLASS: DeviceClass;

    /// Mutable state shared by every class
    fn state(&self) -> &DeviceState;

    /// The list this class lives on
    fn list(registry: &DeviceRegistry) -> &Mutex<DeviceList<Self>>;

    /// Raw identity handed to the upstream target
    fn identity(&self) -> u64;
}

/// State common to every device class
#[derive(Debug)]
pub struct DeviceState {
    handle: AtomicU16,
    flags: AtomicU32,
    responding: AtomicBool,
    location: Mutex<SlotLocation>,
    target: Mutex<Option<Arc<TargetPrivate>>>,
}

impl DeviceState {
    /// Create state for a freshly discovered device
    pub fn new(handle: DeviceHandle, flags: DeviceFlags, location: SlotLocation) -> Self {
        Self {
            handle: AtomicU16::new(handle.as_u16()),
            flags: AtomicU32::new(flags.bits()),
            responding: AtomicBool::new(true),
            location: Mutex::new(location),
            target: Mutex::new(None),
        }
    }

    /// Current firmware handle
    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle::new(self.handle.load(Ordering::Acquire))
    }

    /// Record a handle reassigned by the firmware, propagating it to the target
    pub fn set_handle(&self, handle: DeviceHandle) {
        self.handle.store(handle.as_u16(), Ordering::Release);
        if let Some(target) = self.target.lock().as_ref() {
            target.set_handle(handle);
        }
    }

    /// Device flags
    pub fn flags(&self) -> DeviceFlags {
        DeviceFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Set device flags
    pub fn insert_flags(&self, flags: DeviceFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clear device flags
    pub fn remove_flags(&self, flags: DeviceFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Whether the device is a hidden RAID member
    pub fn is_hidden(&self) -> bool {
        self.flags().contains(DeviceFlags::RAID_COMPONENT)
    }

    /// Reconciliation marker
    pub fn is_responding(&self) -> bool {
        self.responding.load(Ordering::Acquire)
    }

    /// Set the reconciliation marker
    pub fn set_responding(&self, responding: bool) {
        self.responding.store(responding, Ordering::Release);
    }

    /// Enclosure location
    pub fn location(&self) -> SlotLocation {
        self.location.lock().clone()
    }

    /// Replace the enclosure location
    pub fn set_location(&self, location: SlotLocation) {
        *self.location.lock() = location;
    }

    /// Upstream target, if the device is exposed
    pub fn target(&self) -> Option<Arc<TargetPrivate>> {
        self.target.lock().clone()
    }

    pub(crate) fn attach_target(&self, target: Arc<TargetPrivate>) {
        *self.target.lock() = Some(target);
    }

    pub(crate) fn take_target(&self) -> Option<Arc<TargetPrivate>> {
        self.target.lock().take()
    }
}

// =============================================================================
// SAS
// =============================================================================

/// SAS or SATA end device
#[derive(Debug)]
pub struct SasDevice {
    /// SAS address
    pub sas_address: SasAddress,
    /// Controller port (`PortId::ANY` without multipath)
    pub port: PortId,
    /// Address of the expander or host the device hangs off
    pub parent_address: SasAddress,
    /// Parent phy
    pub phy: u8,
    /// Device information bits from the device page
    pub device_info: SasDeviceInfo,
    parent_handle: AtomicU16,
    volume: Mutex<Option<DeviceHandle>>,
    inquiry: Mutex<Option<InquiryIdentity>>,
    state: DeviceState,
}

impl SasDevice {
    /// Create a device
    pub fn new(
        sas_address: SasAddress,
        port: PortId,
        parent_address: SasAddress,
        parent_handle: DeviceHandle,
        phy: u8,
        device_info: SasDeviceInfo,
        state: DeviceState,
    ) -> Self {
        Self {
            sas_address,
            port,
            parent_address,
            phy,
            device_info,
            parent_handle: AtomicU16::new(parent_handle.as_u16()),
            volume: Mutex::new(None),
            inquiry: Mutex::new(None),
            state,
        }
    }

    /// Parent handle as last reported by the firmware
    pub fn parent_handle(&self) -> DeviceHandle {
        DeviceHandle::new(self.parent_handle.load(Ordering::Acquire))
    }

    pub(crate) fn set_parent_handle(&self, handle: DeviceHandle) {
        self.parent_handle.store(handle.as_u16(), Ordering::Release);
    }

    /// Volume this device is a hidden member of
    pub fn volume(&self) -> Option<DeviceHandle> {
        *self.volume.lock()
    }

    pub(crate) fn set_volume(&self, volume: Option<DeviceHandle>) {
        *self.volume.lock() = volume;
    }

    /// INQUIRY identity recorded while probing
    pub fn inquiry(&self) -> Option<InquiryIdentity> {
        self.inquiry.lock().clone()
    }

    pub(crate) fn set_inquiry(&self, identity: InquiryIdentity) {
        *self.inquiry.lock() = Some(identity);
    }
}

impl Identified for SasDevice {
    type Key = (SasAddress, PortId);

    fn key(&self) -> Self::Key {
        (self.sas_address, self.port)
    }

    fn handle(&self) -> DeviceHandle {
        self.state.handle()
    }
}

impl TrackedDevice for SasDevice {
    const CLASS: DeviceClass = DeviceClass::Sas;

    fn state(&self) -> &DeviceState {
        &self.state
    }

    fn list(registry: &DeviceRegistry) -> &Mutex<DeviceList<Self>> {
        &registry.sas
    }

    fn identity(&self) -> u64 {
        self.sas_address.as_u64()
    }
}

// =============================================================================
// PCIE
// =============================================================================

/// PCIe / NVMe device
#[derive(Debug)]
pub struct PcieDevice {
    /// WWID
    pub wwid: Wwid,
    /// Switch port
    pub port_num: u8,
    /// Device information bits
    pub device_info: PcieDeviceInfo,
    parent_handle: AtomicU16,
    state: DeviceState,
}

impl PcieDevice {
    /// Create a device
    pub fn new(
        wwid: Wwid,
        port_num: u8,
        parent_handle: DeviceHandle,
        device_info: PcieDeviceInfo,
        state: DeviceState,
    ) -> Self {
        Self {
            wwid,
            port_num,
            device_info,
            parent_handle: AtomicU16::new(parent_handle.as_u16()),
            state,
        }
    }

    /// Switch (or host) handle the device sits behind
    pub fn parent_handle(&self) -> DeviceHandle {
        DeviceHandle::new(self.parent_handle.load(Ordering::Acquire))
    }

    pub(crate) fn set_parent_handle(&self, handle: DeviceHandle) {
        self.parent_handle.store(handle.as_u16(), Ordering::Release);
    }
}

impl Identified for PcieDevice {
    type Key = Wwid;

    fn key(&self) -> Self::Key {
        self.wwid
    }

    fn handle(&self) -> DeviceHandle {
        self.state.handle()
    }
}

impl TrackedDevice for PcieDevice {
    const CLASS: DeviceClass = DeviceClass::Pcie;

    fn state(&self) -> &DeviceState {
        &self.state
    }

    fn list(registry: &DeviceRegistry) -> &Mutex<DeviceList<Self>> {
        &registry.pcie
    }

    fn identity(&self) -> u64 {
        self.wwid.as_u64()
    }
}

// =============================================================================
// RAID
// =============================================================================

/// RAID volume
#[derive(Debug)]
pub struct RaidDevice {
    /// Volume WWID
    pub wwid: Wwid,
    /// Member disk count
    pub num_phys_disks: u8,
    volume_state: Mutex<VolumeState>,
    state: DeviceState,
}

impl RaidDevice {
    /// Create a volume
    pub fn new(wwid: Wwid, num_phys_disks: u8, volume_state: VolumeState, state: DeviceState) -> Self {
        Self {
            wwid,
            num_phys_disks,
            volume_state: Mutex::new(volume_state),
            state,
        }
    }

    /// Last reported volume state
    pub fn volume_state(&self) -> VolumeState {
        *self.volume_state.lock()
    }

    pub(crate) fn set_volume_state(&self, state: VolumeState) {
        *self.volume_state.lock() = state;
    }
}

impl Identified for RaidDevice {
    type Key = Wwid;

    fn key(&self) -> Self::Key {
        self.wwid
    }

    fn handle(&self) -> DeviceHandle {
        self.state.handle()
    }
}

impl TrackedDevice for RaidDevice {
    const CLASS: DeviceClass = DeviceClass::RaidVolume;

    fn state(&self) -> &DeviceState {
        &self.state
    }

    fn list(registry: &DeviceRegistry) -> &Mutex<DeviceList<Self>> {
        &registry.raid
    }

    fn identity(&self) -> u64 {
        self.wwid.as_u64()
    }
}

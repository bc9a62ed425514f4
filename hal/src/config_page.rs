//! # Configuration Pages
//!
//! Typed views of the controller configuration pages the topology engine
//! reads. Pages are addressed by a [`PageType`] and a [`PageForm`]; a whole
//! device class is enumerated by chaining `GetNextHandle` reads starting at
//! [`DeviceHandle::ENUM_START`] until the read fails with
//! [`HalError::ConfigPageInvalid`](crate::HalError::ConfigPageInvalid).

use crate::{DeviceHandle, LinkRate, PortId, SasAddress, Wwid};
use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;

/// Which page to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageType {
    /// SAS IO unit page 0: host phys
    SasIoUnit0,
    /// SAS device page 0
    SasDevice0,
    /// SAS expander page 0
    Expander0,
    /// SAS expander page 1 (per phy)
    Expander1,
    /// PCIe device page 0
    PcieDevice0,
    /// RAID volume page 0 (state)
    RaidVolume0,
    /// RAID volume page 1 (identity)
    RaidVolume1,
    /// RAID physical disk page 0
    PhysDisk0,
    /// SAS enclosure page 0
    Enclosure0,
}

/// Page addressing form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageForm {
    /// The object with exactly this handle
    Handle(DeviceHandle),
    /// The first object whose handle follows this one
    GetNextHandle(DeviceHandle),
    /// One phy of the object with this handle
    HandleAndPhy(DeviceHandle, u8),
    /// RAID physical disk number
    PhysDiskNumber(u8),
    /// Singleton page
    Unit,
}

/// A config page read request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRequest {
    /// Page to read
    pub page: PageType,
    /// Addressing form
    pub form: PageForm,
}

impl PageRequest {
    /// Read the page of the given object
    pub const fn by_handle(page: PageType, handle: DeviceHandle) -> Self {
        Self { page, form: PageForm::Handle(handle) }
    }

    /// Read the page of the object following `handle`
    pub const fn next(page: PageType, handle: DeviceHandle) -> Self {
        Self { page, form: PageForm::GetNextHandle(handle) }
    }
}

bitflags! {
    /// SAS device information bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SasDeviceInfo: u32 {
        /// End device
        const END_DEVICE = 1 << 0;
        /// Edge expander
        const EDGE_EXPANDER = 1 << 1;
        /// Fanout expander
        const FANOUT_EXPANDER = 1 << 2;
        /// SATA host
        const SATA_HOST = 1 << 3;
        /// SMP initiator
        const SMP_INITIATOR = 1 << 4;
        /// STP initiator
        const STP_INITIATOR = 1 << 5;
        /// SSP initiator
        const SSP_INITIATOR = 1 << 6;
        /// SATA device
        const SATA_DEVICE = 1 << 7;
        /// SMP target
        const SMP_TARGET = 1 << 8;
        /// STP target
        const STP_TARGET = 1 << 9;
        /// SSP target
        const SSP_TARGET = 1 << 10;
        /// Direct attached to the controller
        const DIRECT_ATTACH = 1 << 11;
        /// Enclosure services (SEP) device
        const SEP = 1 << 12;
    }
}

impl SasDeviceInfo {
    /// Whether the device is something the host addresses with SCSI
    pub fn is_end_device(self) -> bool {
        self.contains(Self::END_DEVICE)
            && self.intersects(Self::SSP_TARGET | Self::STP_TARGET | Self::SATA_DEVICE)
    }

    /// Whether the device is an expander
    pub fn is_expander(self) -> bool {
        self.intersects(Self::EDGE_EXPANDER | Self::FANOUT_EXPANDER)
    }
}

bitflags! {
    /// SAS device page flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SasDeviceFlags: u16 {
        /// Device is present
        const DEVICE_PRESENT = 1 << 0;
        /// Device is mapped by the controller
        const DEVICE_MAPPED = 1 << 1;
        /// Enclosure level valid
        const ENCL_LEVEL_VALID = 1 << 4;
        /// Chassis slot valid
        const CHASSIS_SLOT_VALID = 1 << 5;
        /// Device is eligible for fast-path IO
        const FAST_PATH_CAPABLE = 1 << 13;
        /// SATA device uses NCQ
        const SATA_NCQ = 1 << 10;
    }
}

/// SAS IO unit page 0 entry for one host phy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoUnitPhy {
    /// Host phy number
    pub phy: u8,
    /// Controller port id
    pub port: PortId,
    /// Handle of the attached device (0 if none)
    pub attached_handle: DeviceHandle,
    /// Negotiated link rate
    pub link_rate: LinkRate,
    /// Whether this phy is a virtual phy backing an enclosure device
    pub is_virtual: bool,
}

/// SAS IO unit page 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasIoUnitPage0 {
    /// Host SAS address
    pub sas_address: SasAddress,
    /// Host phys
    pub phys: Vec<IoUnitPhy>,
}

/// SAS device page 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasDevicePage0 {
    /// Device handle
    pub handle: DeviceHandle,
    /// Device SAS address
    pub sas_address: SasAddress,
    /// Parent device handle (expander or host)
    pub parent_handle: DeviceHandle,
    /// Parent phy this device is attached to
    pub phy: u8,
    /// Enclosure handle
    pub enclosure_handle: DeviceHandle,
    /// Slot in the enclosure
    pub slot: u16,
    /// Controller port id
    pub port: PortId,
    /// Device information bits
    pub device_info: SasDeviceInfo,
    /// Page flags
    pub flags: SasDeviceFlags,
    /// Raw access status
    pub access_status: u8,
    /// Enclosure level
    pub enclosure_level: u8,
    /// Connector name
    pub connector_name: String,
}

/// SAS expander page 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpanderPage0 {
    /// Expander handle
    pub handle: DeviceHandle,
    /// Parent device handle
    pub parent_handle: DeviceHandle,
    /// Expander SAS address
    pub sas_address: SasAddress,
    /// Number of phys
    pub num_phys: u8,
    /// Enclosure handle
    pub enclosure_handle: DeviceHandle,
    /// Controller port id
    pub port: PortId,
}

/// SAS expander page 1: one phy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpanderPage1 {
    /// Phy number
    pub phy: u8,
    /// Handle of the attached device
    pub attached_handle: DeviceHandle,
    /// Negotiated link rate
    pub link_rate: LinkRate,
    /// Attached device information bits
    pub attached_device_info: SasDeviceInfo,
}

bitflags! {
    /// PCIe device information bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PcieDeviceInfo: u32 {
        /// NVMe device
        const NVME = 1 << 0;
        /// PCIe switch
        const SWITCH = 1 << 1;
        /// SCSI device behind PCIe
        const PCIE_SCSI = 1 << 2;
        /// End device
        const END_DEVICE = 1 << 3;
    }
}

bitflags! {
    /// PCIe device page flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PcieDeviceFlags: u32 {
        /// Device is present
        const DEVICE_PRESENT = 1 << 0;
        /// Enclosure level valid
        const ENCL_LEVEL_VALID = 1 << 1;
    }
}

/// PCIe device page 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcieDevicePage0 {
    /// Device handle
    pub handle: DeviceHandle,
    /// Device WWID
    pub wwid: Wwid,
    /// Parent (switch) handle
    pub parent_handle: DeviceHandle,
    /// Switch port the device sits behind
    pub port_num: u8,
    /// Enclosure handle
    pub enclosure_handle: DeviceHandle,
    /// Slot in the enclosure
    pub slot: u16,
    /// Device information bits
    pub device_info: PcieDeviceInfo,
    /// Page flags
    pub flags: PcieDeviceFlags,
    /// Raw access status
    pub access_status: u8,
}

/// RAID volume state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    /// Volume is missing
    Missing,
    /// Volume has failed
    Failed,
    /// Volume is initializing
    Initializing,
    /// Volume is online
    Online,
    /// Volume is degraded
    Degraded,
    /// Volume is optimal
    Optimal,
}

impl VolumeState {
    /// Whether the host should expose the volume in this state
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Online | Self::Degraded | Self::Optimal | Self::Initializing)
    }
}

/// RAID volume page 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaidVolumePage0 {
    /// Volume handle
    pub handle: DeviceHandle,
    /// Volume state
    pub state: VolumeState,
    /// Number of member physical disks
    pub num_phys_disks: u8,
}

/// RAID volume page 1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaidVolumePage1 {
    /// Volume handle
    pub handle: DeviceHandle,
    /// Volume WWID
    pub wwid: Wwid,
}

/// RAID physical disk page 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysDiskPage0 {
    /// Physical disk number
    pub phys_disk_num: u8,
    /// Device handle of the member disk
    pub handle: DeviceHandle,
}

/// SAS enclosure page 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnclosurePage0 {
    /// Enclosure handle
    pub handle: DeviceHandle,
    /// Enclosure logical id
    pub logical_id: u64,
    /// Number of slots
    pub num_slots: u16,
    /// First slot number
    pub start_slot: u16,
    /// Chassis slot (if valid)
    pub chassis_slot: Option<u8>,
}

/// A decoded configuration page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigPage {
    /// SAS IO unit page 0
    SasIoUnit0(SasIoUnitPage0),
    /// SAS device page 0
    SasDevice0(SasDevicePage0),
    /// Expander page 0
    Expander0(ExpanderPage0),
    /// Expander page 1
    Expander1(ExpanderPage1),
    /// PCIe device page 0
    PcieDevice0(PcieDevicePage0),
    /// RAID volume page 0
    RaidVolume0(RaidVolumePage0),
    /// RAID volume page 1
    RaidVolume1(RaidVolumePage1),
    /// Physical disk page 0
    PhysDisk0(PhysDiskPage0),
    /// Enclosure page 0
    Enclosure0(EnclosurePage0),
}

macro_rules! page_accessor {
    ($fn_name:ident, $variant:ident, $ty:ty) => {
        /// Unwrap the page if it is of this type
        pub fn $fn_name(self) -> crate::HalResult<$ty> {
            match self {
                Self::$variant(page) => Ok(page),
                other => {
                    log::error!("unexpected config page {:?}", core::mem::discriminant(&other));
                    Err(crate::HalError::InvalidParameter)
                }
            }
        }
    };
}

impl ConfigPage {
    page_accessor!(into_sas_io_unit0, SasIoUnit0, SasIoUnitPage0);
    page_accessor!(into_sas_device0, SasDevice0, SasDevicePage0);
    page_accessor!(into_expander0, Expander0, ExpanderPage0);
    page_accessor!(into_expander1, Expander1, ExpanderPage1);
    page_accessor!(into_pcie_device0, PcieDevice0, PcieDevicePage0);
    page_accessor!(into_raid_volume0, RaidVolume0, RaidVolumePage0);
    page_accessor!(into_raid_volume1, RaidVolume1, RaidVolumePage1);
    page_accessor!(into_phys_disk0, PhysDisk0, PhysDiskPage0);
    page_accessor!(into_enclosure0, Enclosure0, EnclosurePage0);
}

//! Firmware event payloads.

use crate::host::DeviceClass;
use crate::registry::DeviceRef;
use alloc::vec::Vec;
use hba_hal::config_page::VolumeState;
use hba_hal::{DeviceHandle, LinkRate, PortId, SasAddress};

// =============================================================================
// SAS TOPOLOGY
// =============================================================================

/// Per-phy reason code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhyReason {
    /// A target appeared on the phy
    TargetAdded,
    /// The attached target stopped responding
    TargetNotResponding,
    /// The link rate changed
    PhyLinkRateChanged,
    /// Nothing changed
    NoChange,
    /// The target stopped responding after a firmware-side delay
    DelayNotResponding,
}

/// Expander-level status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpanderStatus {
    /// Expander added
    Added,
    /// Expander no longer responding
    NotResponding,
    /// Expander responding
    Responding,
    /// Expander not responding after a delay
    DelayNotResponding,
    /// No change
    NoChange,
}

impl ExpanderStatus {
    /// Whether the expander is going away
    pub const fn is_removal(self) -> bool {
        matches!(self, Self::NotResponding | Self::DelayNotResponding)
    }
}

/// One phy entry of a topology change list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhyChange {
    /// Handle of the attached device
    pub attached_handle: DeviceHandle,
    /// Reason code
    pub reason: PhyReason,
    /// New link rate
    pub link_rate: LinkRate,
    /// Previous link rate
    pub prev_link_rate: LinkRate,
    /// Already resolved; skipped when the event is processed again
    pub vacant: bool,
    /// Device that held the handle when a delayed not-responding entry
    /// arrived
    pub departing: Option<DeviceRef>,
}

impl PhyChange {
    /// Entry for a phy
    pub const fn new(attached_handle: DeviceHandle, reason: PhyReason, link_rate: LinkRate) -> Self {
        Self {
            attached_handle,
            reason,
            link_rate,
            prev_link_rate: LinkRate::UNKNOWN,
            vacant: false,
            departing: None,
        }
    }

    /// Whether the entry would add a device
    pub fn is_add(&self) -> bool {
        matches!(self.reason, PhyReason::TargetAdded | PhyReason::PhyLinkRateChanged)
    }
}

/// SAS topology change list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasTopologyChangeList {
    /// Expander the phys belong to (host-owned handle for direct attach)
    pub expander_handle: DeviceHandle,
    /// Enclosure handle
    pub enclosure_handle: DeviceHandle,
    /// Expander status
    pub exp_status: ExpanderStatus,
    /// Phy number of the first entry
    pub start_phy: u8,
    /// Controller port
    pub port: PortId,
    /// Per-phy entries
    pub phys: Vec<PhyChange>,
}

// =============================================================================
// PCIE TOPOLOGY
// =============================================================================

/// Per-port reason code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciePortReason {
    /// A device appeared on the port
    DevAdded,
    /// The attached device stopped responding
    PortNotResponding,
    /// The attached device stopped responding after a delay
    DelayNotResponding,
    /// The link rate changed
    LinkRateChanged,
    /// Nothing changed
    NoChange,
}

/// Switch-level status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchStatus {
    /// Switch added
    Added,
    /// Switch no longer responding
    NotResponding,
    /// Switch responding
    Responding,
    /// Switch not responding after a delay
    DelayNotResponding,
    /// No change
    NoChange,
}

impl SwitchStatus {
    /// Whether the switch is going away
    pub const fn is_removal(self) -> bool {
        matches!(self, Self::NotResponding | Self::DelayNotResponding)
    }
}

/// One port entry of a PCIe topology change list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciePortChange {
    /// Handle of the attached device
    pub attached_handle: DeviceHandle,
    /// Reason code
    pub reason: PciePortReason,
    /// New link rate
    pub link_rate: LinkRate,
    /// Previous link rate
    pub prev_link_rate: LinkRate,
    /// Already resolved
    pub vacant: bool,
    /// Device that held the handle when a delayed not-responding entry
    /// arrived
    pub departing: Option<DeviceRef>,
}

impl PciePortChange {
    /// Entry for a port
    pub const fn new(attached_handle: DeviceHandle, reason: PciePortReason, link_rate: LinkRate) -> Self {
        Self {
            attached_handle,
            reason,
            link_rate,
            prev_link_rate: LinkRate::UNKNOWN,
            vacant: false,
            departing: None,
        }
    }
}

/// PCIe topology change list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcieTopologyChangeList {
    /// Switch the ports belong to (host-owned handle for direct attach)
    pub switch_handle: DeviceHandle,
    /// Enclosure handle
    pub enclosure_handle: DeviceHandle,
    /// Switch status
    pub switch_status: SwitchStatus,
    /// Port number of the first entry
    pub start_port: u8,
    /// Per-port entries
    pub ports: Vec<PciePortChange>,
}

// =============================================================================
// OTHER EVENTS
// =============================================================================

/// SAS device status change reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatusReason {
    /// Firmware started an internal device reset
    InternalDeviceResetStart,
    /// Firmware finished an internal device reset
    InternalDeviceResetComplete,
    /// SMART data reported
    SmartData,
    /// Asynchronous notification
    AsyncNotification,
    /// Any other reason code
    Other(u8),
}

/// SAS device status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatusChange {
    /// Device handle
    pub handle: DeviceHandle,
    /// Device address
    pub sas_address: SasAddress,
    /// Reason
    pub reason: DeviceStatusReason,
}

/// Enclosure status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnclosureStatus {
    /// Enclosure added
    Added,
    /// Enclosure gone
    NotResponding,
}

/// Enclosure status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnclosureStatusChange {
    /// Enclosure handle
    pub enclosure_handle: DeviceHandle,
    /// Status
    pub status: EnclosureStatus,
}

/// SAS discovery progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryEvent {
    /// Discovery started (`false`: completed)
    pub started: bool,
    /// Discovery status bits; non-zero reports errors
    pub status: u32,
}

/// IR configuration element reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrElementReason {
    /// Volume added
    VolumeAdded,
    /// Volume deleted
    VolumeDeleted,
    /// Physical disk hidden behind a volume
    PdHidden,
    /// Physical disk exposed again
    PdUnhidden,
    /// Physical disk created
    PdCreated,
    /// Physical disk deleted
    PdDeleted,
}

/// One IR configuration element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrConfigElement {
    /// Reason
    pub reason: IrElementReason,
    /// Volume handle
    pub volume_handle: DeviceHandle,
    /// Physical disk handle
    pub phys_disk_handle: DeviceHandle,
}

/// IR configuration change list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrConfigChangeList {
    /// Foreign configuration; volume elements are skipped
    pub foreign: bool,
    /// Elements
    pub elements: Vec<IrConfigElement>,
}

/// IR volume state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrVolumeEvent {
    /// Volume handle
    pub volume_handle: DeviceHandle,
    /// New state
    pub new_state: VolumeState,
}

/// Payload of a queued firmware event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FwEventData {
    /// SAS topology change list
    SasTopologyChange(SasTopologyChangeList),
    /// PCIe topology change list
    PcieTopologyChange(PcieTopologyChangeList),
    /// SAS device status change
    SasDeviceStatusChange(DeviceStatusChange),
    /// Enclosure status change
    EnclosureStatusChange(EnclosureStatusChange),
    /// SAS discovery progress
    SasDiscovery(DiscoveryEvent),
    /// IR configuration change list
    IrConfigChange(IrConfigChangeList),
    /// IR volume state change
    IrVolume(IrVolumeEvent),
    /// Retry of an add that a reconciliation pass asked to requeue
    DeviceRescan {
        /// Device class
        class: DeviceClass,
        /// Device handle
        handle: DeviceHandle,
    },
}

impl FwEventData {
    /// Short name for diagnostics
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SasTopologyChange(_) => "sas topology change list",
            Self::PcieTopologyChange(_) => "pcie topology change list",
            Self::SasDeviceStatusChange(_) => "sas device status change",
            Self::EnclosureStatusChange(_) => "enclosure status change",
            Self::SasDiscovery(_) => "sas discovery",
            Self::IrConfigChange(_) => "ir configuration change list",
            Self::IrVolume(_) => "ir volume",
            Self::DeviceRescan { .. } => "device rescan",
        }
    }

    /// Number of per-entry retry counters the event carries
    pub fn entry_count(&self) -> usize {
        match self {
            Self::SasTopologyChange(list) => list.phys.len(),
            Self::PcieTopologyChange(list) => list.ports.len(),
            _ => 1,
        }
    }
}

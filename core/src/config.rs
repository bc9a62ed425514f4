//! # Engine Configuration
//!
//! Tunables that a classic HBA driver exposes as module parameters.

use bitflags::bitflags;
use hba_hal::mpi::TaskType;
use hba_hal::{LinkRate, SasAddress, Wwid};
use static_assertions::const_assert;

bitflags! {
    /// Per-subsystem verbose tracing mask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DebugLevel: u32 {
        /// Device discovery and add paths
        const DISCOVERY = 1 << 0;
        /// Event arrival and ignore marking
        const EVENTS = 1 << 1;
        /// Event worker dispatch
        const EVENT_WORK_TASK = 1 << 2;
        /// Task management requests
        const TM = 1 << 3;
        /// Removal handshake
        const HANDSHAKE = 1 << 4;
        /// Host reset and reconciliation
        const RESET = 1 << 5;
        /// Readiness probing
        const PROBE = 1 << 6;
        /// Registry list operations
        const REGISTRY = 1 << 7;
        /// Topology change lists
        const TOPOLOGY = 1 << 8;
        /// Reply routing
        const REPLY = 1 << 9;
    }
}

/// When the readiness prober runs inside device discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbePolicy {
    /// Never probe; devices are registered as soon as their page is valid
    Never,
    /// Probe only while the driver is loading
    #[default]
    DuringStartup,
    /// Probe every newly discovered device
    Always,
}

/// Reset issued when a probe command times out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeResetMethod {
    /// Reset the whole target
    #[default]
    TargetReset,
    /// Reset only the probed logical unit
    LogicalUnitReset,
}

impl ProbeResetMethod {
    /// Task-management function for this method
    pub const fn task_type(self) -> TaskType {
        match self {
            Self::TargetReset => TaskType::TargetReset,
            Self::LogicalUnitReset => TaskType::LogicalUnitReset,
        }
    }
}

/// How a boot device is named
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDeviceSelector {
    /// SAS or SATA end device by address
    SasAddress(SasAddress),
    /// PCIe device or RAID volume by WWID
    Wwid(Wwid),
    /// Whatever device sits in this enclosure slot
    EnclosureSlot {
        /// Enclosure logical id
        logical_id: u64,
        /// Slot number
        slot: u16,
    },
}

/// Boot devices the firmware BIOS pages asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BootDeviceRequests {
    /// Requested boot device
    pub requested: Option<BootDeviceSelector>,
    /// Requested alternate boot device
    pub alternate: Option<BootDeviceSelector>,
    /// Device the BIOS actually booted from
    pub current: Option<BootDeviceSelector>,
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cap on probe retries and on topology-add requeues per phy entry
    pub command_retry_count: u8,
    /// Timeout for each probe command
    pub probe_io_timeout_secs: u32,
    /// Timeout for task-management requests
    pub tm_timeout_secs: u32,
    /// Delay before a requeued event is retried
    pub requeue_delay_ms: u64,
    /// Delay between retries of a busy probe command
    pub busy_retry_delay_ms: u64,
    /// Local retries of a probe command the device reports busy
    pub busy_retry_count: u8,
    /// Extra rounds of the removal handshake after the first one fails
    pub handshake_retries: u8,
    /// Highest LUN probed
    pub max_lun: u64,
    /// Minimum link rate at which a target is usable
    pub min_link_rate: LinkRate,
    /// Bound on waiting for a firmware coredump before resetting
    pub coredump_wait_secs: u32,
    /// When discovery probes new devices
    pub bringup_probe: ProbePolicy,
    /// Reset issued on a probe timeout
    pub reset_method: ProbeResetMethod,
    /// Whether the controller port id is part of device identity
    pub multipath_on_hba: bool,
    /// Boot device selection
    pub boot_devices: BootDeviceRequests,
    /// Verbose tracing mask
    pub debug_level: DebugLevel,
}

const_assert!(EngineConfig::DEFAULT_HANDSHAKE_RETRIES > 0);
const_assert!(EngineConfig::DEFAULT_COMMAND_RETRY_COUNT > 0);

impl EngineConfig {
    /// Default probe/requeue retry cap
    pub const DEFAULT_COMMAND_RETRY_COUNT: u8 = 144;
    /// Default handshake retry bound
    pub const DEFAULT_HANDSHAKE_RETRIES: u8 = 3;
    /// Highest LUN addressable with flat addressing
    pub const DEFAULT_MAX_LUN: u64 = 16895;

    /// Create default configuration
    pub fn new() -> Self {
        Self {
            command_retry_count: Self::DEFAULT_COMMAND_RETRY_COUNT,
            probe_io_timeout_secs: 30,
            tm_timeout_secs: 30,
            requeue_delay_ms: 1000,
            busy_retry_delay_ms: 1000,
            busy_retry_count: 5,
            handshake_retries: Self::DEFAULT_HANDSHAKE_RETRIES,
            max_lun: Self::DEFAULT_MAX_LUN,
            min_link_rate: LinkRate::RATE_1_5,
            coredump_wait_secs: 60,
            bringup_probe: ProbePolicy::DuringStartup,
            reset_method: ProbeResetMethod::TargetReset,
            multipath_on_hba: false,
            boot_devices: BootDeviceRequests::default(),
            debug_level: DebugLevel::empty(),
        }
    }

    /// Register devices without ever probing them
    pub fn no_probe() -> Self {
        Self {
            bringup_probe: ProbePolicy::Never,
            ..Self::new()
        }
    }

    /// Probe every new device and give up on slow ones sooner
    pub fn aggressive_probe() -> Self {
        Self {
            bringup_probe: ProbePolicy::Always,
            command_retry_count: 10,
            probe_io_timeout_secs: 10,
            reset_method: ProbeResetMethod::LogicalUnitReset,
            ..Self::new()
        }
    }

    /// Set the verbose tracing mask
    pub fn with_debug_level(mut self, level: DebugLevel) -> Self {
        self.debug_level = level;
        self
    }

    /// Set the boot device requests
    pub fn with_boot_devices(mut self, boot: BootDeviceRequests) -> Self {
        self.boot_devices = boot;
        self
    }

    /// Make the controller port id part of device identity
    pub fn with_multipath(mut self, enabled: bool) -> Self {
        self.multipath_on_hba = enabled;
        self
    }

    /// Probe timeout in milliseconds
    pub(crate) fn probe_timeout_ms(&self) -> u64 {
        u64::from(self.probe_io_timeout_secs) * 1000
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

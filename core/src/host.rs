//! # Upstream Host Interface
//!
//! The upstream command layer attaches one [`TargetPrivate`] to every
//! logical target the engine exposes. The engine mutates its atomics
//! directly (handle changes, deletion, recovery blocking) and reports
//! target arrival and departure through [`ScsiHost`].

use crate::error::HbaResult;
use crate::registry::DeviceRef;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use alloc::sync::Arc;
use hba_hal::mpi::ScsiIoReply;
use hba_hal::{DeviceHandle, Smid};
use spin::Mutex;

/// Device classes the engine tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceClass {
    /// SAS or SATA end device
    Sas,
    /// PCIe / NVMe device
    Pcie,
    /// RAID volume
    RaidVolume,
}

impl DeviceClass {
    /// Channel the class is exposed on
    pub const fn channel(self) -> u32 {
        match self {
            Self::Sas => 0,
            Self::RaidVolume => 1,
            Self::Pcie => 2,
        }
    }

    /// Class exposed on a channel
    pub const fn from_channel(channel: u32) -> Option<Self> {
        match channel {
            0 => Some(Self::Sas),
            1 => Some(Self::RaidVolume),
            2 => Some(Self::Pcie),
            _ => None,
        }
    }

    /// Short name for diagnostics
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sas => "sas",
            Self::Pcie => "pcie",
            Self::RaidVolume => "volume",
        }
    }
}

/// Upstream address of a logical target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId {
    /// Channel (one per device class)
    pub channel: u32,
    /// Target id within the channel
    pub id: u32,
}

impl TargetId {
    /// Create a target id
    pub const fn new(channel: u32, id: u32) -> Self {
        Self { channel, id }
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.id)
    }
}

bitflags! {
    /// Properties of a logical target
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TargetFlags: u32 {
        /// RAID volume
        const RAID_VOLUME = 1 << 0;
        /// Hidden member disk of a RAID volume
        const RAID_COMPONENT = 1 << 1;
        /// NVMe device
        const NVME = 1 << 2;
        /// SCSI device behind a PCIe switch
        const PCIE_SCSI = 1 << 3;
        /// SATA device behind SAT
        const SATA = 1 << 4;
        /// Fast-path capable
        const FAST_PATH = 1 << 5;
    }
}

/// Per-target private data shared with the upstream layer
#[derive(Debug)]
pub struct TargetPrivate {
    id: TargetId,
    class: DeviceClass,
    identity: u64,
    handle: AtomicU16,
    flags: AtomicU32,
    deleted: AtomicBool,
    blocked: AtomicBool,
    tm_busy: AtomicBool,
    device: Mutex<Option<DeviceRef>>,
}

impl TargetPrivate {
    /// Create target data for a newly exposed device
    pub fn new(
        id: TargetId,
        class: DeviceClass,
        identity: u64,
        handle: DeviceHandle,
        flags: TargetFlags,
        device: DeviceRef,
    ) -> Self {
        Self {
            id,
            class,
            identity,
            handle: AtomicU16::new(handle.as_u16()),
            flags: AtomicU32::new(flags.bits()),
            deleted: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            tm_busy: AtomicBool::new(false),
            device: Mutex::new(Some(device)),
        }
    }

    /// Upstream address
    pub fn id(&self) -> TargetId {
        self.id
    }

    /// Device class
    pub fn class(&self) -> DeviceClass {
        self.class
    }

    /// SAS address or WWID of the backing device
    pub fn identity(&self) -> u64 {
        self.identity
    }

    /// Current firmware handle
    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle::new(self.handle.load(Ordering::Acquire))
    }

    pub(crate) fn set_handle(&self, handle: DeviceHandle) {
        self.handle.store(handle.as_u16(), Ordering::Release);
    }

    /// Target properties
    pub fn flags(&self) -> TargetFlags {
        TargetFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn insert_flags(&self, flags: TargetFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn remove_flags(&self, flags: TargetFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Whether the target has been deleted; no new commands are admitted
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    pub(crate) fn clear_deleted(&self) {
        self.deleted.store(false, Ordering::Release);
    }

    /// Whether admission is blocked by the engine
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    /// Set the blocked state, returning the previous one
    pub(crate) fn set_blocked(&self, blocked: bool) -> bool {
        self.blocked.swap(blocked, Ordering::AcqRel)
    }

    /// Whether task management or a firmware-internal reset is in progress
    pub fn tm_busy(&self) -> bool {
        self.tm_busy.load(Ordering::Acquire)
    }

    pub(crate) fn set_tm_busy(&self, busy: bool) {
        self.tm_busy.store(busy, Ordering::Release);
    }

    /// Registry reference of the backing device, `None` once removed
    pub fn device_ref(&self) -> Option<DeviceRef> {
        *self.device.lock()
    }

    pub(crate) fn clear_device_ref(&self) {
        *self.device.lock() = None;
    }
}

/// Callbacks into the upstream command layer
///
/// Never called with a registry lock held.
pub trait ScsiHost: Send + Sync {
    /// A new logical target is ready for commands
    fn device_add(&self, target: &Arc<TargetPrivate>) -> HbaResult<()>;

    /// A logical target is gone; quiesce and detach it
    fn device_remove(&self, class: DeviceClass, id: TargetId);

    /// Stop issuing commands to a target
    fn device_block(&self, id: TargetId);

    /// Resume issuing commands to a target
    fn device_unblock(&self, id: TargetId);

    /// An upstream command finished
    fn io_done(&self, smid: Smid, reply: &ScsiIoReply);
}

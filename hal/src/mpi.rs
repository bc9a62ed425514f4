//! # Controller Message Interface
//!
//! Request and reply frames exchanged with the controller firmware. Only
//! the fields the topology engine reads or writes are modelled; the
//! transport is responsible for the on-wire encoding.

use crate::scsi::{Cdb, ScsiStatus, SenseData};
use crate::{DeviceHandle, Lun, Smid};
use alloc::vec::Vec;

/// Controller completion status (IOCStatus)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IocStatus {
    /// Success
    Success,
    /// Invalid function
    InvalidFunction,
    /// Controller busy
    Busy,
    /// Invalid field in the request
    InvalidField,
    /// Internal controller error
    InternalError,
    /// Config page: invalid page
    ConfigInvalidPage,
    /// Config page: no defaults
    ConfigNoDefaults,
    /// SCSI IO: device not there
    ScsiDeviceNotThere,
    /// SCSI IO: command terminated
    ScsiTerminated,
    /// SCSI IO: task terminated by a task management request
    ScsiTaskTerminated,
    /// SCSI IO: IOC terminated (e.g. reset)
    ScsiIocTerminated,
    /// Task management failure
    TaskMgmtFailed,
    /// Any other status code
    Other(u16),
}

impl IocStatus {
    /// Decode from the raw 15-bit status value
    pub const fn from_raw(raw: u16) -> Self {
        match raw & 0x7FFF {
            0x0000 => Self::Success,
            0x0001 => Self::InvalidFunction,
            0x0002 => Self::Busy,
            0x0004 => Self::InvalidField,
            0x0008 => Self::InternalError,
            0x0022 => Self::ConfigInvalidPage,
            0x0024 => Self::ConfigNoDefaults,
            0x0043 => Self::ScsiDeviceNotThere,
            0x0047 => Self::ScsiTerminated,
            0x0048 => Self::ScsiTaskTerminated,
            0x004B => Self::ScsiIocTerminated,
            0x004A => Self::TaskMgmtFailed,
            other => Self::Other(other),
        }
    }

    /// Check for success
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Priority class of a request frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPriority {
    /// Ordinary request frames (SCSI IO, config, control)
    Normal,
    /// High-priority frames reserved for task management
    HighPriority,
}

/// Task management request type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskType {
    /// Abort one outstanding command
    AbortTask,
    /// Abort every command of a nexus
    AbortTaskSet,
    /// Query whether a command is still outstanding
    QueryTask,
    /// Reset one logical unit
    LogicalUnitReset,
    /// Reset the whole target
    TargetReset,
}

impl TaskType {
    /// Human-readable name used in diagnostics
    pub const fn name(self) -> &'static str {
        match self {
            Self::AbortTask => "abort task",
            Self::AbortTaskSet => "abort task set",
            Self::QueryTask => "query task",
            Self::LogicalUnitReset => "logical unit reset",
            Self::TargetReset => "target reset",
        }
    }
}

/// Task management response code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmResponseCode {
    /// Task management function complete
    Complete,
    /// Function succeeded
    Succeeded,
    /// The queried task is present
    IoQueuedOnIoc,
    /// Invalid frame
    InvalidFrame,
    /// Function not supported
    NotSupported,
    /// Function rejected
    Rejected,
    /// Invalid logical unit
    InvalidLun,
    /// Overlapped tag attempted
    OverlappedTag,
}

impl TmResponseCode {
    /// Whether the code reports that the function was carried out
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Complete | Self::Succeeded | Self::IoQueuedOnIoc)
    }
}

/// SCSI IO request
#[derive(Debug, Clone)]
pub struct ScsiIoRequest {
    /// Target device
    pub handle: DeviceHandle,
    /// Logical unit
    pub lun: Lun,
    /// Command descriptor block
    pub cdb: Cdb,
    /// Expected data-in length
    pub data_in_len: u32,
    /// Route through the RAID firmware as a pass-through to a hidden disk
    pub raid_passthrough: bool,
    /// Command timeout in seconds
    pub timeout_secs: u32,
}

/// Task management request
#[derive(Debug, Clone, Copy)]
pub struct TmRequest {
    /// Target device
    pub handle: DeviceHandle,
    /// Logical unit (ignored for target reset)
    pub lun: Lun,
    /// Task management function
    pub task_type: TaskType,
    /// Command the request refers to (abort / query)
    pub task_smid: Option<Smid>,
    /// Issued by the removal handshake rather than error handling
    pub for_removal: bool,
}

/// IO unit control operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoUnitOperation {
    /// Tell the firmware the host has finished with a handle
    RemoveDevice,
}

/// IO unit control request
#[derive(Debug, Clone, Copy)]
pub struct IoUnitControlRequest {
    /// Operation to perform
    pub operation: IoUnitOperation,
    /// Device the operation applies to
    pub handle: DeviceHandle,
}

/// Request frame contents
#[derive(Debug, Clone)]
pub enum Request {
    /// SCSI IO
    ScsiIo(ScsiIoRequest),
    /// Task management
    TaskManagement(TmRequest),
    /// IO unit control
    IoUnitControl(IoUnitControlRequest),
}

/// SCSI IO reply
#[derive(Debug, Clone)]
pub struct ScsiIoReply {
    /// Controller status
    pub ioc_status: IocStatus,
    /// Device status byte
    pub scsi_status: ScsiStatus,
    /// Decoded sense data (check condition)
    pub sense: Option<SenseData>,
    /// Data-in payload
    pub data: Vec<u8>,
}

impl ScsiIoReply {
    /// A successful reply carrying `data`
    pub fn good(data: Vec<u8>) -> Self {
        Self {
            ioc_status: IocStatus::Success,
            scsi_status: ScsiStatus::Good,
            sense: None,
            data,
        }
    }

    /// A check-condition reply with the given sense
    pub fn check_condition(sense: SenseData) -> Self {
        Self {
            ioc_status: IocStatus::Success,
            scsi_status: ScsiStatus::CheckCondition,
            sense: Some(sense),
            data: Vec::new(),
        }
    }

    /// A reply carrying only a status byte
    pub fn status(scsi_status: ScsiStatus) -> Self {
        Self {
            ioc_status: IocStatus::Success,
            scsi_status,
            sense: None,
            data: Vec::new(),
        }
    }

    /// A reply terminated by the controller
    pub fn terminated(ioc_status: IocStatus) -> Self {
        Self {
            ioc_status,
            scsi_status: ScsiStatus::Good,
            sense: None,
            data: Vec::new(),
        }
    }
}

/// Task management reply
#[derive(Debug, Clone, Copy)]
pub struct TmReply {
    /// Controller status
    pub ioc_status: IocStatus,
    /// Response code
    pub response_code: TmResponseCode,
    /// Number of commands terminated
    pub termination_count: u32,
}

impl TmReply {
    /// A successful reply
    pub const fn success(termination_count: u32) -> Self {
        Self {
            ioc_status: IocStatus::Success,
            response_code: TmResponseCode::Complete,
            termination_count,
        }
    }
}

/// IO unit control reply
#[derive(Debug, Clone, Copy)]
pub struct IoUnitControlReply {
    /// Controller status
    pub ioc_status: IocStatus,
}

/// Reply frame contents
#[derive(Debug, Clone)]
pub enum Reply {
    /// SCSI IO completion
    ScsiIo(ScsiIoReply),
    /// Task management completion
    TaskManagement(TmReply),
    /// IO unit control completion
    IoUnitControl(IoUnitControlReply),
}

/// One entry popped off the reply queue
#[derive(Debug, Clone)]
pub struct ReplyDescriptor {
    /// Slot the reply belongs to
    pub smid: Smid,
    /// Reply contents
    pub reply: Reply,
}

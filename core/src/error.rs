//! # Engine Errors

use core::fmt;
use hba_hal::mpi::{IocStatus, TmResponseCode};
use hba_hal::{DeviceHandle, HalError};

/// Result type for engine operations
pub type HbaResult<T> = Result<T, HbaError>;

/// Why a task-management request did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmFailure {
    /// No reply within the bounded wait
    Timeout,
    /// No high-priority request frame was free
    NoSlot,
    /// The controller rejected the request
    IocStatus(IocStatus),
    /// The target answered with a failing response code
    Response(TmResponseCode),
    /// The request completed but the affected commands are still outstanding
    CommandStillOutstanding,
    /// A host reset cancelled the request
    ResetAborted,
    /// The controller was not operational
    NotOperational,
    /// Another request held the TM slot for the whole wait
    SlotBusy,
}

impl fmt::Display for TmFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out"),
            Self::NoSlot => write!(f, "no request slot"),
            Self::IocStatus(status) => write!(f, "ioc status {:?}", status),
            Self::Response(code) => write!(f, "response code {:?}", code),
            Self::CommandStillOutstanding => write!(f, "command still outstanding"),
            Self::ResetAborted => write!(f, "aborted by host reset"),
            Self::NotOperational => write!(f, "controller not operational"),
            Self::SlotBusy => write!(f, "tm slot busy"),
        }
    }
}

/// Engine errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HbaError {
    /// Error reported by the controller abstraction layer
    Hal(HalError),
    /// No device is known by this handle
    DeviceNotFound(DeviceHandle),
    /// The device-present bit is clear
    DeviceNotPresent(DeviceHandle),
    /// The firmware reported a discovery error for the device
    AccessStatus {
        /// Device handle
        handle: DeviceHandle,
        /// Raw access status
        status: u8,
        /// Decoded description
        desc: &'static str,
    },
    /// An entry with the same identity is already registered
    DuplicateDevice,
    /// Another registered device of the class still holds this handle
    HandleInUse(DeviceHandle),
    /// The parent expander or switch could not be resolved
    ParentNotFound(DeviceHandle),
    /// The device never became ready
    NotReady(DeviceHandle),
    /// Task management failed
    TmFailed(TmFailure),
    /// No request frame was free
    NoRequestSlot,
    /// The adapter is not admitting commands
    HostBusy,
    /// The target has been deleted
    DeviceGone,
    /// The target is blocked for recovery
    DeviceBlocked,
    /// The operation raced with a host reset
    ResetInProgress,
    /// The host reset itself failed
    AdapterFatal(HalError),
    /// The upstream layer refused a callback
    Upstream(&'static str),
}

impl From<HalError> for HbaError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::NoRequestSlot => Self::NoRequestSlot,
            HalError::ResetInProgress => Self::ResetInProgress,
            other => Self::Hal(other),
        }
    }
}

impl fmt::Display for HbaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hal(err) => write!(f, "controller: {}", err),
            Self::DeviceNotFound(h) => write!(f, "no device with handle {}", h),
            Self::DeviceNotPresent(h) => write!(f, "device {} not present", h),
            Self::AccessStatus { handle, status, desc } => {
                write!(f, "device {} access status 0x{:02x} ({})", handle, status, desc)
            }
            Self::DuplicateDevice => write!(f, "device already registered"),
            Self::HandleInUse(h) => write!(f, "handle {} still registered", h),
            Self::ParentNotFound(h) => write!(f, "parent {} not found", h),
            Self::NotReady(h) => write!(f, "device {} not ready", h),
            Self::TmFailed(why) => write!(f, "task management failed: {}", why),
            Self::NoRequestSlot => write!(f, "no request slot"),
            Self::HostBusy => write!(f, "host busy"),
            Self::DeviceGone => write!(f, "device gone"),
            Self::DeviceBlocked => write!(f, "device blocked"),
            Self::ResetInProgress => write!(f, "reset in progress"),
            Self::AdapterFatal(err) => write!(f, "adapter reset failed: {}", err),
            Self::Upstream(why) => write!(f, "upstream: {}", why),
        }
    }
}

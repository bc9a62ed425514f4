//! # HBA HAL - Controller Abstraction Layer
//!
//! This crate defines the traits and wire-level types the topology engine
//! uses to talk to a storage host-bus-adapter controller. The low-level
//! transport (doorbells, reply queues, DMA, register access) implements
//! [`firmware::ControllerTransport`]; everything above it is policy and
//! lives in `hba-core`.
//!
//! ## Design Philosophy
//!
//! The HAL is designed to be:
//! - **Complete**: Exposes every controller service the engine consumes
//! - **Minimal**: No discovery or recovery policy
//! - **Typed**: Config pages and replies are decoded before they cross the seam
//! - **Testable**: Every trait can be scripted from a host-side test

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod config_page;
pub mod firmware;
pub mod interrupts;
pub mod mpi;
pub mod scsi;
pub mod timer;

use core::fmt;
use static_assertions::assert_eq_size;

/// Result type for HAL operations
pub type HalResult<T> = Result<T, HalError>;

/// Errors that can occur in HAL operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// The operation is not supported by this controller
    NotSupported,
    /// Invalid parameter provided
    InvalidParameter,
    /// Hardware reported an error
    HardwareError,
    /// Resource is not available
    ResourceBusy,
    /// No request frame is free at the requested priority
    NoRequestSlot,
    /// Operation timed out
    Timeout,
    /// The requested config page does not exist (end of enumeration)
    ConfigPageInvalid,
    /// The config page request failed with a controller status
    ConfigPageError(mpi::IocStatus),
    /// The controller is not operational
    NotOperational,
    /// The controller is being reset
    ResetInProgress,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSupported => write!(f, "not supported"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::HardwareError => write!(f, "hardware error"),
            Self::ResourceBusy => write!(f, "resource busy"),
            Self::NoRequestSlot => write!(f, "no request slot"),
            Self::Timeout => write!(f, "timeout"),
            Self::ConfigPageInvalid => write!(f, "config page invalid"),
            Self::ConfigPageError(status) => write!(f, "config page error {:?}", status),
            Self::NotOperational => write!(f, "controller not operational"),
            Self::ResetInProgress => write!(f, "reset in progress"),
        }
    }
}

/// Firmware-assigned device handle
///
/// Handles are transient: the controller reuses them after a device is
/// removed, and may hand a different physical device the same value after
/// a reset. Never use a handle as identity across a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct DeviceHandle(u16);

assert_eq_size!(DeviceHandle, u16);

impl DeviceHandle {
    /// The "no device" handle
    pub const NONE: Self = Self(0);
    /// Start value for `GetNextHandle` enumeration
    pub const ENUM_START: Self = Self(0xFFFF);

    /// Create from raw value
    #[inline]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Get the raw handle value
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Whether this handle can name a device
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0 && self.0 != 0xFFFF
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// SAS address: stable identity of a SAS end device, expander or host port
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct SasAddress(u64);

impl SasAddress {
    /// Create from raw value
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether this is the all-zero address
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SasAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// World-wide identifier: stable identity of PCIe devices and RAID volumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Wwid(u64);

impl Wwid {
    /// Create from raw value
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Wwid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// Controller port identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PortId(u8);

impl PortId {
    /// Port id used when multipath-on-HBA is disabled
    pub const ANY: Self = Self(0xFF);

    /// Create from raw value
    #[inline]
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

/// Request frame slot identifier (system message id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Smid(u16);

impl Smid {
    /// Create from raw value
    #[inline]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Smid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SCSI logical unit number
pub type Lun = u64;

/// Negotiated SAS link rate (MPI encoding: 0x8 = 1.5G, 0x9 = 3G, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct LinkRate(u8);

impl LinkRate {
    /// Phy disabled / unknown
    pub const UNKNOWN: Self = Self(0x0);
    /// Phy disabled
    pub const DISABLED: Self = Self(0x1);
    /// 1.5 Gbit/s, the minimum rate at which a target is usable
    pub const RATE_1_5: Self = Self(0x8);
    /// 3.0 Gbit/s
    pub const RATE_3_0: Self = Self(0x9);
    /// 6.0 Gbit/s
    pub const RATE_6_0: Self = Self(0xA);
    /// 12.0 Gbit/s
    pub const RATE_12_0: Self = Self(0xB);
    /// 22.5 Gbit/s
    pub const RATE_22_5: Self = Self(0xC);

    /// Create from raw value
    #[inline]
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

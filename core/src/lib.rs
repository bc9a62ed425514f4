//! # HBA Core - Topology and Task-Management Engine
//!
//! The policy half of a storage host-bus-adapter driver: it discovers,
//! tracks and tears down the devices a controller exposes (SAS and SATA end
//! devices behind expanders, PCIe/NVMe devices, RAID volumes and their
//! hidden member disks) and coordinates firmware hot-plug events with
//! host-driven error recovery.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                      upstream command layer                        │
//! │        (ScsiHost: device_add / device_remove / block / io_done)    │
//! └──────────────▲───────────────────────────────┬─────────────────────┘
//!                │                               │ queue_scsi_io, eh_*
//! ┌──────────────┴───────────────────────────────▼─────────────────────┐
//! │                             Adapter                                │
//! │  ┌───────────┐  ┌───────────┐  ┌──────────┐  ┌──────────────────┐  │
//! │  │ FwEvent   │→ │ Topology  │→ │Discovery │→ │ Prober           │  │
//! │  │ Queue     │  │ Processor │  │ Engine   │  │ (TUR/START/LUNS) │  │
//! │  └───────────┘  └─────┬─────┘  └────┬─────┘  └────────┬─────────┘  │
//! │                       ▼             ▼                 ▼            │
//! │  ┌──────────────────────────┐  ┌───────────┐  ┌──────────────────┐ │
//! │  │ Device Registry          │  │ TM Engine │  │ Reset            │ │
//! │  │ (sas│pcie│raid│nodes)    │  │ +handshake│  │ Coordinator      │ │
//! │  └──────────────────────────┘  └───────────┘  └──────────────────┘ │
//! └──────────────────────────────┬─────────────────────────────────────┘
//!                                │ ControllerTransport
//! ┌──────────────────────────────▼─────────────────────────────────────┐
//! │                     hba-hal / controller firmware                  │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each concern keeps its state behind its own lock and is reached through
//! the [`Adapter`] that owns it; nothing is global.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

/// Subsystem-gated debug trace
///
/// Emits a `log::debug!` record only when the adapter's configured
/// [`DebugLevel`](crate::config::DebugLevel) has the named bit set.
macro_rules! hba_debug {
    ($adapter:expr, $flag:ident, $($arg:tt)+) => {
        if $adapter
            .config()
            .debug_level
            .contains($crate::config::DebugLevel::$flag)
        {
            log::debug!($($arg)+);
        }
    };
}

pub mod adapter;
pub mod config;
pub mod discovery;
pub mod error;
pub mod fw_event;
pub mod host;
pub mod prober;
pub mod raid;
pub mod registry;
pub mod reset;
pub mod router;
pub mod stats;
pub mod tm;
pub mod topology;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod adapter_tests;

pub use adapter::Adapter;
pub use config::{DebugLevel, EngineConfig, ProbePolicy, ProbeResetMethod};
pub use error::{HbaError, HbaResult, TmFailure};
pub use host::{DeviceClass, ScsiHost, TargetFlags, TargetId, TargetPrivate};
pub use reset::{AdapterState, ResetReason};

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

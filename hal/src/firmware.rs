//! # Controller Firmware Interface
//!
//! The services the low-level controller transport exposes to the
//! topology engine. Implementations own doorbells, request frames and the
//! reply queues; they never make discovery or recovery decisions.

use crate::config_page::{ConfigPage, PageRequest};
use crate::mpi::{ReplyDescriptor, Request, SlotPriority};
use crate::{HalResult, Smid};

/// Controller (IOC) state as reported by the doorbell register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IocState {
    /// Accepting requests
    Operational,
    /// Ready but not yet initialized
    Ready,
    /// Being reset
    Reset,
    /// Firmware fault with fault code
    Fault(u16),
    /// Firmware is writing a coredump
    Coredump,
}

impl IocState {
    /// Whether requests can be posted
    pub const fn is_operational(self) -> bool {
        matches!(self, Self::Operational)
    }
}

/// Controller transport abstraction
///
/// All methods must be callable from interrupt-time code except
/// [`hard_reset`](Self::hard_reset) and
/// [`read_config_page`](Self::read_config_page), which may sleep.
pub trait ControllerTransport: Send + Sync {
    /// Get the controller state
    fn adapter_state(&self) -> IocState;

    /// Reserve a request frame
    fn get_request_slot(&self, priority: SlotPriority) -> Option<Smid>;

    /// Return a request frame whose reply has been consumed
    fn free_request_slot(&self, smid: Smid);

    /// Post a request; the reply arrives later through [`poll_reply`](Self::poll_reply)
    fn submit_request(&self, smid: Smid, request: Request) -> HalResult<()>;

    /// Pop the next reply off the reply queue
    ///
    /// Each reply is handed out exactly once, whichever context pops it.
    fn poll_reply(&self) -> Option<ReplyDescriptor>;

    /// Read a configuration page
    fn read_config_page(&self, request: PageRequest) -> HalResult<ConfigPage>;

    /// Diagnostic reset followed by message unit re-initialization
    ///
    /// Every outstanding request is implicitly terminated and its frame
    /// returns to the free pool; no replies for requests posted before the
    /// reset are delivered afterwards.
    fn hard_reset(&self) -> HalResult<()>;

    /// Ask the firmware to start (or restart) bus-wide discovery
    fn send_port_enable(&self) -> HalResult<()>;
}

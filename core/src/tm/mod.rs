//! # Task Management Engine
//!
//! Abort and reset requests go through a single in-flight slot: one TM
//! request is outstanding at a time. The slot is a claim flag, not a lock
//! held while the reply is polled, so a completion callback that asks for
//! another TM waits out its own timeout and fails instead of spinning
//! forever. The caller blocks until the reply arrives or the bounded wait
//! elapses; a timeout escalates to a host reset, which runs after the slot
//! has been released.
//!
//! A TM reply that reports success is not trusted on its own. An abort
//! fails if the aborted command is still tracked under the same device
//! handle afterwards; a LUN or target reset fails if any tracked command
//! for the affected target (or LUN) survived it.

pub mod escalation;
pub mod handshake;

pub use escalation::RecoveryStep;
pub use handshake::{RemovalHandshakes, RemovalPurpose, RemovalStart};

use crate::adapter::{Adapter, SyncError};
use crate::error::{HbaError, HbaResult, TmFailure};
use crate::host::TargetId;
use crate::reset::ResetReason;
use crate::router::TrackedIo;
use crate::stats::AdapterStats;
use hba_hal::firmware::IocState;
use hba_hal::mpi::{Reply, Request, SlotPriority, TaskType, TmReply, TmRequest};
use hba_hal::{DeviceHandle, Lun, Smid};
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

/// Parameters of one task-management request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmRequestParams {
    /// Device handle
    pub handle: DeviceHandle,
    /// Upstream target, when the device is exposed
    pub target: Option<TargetId>,
    /// Logical unit
    pub lun: Lun,
    /// Function
    pub task_type: TaskType,
    /// Command to abort or query
    pub task_smid: Option<Smid>,
    /// Bound on the wait for the reply
    pub timeout_secs: u32,
}

impl TmRequestParams {
    /// Request of `task_type` for `handle`, LUN 0, default timeout
    pub const fn new(handle: DeviceHandle, task_type: TaskType, timeout_secs: u32) -> Self {
        Self {
            handle,
            target: None,
            lun: 0,
            task_type,
            task_smid: None,
            timeout_secs,
        }
    }

    /// Address a logical unit
    pub const fn with_lun(mut self, lun: Lun) -> Self {
        self.lun = lun;
        self
    }

    /// Name the upstream target
    pub const fn with_target(mut self, target: TargetId) -> Self {
        self.target = Some(target);
        self
    }

    /// Name the command to abort
    pub const fn with_task(mut self, smid: Smid) -> Self {
        self.task_smid = Some(smid);
        self
    }

    fn affects(&self, io: &TrackedIo) -> bool {
        let on_target = match self.target {
            Some(target) => io.target == target,
            None => io.handle == self.handle,
        };
        match self.task_type {
            TaskType::LogicalUnitReset | TaskType::AbortTaskSet => on_target && io.lun == self.lun,
            _ => on_target,
        }
    }
}

/// The single in-flight TM slot
#[derive(Debug, Default)]
pub struct TmSlot {
    busy: AtomicBool,
    inflight: Mutex<Option<TmRequest>>,
}

/// Ownership of the TM slot, released on drop
#[derive(Debug)]
pub struct TmClaim<'a> {
    slot: &'a TmSlot,
}

impl Drop for TmClaim<'_> {
    fn drop(&mut self) {
        *self.slot.inflight.lock() = None;
        self.slot.busy.store(false, Ordering::Release);
    }
}

impl TmSlot {
    /// Idle slot
    pub const fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            inflight: Mutex::new(None),
        }
    }

    /// Take the slot if no other request holds it
    pub fn try_claim(&self) -> Option<TmClaim<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| TmClaim { slot: self })
    }

    /// Request currently outstanding
    pub fn in_flight(&self) -> Option<TmRequest> {
        *self.inflight.lock()
    }
}

/// Outcome of the part of a TM request run under the slot claim
enum TmStep {
    Finished(HbaResult<()>),
    Escalate(ResetReason),
}

impl Adapter {
    /// Issue a task-management request and verify its effect
    ///
    /// A request that times out, or finds the controller faulted, is
    /// escalated to a host reset; it then succeeds if the reset does.
    pub fn issue_tm(&self, params: TmRequestParams) -> HbaResult<()> {
        AdapterStats::bump(&self.stats.tm_issued);
        hba_debug!(
            self,
            TM,
            "{}: {} handle({}) lun({}) task({:?})",
            self.name(),
            params.task_type.name(),
            params.handle,
            params.lun,
            params.task_smid
        );

        let result = match self.issue_tm_claimed(&params) {
            TmStep::Finished(result) => result,
            TmStep::Escalate(reason) => {
                log::info!(
                    "{}: {} on handle {} escalating to host reset ({})",
                    self.name(),
                    params.task_type.name(),
                    params.handle,
                    reason
                );
                self.hard_reset(reason)
            }
        };

        if let Err(err) = &result {
            AdapterStats::bump(&self.stats.tm_failed);
            log::info!(
                "{}: {} on handle {} failed: {}",
                self.name(),
                params.task_type.name(),
                params.handle,
                err
            );
        }
        result
    }

    /// Wait for the TM slot, at most `timeout_ms`
    ///
    /// No lock is held while waiting or while the request is outstanding,
    /// so reply processing may run from inside a completion callback.
    fn claim_tm_slot(&self, timeout_ms: u64) -> Option<TmClaim<'_>> {
        let deadline = self.clock().now_ms().saturating_add(timeout_ms);
        loop {
            if let Some(claim) = self.tm.try_claim() {
                return Some(claim);
            }
            if self.clock().now_ms() >= deadline {
                return None;
            }
            self.clock().delay_ms(1);
        }
    }

    fn issue_tm_claimed(&self, params: &TmRequestParams) -> TmStep {
        let timeout_ms = u64::from(params.timeout_secs) * 1000;
        let Some(_slot) = self.claim_tm_slot(timeout_ms) else {
            log::warn!(
                "{}: {} on handle {} gave up waiting for the tm slot",
                self.name(),
                params.task_type.name(),
                params.handle
            );
            return TmStep::Finished(Err(HbaError::TmFailed(TmFailure::SlotBusy)));
        };

        if self.state.is_recovering() {
            return TmStep::Finished(Err(HbaError::TmFailed(TmFailure::ResetAborted)));
        }
        match self.transport().adapter_state() {
            IocState::Operational => {}
            IocState::Fault(code) => return TmStep::Escalate(ResetReason::FaultState(code)),
            IocState::Coredump => return TmStep::Escalate(ResetReason::CoredumpState),
            state => {
                log::warn!("{}: controller not operational ({:?})", self.name(), state);
                return TmStep::Finished(Err(HbaError::TmFailed(TmFailure::NotOperational)));
            }
        }

        let target = self.target_by_handle(params.handle);
        if let Some(target) = &target {
            target.set_tm_busy(true);
        }
        let request = TmRequest {
            handle: params.handle,
            lun: params.lun,
            task_type: params.task_type,
            task_smid: params.task_smid,
            for_removal: false,
        };
        *self.tm.inflight.lock() = Some(request);

        let step = match self.send_sync(SlotPriority::HighPriority, Request::TaskManagement(request), timeout_ms) {
            Ok(Reply::TaskManagement(reply)) => {
                // Let completions racing the TM reply land before checking
                self.process_reply_queue();
                TmStep::Finished(self.verify_tm(params, &reply))
            }
            Ok(other) => {
                log::error!("{}: unexpected reply to task management: {:?}", self.name(), other);
                TmStep::Finished(Err(HbaError::Hal(hba_hal::HalError::InvalidParameter)))
            }
            Err(SyncError::NoSlot) => TmStep::Finished(Err(HbaError::TmFailed(TmFailure::NoSlot))),
            Err(SyncError::Submit(err)) => TmStep::Finished(Err(err.into())),
            Err(SyncError::TimedOut) => {
                AdapterStats::bump(&self.stats.tm_timeouts);
                TmStep::Escalate(ResetReason::TmTimeout)
            }
            Err(SyncError::Reset) => TmStep::Finished(Err(HbaError::TmFailed(TmFailure::ResetAborted))),
        };

        if let Some(target) = &target {
            target.set_tm_busy(false);
        }
        step
    }

    fn verify_tm(&self, params: &TmRequestParams, reply: &TmReply) -> HbaResult<()> {
        if !reply.ioc_status.is_success() {
            return Err(HbaError::TmFailed(TmFailure::IocStatus(reply.ioc_status)));
        }
        if !reply.response_code.is_success() {
            return Err(HbaError::TmFailed(TmFailure::Response(reply.response_code)));
        }

        let outstanding = match params.task_type {
            TaskType::QueryTask => 0,
            TaskType::AbortTask => match params.task_smid {
                Some(smid) if self.router.io_handle(smid) == Some(params.handle) => 1,
                _ => 0,
            },
            TaskType::AbortTaskSet | TaskType::LogicalUnitReset | TaskType::TargetReset => {
                self.router.count_io(|io| params.affects(io))
            }
        };
        if outstanding > 0 {
            hba_debug!(
                self,
                TM,
                "{}: {} left {} commands outstanding on handle {}",
                self.name(),
                params.task_type.name(),
                outstanding,
                params.handle
            );
            return Err(HbaError::TmFailed(TmFailure::CommandStillOutstanding));
        }
        hba_debug!(
            self,
            TM,
            "{}: {} complete, {} terminated",
            self.name(),
            params.task_type.name(),
            reply.termination_count
        );
        Ok(())
    }
}

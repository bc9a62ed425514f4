//! Error-handler hooks and the escalation ladder for timed-out commands.

use crate::adapter::Adapter;
use crate::error::{HbaError, HbaResult};
use crate::host::{TargetId, TargetPrivate};
use crate::reset::ResetReason;
use crate::tm::TmRequestParams;
use alloc::sync::Arc;
use hba_hal::mpi::TaskType;
use hba_hal::{Lun, Smid};

/// One rung of the recovery ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecoveryStep {
    /// Abort the command
    AbortTask,
    /// Reset its logical unit
    LogicalUnitReset,
    /// Reset its target
    TargetReset,
    /// Reset the adapter
    HostReset,
}

impl RecoveryStep {
    /// Rungs in escalation order
    pub const LADDER: [Self; 4] = [
        Self::AbortTask,
        Self::LogicalUnitReset,
        Self::TargetReset,
        Self::HostReset,
    ];

    /// Next rung
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::AbortTask => Some(Self::LogicalUnitReset),
            Self::LogicalUnitReset => Some(Self::TargetReset),
            Self::TargetReset => Some(Self::HostReset),
            Self::HostReset => None,
        }
    }

    /// Short name for diagnostics
    pub const fn name(self) -> &'static str {
        match self {
            Self::AbortTask => "abort task",
            Self::LogicalUnitReset => "logical unit reset",
            Self::TargetReset => "target reset",
            Self::HostReset => "host reset",
        }
    }
}

impl Adapter {
    fn live_target(&self, id: TargetId) -> Option<Arc<TargetPrivate>> {
        self.registry.find_target(id).filter(|t| !t.is_deleted())
    }

    fn target_tm(&self, target: &TargetPrivate, task_type: TaskType, lun: Lun) -> TmRequestParams {
        TmRequestParams::new(target.handle(), task_type, self.config().tm_timeout_secs)
            .with_target(target.id())
            .with_lun(lun)
    }

    /// Abort one outstanding upstream command
    ///
    /// A command that already completed, or whose target is gone, needs no
    /// abort and succeeds.
    pub fn eh_abort(&self, smid: Smid) -> HbaResult<()> {
        let Some(io) = self.router.tracked_io(smid) else {
            return Ok(());
        };
        let Some(target) = self.live_target(io.target) else {
            return Ok(());
        };
        let params = self.target_tm(&target, TaskType::AbortTask, io.lun).with_task(smid);
        self.issue_tm(params)
    }

    /// Reset one logical unit
    pub fn eh_device_reset(&self, id: TargetId, lun: Lun) -> HbaResult<()> {
        let target = self.live_target(id).ok_or(HbaError::DeviceGone)?;
        self.issue_tm(self.target_tm(&target, TaskType::LogicalUnitReset, lun))
    }

    /// Reset a whole target
    pub fn eh_target_reset(&self, id: TargetId) -> HbaResult<()> {
        let target = self.live_target(id).ok_or(HbaError::DeviceGone)?;
        self.issue_tm(self.target_tm(&target, TaskType::TargetReset, 0))
    }

    /// Reset the adapter
    pub fn eh_host_reset(&self) -> HbaResult<()> {
        self.hard_reset(ResetReason::HostRequest)
    }

    fn run_step(&self, step: RecoveryStep, smid: Smid, id: TargetId, lun: Lun) -> HbaResult<()> {
        match step {
            RecoveryStep::AbortTask => self.eh_abort(smid),
            RecoveryStep::LogicalUnitReset => self.eh_device_reset(id, lun),
            RecoveryStep::TargetReset => self.eh_target_reset(id),
            RecoveryStep::HostReset => self.eh_host_reset(),
        }
    }

    /// Recover a timed-out upstream command by climbing the ladder
    ///
    /// Returns the rung that resolved it; fails only when the host reset
    /// itself fails.
    pub fn recover_timed_out_command(&self, smid: Smid) -> HbaResult<RecoveryStep> {
        let Some(io) = self.router.tracked_io(smid) else {
            return Ok(RecoveryStep::AbortTask);
        };

        let mut step = RecoveryStep::AbortTask;
        loop {
            log::info!(
                "{}: smid {} on target {} lun {}: attempting {}",
                self.name(),
                smid,
                io.target,
                io.lun,
                step.name()
            );
            match self.run_step(step, smid, io.target, io.lun) {
                Ok(()) => {
                    log::info!("{}: smid {} recovered by {}", self.name(), smid, step.name());
                    return Ok(step);
                }
                Err(err) => match step.next() {
                    Some(next) => {
                        log::info!("{}: {} failed ({}), escalating", self.name(), step.name(), err);
                        step = next;
                    }
                    None => {
                        log::error!("{}: recovery of smid {} exhausted: {}", self.name(), smid, err);
                        return Err(err);
                    }
                },
            }
        }
    }
}

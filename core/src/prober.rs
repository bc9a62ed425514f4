//! # Responsiveness Prober
//!
//! Decides whether a freshly discovered device can be exposed. It issues
//! TEST UNIT READY (and START STOP UNIT / REPORT LUNS / INQUIRY where
//! needed) through the synchronous request path and classifies the answer.
//!
//! Probing blocks the calling thread, possibly for many seconds; callers
//! must not hold a registry lock. Locally recoverable conditions (busy,
//! becoming ready, unit attention) are classifications, never errors.

use crate::adapter::{Adapter, SyncError};
use crate::tm::TmRequestParams;
use alloc::vec;
use alloc::vec::Vec;
use hba_hal::mpi::{IocStatus, Reply, Request, ScsiIoReply, ScsiIoRequest, SlotPriority};
use hba_hal::scsi::{self, asc, ascq, sense_key, Cdb, InquiryIdentity, ScsiStatus};
use hba_hal::{DeviceHandle, Lun};

/// Readiness classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceReadiness {
    /// The device may be exposed
    Ready,
    /// Try again later
    Retry,
    /// A unit attention is pending; try again later
    RetryUnitAttention,
    /// The unit needs a START STOP UNIT (start)
    NeedsStartUnit,
    /// The unit is in a low-power condition and needs stopping and starting
    NeedsStopUnit,
    /// The device cannot be used
    Error,
}

impl DeviceReadiness {
    /// Whether discovery should requeue rather than give up
    pub const fn should_retry(self) -> bool {
        matches!(
            self,
            Self::Retry | Self::RetryUnitAttention | Self::NeedsStartUnit | Self::NeedsStopUnit
        )
    }
}

/// Classify a TEST UNIT READY completion
pub fn classify_tur(reply: &ScsiIoReply) -> DeviceReadiness {
    match reply.ioc_status {
        IocStatus::Success => {}
        IocStatus::ScsiDeviceNotThere => return DeviceReadiness::Error,
        IocStatus::ScsiTerminated
        | IocStatus::ScsiTaskTerminated
        | IocStatus::ScsiIocTerminated
        | IocStatus::Busy => return DeviceReadiness::Retry,
        _ => return DeviceReadiness::Error,
    }

    match reply.scsi_status {
        ScsiStatus::Good | ScsiStatus::ReservationConflict => DeviceReadiness::Ready,
        ScsiStatus::Busy | ScsiStatus::TaskSetFull | ScsiStatus::TaskAborted | ScsiStatus::AcaActive => {
            DeviceReadiness::Retry
        }
        ScsiStatus::CheckCondition => match reply.sense {
            Some(sense) => classify_sense(sense.key, sense.asc, sense.ascq),
            None => DeviceReadiness::Retry,
        },
    }
}

fn classify_sense(key: u8, code: u8, qualifier: u8) -> DeviceReadiness {
    match (key, code) {
        (sense_key::NO_SENSE | sense_key::RECOVERED_ERROR, _) => DeviceReadiness::Ready,
        (sense_key::NOT_READY, asc::LUN_NOT_READY) => match qualifier {
            ascq::INITIALIZING_COMMAND_REQUIRED | ascq::NOTIFY_REQUIRED => DeviceReadiness::NeedsStartUnit,
            ascq::MANUAL_INTERVENTION_REQUIRED => DeviceReadiness::Error,
            _ => DeviceReadiness::Retry,
        },
        (sense_key::NOT_READY, asc::MEDIUM_NOT_PRESENT) => DeviceReadiness::Ready,
        (sense_key::NOT_READY, asc::LOW_POWER_CONDITION_ON) => DeviceReadiness::NeedsStopUnit,
        (sense_key::UNIT_ATTENTION, _) => DeviceReadiness::RetryUnitAttention,
        (
            sense_key::MEDIUM_ERROR | sense_key::HARDWARE_ERROR,
            asc::MEDIUM_NOT_PRESENT | asc::DEFECT_LIST_ERROR | asc::DEFECT_LIST_NOT_FOUND,
        ) => DeviceReadiness::Ready,
        (sense_key::ABORTED_COMMAND, _) => DeviceReadiness::Retry,
        _ => DeviceReadiness::Error,
    }
}

/// Result of one probe command after local busy retries
enum ProbeReply {
    Completed(ScsiIoReply),
    TimedOut,
    Aborted,
}

/// REPORT LUNS allocation length
const REPORT_LUNS_LEN: u32 = 8 + 8 * 256;
/// Standard INQUIRY allocation length
const INQUIRY_LEN: u16 = 36;
/// Attempts at REPORT LUNS before falling back to LUN 0
const REPORT_LUNS_ATTEMPTS: usize = 3;

impl Adapter {
    fn probe_command(&self, handle: DeviceHandle, lun: Lun, cdb: Cdb, data_in_len: u32, hidden: bool) -> ProbeReply {
        let mut busy = 0u8;
        loop {
            let request = Request::ScsiIo(ScsiIoRequest {
                handle,
                lun,
                cdb,
                data_in_len,
                raid_passthrough: hidden,
                timeout_secs: self.config().probe_io_timeout_secs,
            });
            match self.send_sync(SlotPriority::Normal, request, self.config().probe_timeout_ms()) {
                Ok(Reply::ScsiIo(reply)) => {
                    let is_busy = reply.ioc_status.is_success()
                        && matches!(reply.scsi_status, ScsiStatus::Busy | ScsiStatus::TaskSetFull);
                    if is_busy && busy < self.config().busy_retry_count {
                        busy += 1;
                        self.clock().delay_ms(self.config().busy_retry_delay_ms);
                        continue;
                    }
                    return ProbeReply::Completed(reply);
                }
                Ok(other) => {
                    log::error!("{}: unexpected reply to probe: {:?}", self.name(), other);
                    return ProbeReply::Aborted;
                }
                Err(SyncError::TimedOut) => return ProbeReply::TimedOut,
                Err(SyncError::NoSlot | SyncError::Submit(_) | SyncError::Reset) => return ProbeReply::Aborted,
            }
        }
    }

    /// Reset issued after a probe command timed out
    fn probe_reset(&self, handle: DeviceHandle, lun: Lun) {
        let method = self.config().reset_method;
        let params = TmRequestParams::new(handle, method.task_type(), self.config().tm_timeout_secs).with_lun(lun);
        if let Err(err) = self.issue_tm(params) {
            hba_debug!(self, PROBE, "{}: probe reset of handle {} failed: {}", self.name(), handle, err);
        }
    }

    fn unit_ready_once(&self, handle: DeviceHandle, lun: Lun, hidden: bool) -> Option<DeviceReadiness> {
        match self.probe_command(handle, lun, Cdb::test_unit_ready(), 0, hidden) {
            ProbeReply::Completed(reply) => Some(classify_tur(&reply)),
            ProbeReply::TimedOut => None,
            ProbeReply::Aborted => Some(DeviceReadiness::Retry),
        }
    }

    /// Spin the unit up, then test it once more
    fn start_and_retest(&self, handle: DeviceHandle, lun: Lun, hidden: bool, stop_first: bool) -> DeviceReadiness {
        if stop_first {
            hba_debug!(self, PROBE, "{}: handle {} lun {} low power, stopping", self.name(), handle, lun);
            if !matches!(self.probe_command(handle, lun, Cdb::start_stop_unit(false), 0, hidden), ProbeReply::Completed(_)) {
                return DeviceReadiness::Retry;
            }
        }
        hba_debug!(self, PROBE, "{}: handle {} lun {} starting unit", self.name(), handle, lun);
        match self.probe_command(handle, lun, Cdb::start_stop_unit(true), 0, hidden) {
            ProbeReply::Completed(_) => {}
            ProbeReply::TimedOut => {
                self.probe_reset(handle, lun);
                return DeviceReadiness::Retry;
            }
            ProbeReply::Aborted => return DeviceReadiness::Retry,
        }
        match self.unit_ready_once(handle, lun, hidden) {
            Some(readiness) => readiness,
            None => {
                self.probe_reset(handle, lun);
                DeviceReadiness::Retry
            }
        }
    }

    /// Probe one logical unit
    ///
    /// A unit that needs starting gets exactly one START STOP UNIT per call.
    /// Timeouts reset the device before the next attempt, up to
    /// `command_retry_count` attempts; a host reset during the probe ends it
    /// with `Retry`.
    pub fn wait_for_device_ready(&self, handle: DeviceHandle, lun: Lun, hidden: bool) -> DeviceReadiness {
        let generation = self.state.generation();
        let mut attempts = 0u8;
        loop {
            if self.state.is_recovering() || self.state.generation() != generation {
                return DeviceReadiness::Retry;
            }
            let readiness = match self.unit_ready_once(handle, lun, hidden) {
                Some(DeviceReadiness::NeedsStartUnit) => self.start_and_retest(handle, lun, hidden, false),
                Some(DeviceReadiness::NeedsStopUnit) => self.start_and_retest(handle, lun, hidden, true),
                Some(readiness) => readiness,
                None => {
                    attempts += 1;
                    log::info!(
                        "{}: probe of handle {} lun {} timed out ({}/{})",
                        self.name(),
                        handle,
                        lun,
                        attempts,
                        self.config().command_retry_count
                    );
                    if attempts >= self.config().command_retry_count {
                        return DeviceReadiness::Retry;
                    }
                    self.probe_reset(handle, lun);
                    continue;
                }
            };
            hba_debug!(self, PROBE, "{}: handle {} lun {}: {:?}", self.name(), handle, lun, readiness);
            return readiness;
        }
    }

    /// Logical units to probe, at most `max_lun`; `[0]` when the device
    /// reports none or does not support REPORT LUNS
    pub fn report_luns(&self, handle: DeviceHandle, hidden: bool) -> Result<Vec<Lun>, DeviceReadiness> {
        for _ in 0..REPORT_LUNS_ATTEMPTS {
            match self.probe_command(handle, 0, Cdb::report_luns(REPORT_LUNS_LEN), REPORT_LUNS_LEN, hidden) {
                ProbeReply::Completed(reply) => {
                    if reply.ioc_status.is_success() && reply.scsi_status == ScsiStatus::Good {
                        let mut luns: Vec<Lun> = scsi::parse_report_luns(&reply.data)
                            .into_iter()
                            .filter(|lun| *lun <= self.config().max_lun)
                            .collect();
                        if luns.is_empty() {
                            luns.push(0);
                        }
                        return Ok(luns);
                    }
                    let unsupported = reply
                        .sense
                        .is_some_and(|s| s.key == sense_key::ILLEGAL_REQUEST);
                    if unsupported || reply.ioc_status == IocStatus::ScsiDeviceNotThere {
                        break;
                    }
                }
                ProbeReply::TimedOut => {
                    self.probe_reset(handle, 0);
                    return Err(DeviceReadiness::Retry);
                }
                ProbeReply::Aborted => return Err(DeviceReadiness::Retry),
            }
        }
        Ok(vec![0])
    }

    /// Probe a target: REPORT LUNS, then the first LUN, then the others if
    /// the first one is unusable
    pub fn wait_for_target_ready(&self, handle: DeviceHandle, hidden: bool) -> DeviceReadiness {
        let luns = match self.report_luns(handle, hidden) {
            Ok(luns) => luns,
            Err(readiness) => return readiness,
        };
        let mut readiness = DeviceReadiness::Error;
        for lun in luns {
            readiness = self.wait_for_device_ready(handle, lun, hidden);
            if readiness != DeviceReadiness::Error {
                break;
            }
        }
        readiness
    }

    /// Standard INQUIRY identity, if the device answers
    pub fn inquiry(&self, handle: DeviceHandle, hidden: bool) -> Option<InquiryIdentity> {
        match self.probe_command(handle, 0, Cdb::inquiry(INQUIRY_LEN), u32::from(INQUIRY_LEN), hidden) {
            ProbeReply::Completed(reply) if reply.ioc_status.is_success() && reply.scsi_status == ScsiStatus::Good => {
                InquiryIdentity::parse(&reply.data)
            }
            _ => None,
        }
    }
}

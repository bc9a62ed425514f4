//! # Removal Handshake
//!
//! A device the firmware reports gone is torn down in two firmware round
//! trips: a target reset, then an IO-unit "remove device" directive. Only
//! after the directive succeeds is the registry entry detached. A rejected
//! directive restarts the sequence from the target reset, a bounded number
//! of times; after that the entry is force-detached.
//!
//! The handshake runs from the reply path and never blocks. When no request
//! frame is free the stage is parked on one of three delayed lists, one per
//! [`RemovalPurpose`], and retried when a frame is returned. The lists are
//! serviced round-robin so one backlog cannot starve the others.

use crate::adapter::Adapter;
use crate::host::DeviceClass;
use crate::registry::{DeviceRef, PcieDevice, RaidDevice, SasDevice, TrackedDevice};
use crate::router::ReplyOwner;
use crate::stats::AdapterStats;
use alloc::collections::{BTreeMap, VecDeque};
use hba_hal::mpi::{
    IoUnitControlRequest, IoUnitOperation, Reply, Request, SlotPriority, TaskType, TmRequest,
};
use hba_hal::DeviceHandle;
use spin::Mutex;

/// Why a device is being removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalPurpose {
    /// An end device left the topology
    Device,
    /// A RAID volume was deleted
    Volume,
    /// A hidden member disk was deleted
    Internal,
}

impl RemovalPurpose {
    const COUNT: usize = 3;

    const fn index(self) -> usize {
        match self {
            Self::Device => 0,
            Self::Volume => 1,
            Self::Internal => 2,
        }
    }

    /// Short name for diagnostics
    pub const fn name(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Volume => "volume",
            Self::Internal => "internal",
        }
    }
}

/// What `initiate_device_removal` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalStart {
    /// The target reset was posted
    Started,
    /// No frame was free; parked on the delayed list
    Deferred,
    /// A handshake for this handle is already running
    AlreadyInProgress,
}

/// Stage awaiting a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    TargetReset,
    RemoveDirective,
}

#[derive(Debug, Clone, Copy)]
struct ActiveRemoval {
    purpose: RemovalPurpose,
    stage: Stage,
    retries: u8,
    device: Option<(DeviceClass, DeviceRef)>,
}

#[derive(Debug, Default)]
struct Inner {
    active: BTreeMap<DeviceHandle, ActiveRemoval>,
    delayed: [VecDeque<DeviceHandle>; RemovalPurpose::COUNT],
    cursor: usize,
}

/// Handshakes in flight and parked
#[derive(Debug, Default)]
pub struct RemovalHandshakes {
    inner: Mutex<Inner>,
}

impl RemovalHandshakes {
    /// No handshakes
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a handshake for `handle` is running
    pub fn is_active(&self, handle: DeviceHandle) -> bool {
        self.inner.lock().active.contains_key(&handle)
    }

    /// Number of running handshakes
    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    /// Number of parked stages for one purpose
    pub fn deferred_count(&self, purpose: RemovalPurpose) -> usize {
        self.inner.lock().delayed[purpose.index()].len()
    }

    /// Drop everything; the controller reset forgot it all
    pub fn clear_for_reset(&self) -> usize {
        let mut inner = self.inner.lock();
        let cleared = inner.active.len();
        inner.active.clear();
        for list in &mut inner.delayed {
            list.clear();
        }
        cleared
    }

    fn begin(&self, handle: DeviceHandle, purpose: RemovalPurpose, device: Option<(DeviceClass, DeviceRef)>) -> bool {
        let mut inner = self.inner.lock();
        if inner.active.contains_key(&handle) {
            return false;
        }
        inner.active.insert(
            handle,
            ActiveRemoval {
                purpose,
                stage: Stage::TargetReset,
                retries: 0,
                device,
            },
        );
        true
    }

    pub(crate) fn stage(&self, handle: DeviceHandle) -> Option<Stage> {
        self.inner.lock().active.get(&handle).map(|a| a.stage)
    }

    fn park(&self, handle: DeviceHandle, front: bool) {
        let mut inner = self.inner.lock();
        let Some(purpose) = inner.active.get(&handle).map(|a| a.purpose) else {
            return;
        };
        let list = &mut inner.delayed[purpose.index()];
        if front {
            list.push_front(handle);
        } else {
            list.push_back(handle);
        }
    }

    /// Next parked handle, rotating between purposes
    fn pop_deferred(&self) -> Option<DeviceHandle> {
        let mut inner = self.inner.lock();
        for offset in 0..RemovalPurpose::COUNT {
            let index = (inner.cursor + offset) % RemovalPurpose::COUNT;
            if let Some(handle) = inner.delayed[index].pop_front() {
                inner.cursor = (index + 1) % RemovalPurpose::COUNT;
                return Some(handle);
            }
        }
        None
    }

    fn advance(&self, handle: DeviceHandle) {
        if let Some(active) = self.inner.lock().active.get_mut(&handle) {
            active.stage = Stage::RemoveDirective;
        }
    }

    /// Restart from the target reset if retries remain
    fn retry(&self, handle: DeviceHandle, max_retries: u8) -> Option<u8> {
        let mut inner = self.inner.lock();
        let active = inner.active.get_mut(&handle)?;
        if active.retries >= max_retries {
            return None;
        }
        active.retries += 1;
        active.stage = Stage::TargetReset;
        Some(active.retries)
    }

    fn finish(&self, handle: DeviceHandle) -> Option<ActiveRemoval> {
        let mut inner = self.inner.lock();
        for list in &mut inner.delayed {
            list.retain(|h| *h != handle);
        }
        inner.active.remove(&handle)
    }
}

impl Adapter {
    fn claim_for_removal<T: TrackedDevice>(&self, handle: DeviceHandle) -> Option<(DeviceClass, DeviceRef)> {
        let dev = self.registry.find_by_handle::<T>(handle)?;
        if let Some(target) = dev.state().target() {
            target.mark_deleted();
            self.block_target(&target);
        }
        self.registry.find_ref(&dev).map(|r| (T::CLASS, r))
    }

    /// Start the two-step removal of whatever holds `handle`
    ///
    /// The device's target is marked deleted and blocked first, so nothing
    /// new is admitted. Handles the registry does not know still go
    /// through the handshake so the firmware can release them.
    pub fn initiate_device_removal(&self, handle: DeviceHandle, purpose: RemovalPurpose) -> RemovalStart {
        if self.handshakes.is_active(handle) {
            return RemovalStart::AlreadyInProgress;
        }
        let device = self
            .claim_for_removal::<SasDevice>(handle)
            .or_else(|| self.claim_for_removal::<PcieDevice>(handle))
            .or_else(|| self.claim_for_removal::<RaidDevice>(handle));
        if !self.handshakes.begin(handle, purpose, device) {
            return RemovalStart::AlreadyInProgress;
        }
        AdapterStats::bump(&self.stats.handshakes_started);
        hba_debug!(self, HANDSHAKE, "{}: {} removal of handle {} started", self.name(), purpose.name(), handle);

        if self.send_stage(handle, false) {
            RemovalStart::Started
        } else {
            RemovalStart::Deferred
        }
    }

    /// Post the current stage of a handshake; `false` if it was parked
    fn send_stage(&self, handle: DeviceHandle, front: bool) -> bool {
        let Some(stage) = self.handshakes.stage(handle) else {
            return true;
        };
        let (priority, request) = match stage {
            Stage::TargetReset => (
                SlotPriority::HighPriority,
                Request::TaskManagement(TmRequest {
                    handle,
                    lun: 0,
                    task_type: TaskType::TargetReset,
                    task_smid: None,
                    for_removal: true,
                }),
            ),
            Stage::RemoveDirective => (
                SlotPriority::Normal,
                Request::IoUnitControl(IoUnitControlRequest {
                    operation: IoUnitOperation::RemoveDevice,
                    handle,
                }),
            ),
        };

        let Some(smid) = self.transport().get_request_slot(priority) else {
            self.handshakes.park(handle, front);
            AdapterStats::bump(&self.stats.handshakes_deferred);
            hba_debug!(self, HANDSHAKE, "{}: no frame for handle {} ({:?}), parked", self.name(), handle, stage);
            return false;
        };
        self.router.register(smid, ReplyOwner::Handshake(handle));
        if let Err(err) = self.transport().submit_request(smid, request) {
            self.router.take(smid);
            self.transport().free_request_slot(smid);
            self.handshakes.park(handle, front);
            log::warn!("{}: removal stage for handle {} not posted: {}", self.name(), handle, err);
            return false;
        }
        true
    }

    /// Reply to a handshake stage (reply path)
    pub(crate) fn handshake_reply(&self, handle: DeviceHandle, reply: Reply) {
        let Some(stage) = self.handshakes.stage(handle) else {
            return;
        };
        match (stage, reply) {
            (Stage::TargetReset, Reply::TaskManagement(tm)) => {
                if !tm.ioc_status.is_success() || !tm.response_code.is_success() {
                    hba_debug!(
                        self,
                        HANDSHAKE,
                        "{}: removal target reset of handle {}: {:?}/{:?}",
                        self.name(),
                        handle,
                        tm.ioc_status,
                        tm.response_code
                    );
                }
                self.handshakes.advance(handle);
                self.send_stage(handle, false);
            }
            (Stage::RemoveDirective, Reply::IoUnitControl(ctl)) if ctl.ioc_status.is_success() => {
                AdapterStats::bump(&self.stats.handshakes_completed);
                hba_debug!(self, HANDSHAKE, "{}: handle {} released by firmware", self.name(), handle);
                self.finish_removal(handle);
            }
            (Stage::RemoveDirective, Reply::IoUnitControl(ctl)) => {
                match self.handshakes.retry(handle, self.config().handshake_retries) {
                    Some(round) => {
                        log::info!(
                            "{}: remove device for handle {} rejected ({:?}), retry {}",
                            self.name(),
                            handle,
                            ctl.ioc_status,
                            round
                        );
                        self.send_stage(handle, false);
                    }
                    None => {
                        AdapterStats::bump(&self.stats.handshakes_exhausted);
                        log::warn!(
                            "{}: remove device for handle {} failed after {} retries, detaching",
                            self.name(),
                            handle,
                            self.config().handshake_retries
                        );
                        self.finish_removal(handle);
                    }
                }
            }
            (stage, other) => {
                log::error!("{}: handle {} in {:?} got {:?}", self.name(), handle, stage, other);
            }
        }
    }

    fn finish_removal(&self, handle: DeviceHandle) {
        let Some(active) = self.handshakes.finish(handle) else {
            return;
        };
        if let Some((class, r)) = active.device {
            self.detach_by_ref(class, r);
        }
    }

    /// Post parked stages while frames are available
    pub(crate) fn check_pending_removals(&self) {
        while let Some(handle) = self.handshakes.pop_deferred() {
            if !self.send_stage(handle, true) {
                break;
            }
        }
    }
}

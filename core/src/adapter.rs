//! # Adapter
//!
//! One [`Adapter`] per controller. It owns every per-concern state object
//! (registry, reply router, TM slot, removal handshakes, event queue, state
//! holder) and exposes the entry points the embedding driver calls:
//!
//! - [`Adapter::process_reply_queue`] from the interrupt handler
//! - [`Adapter::on_firmware_event`] from the event notification path
//! - [`Adapter::process_fw_events`] from the event worker
//! - [`Adapter::queue_scsi_io`] and the `eh_*` hooks from the upstream layer

use crate::config::EngineConfig;
use crate::discovery::BootCandidates;
use crate::error::{HbaError, HbaResult};
use crate::fw_event::{EventDisposition, FwEvent, FwEventData, FwEventQueue};
use crate::host::{DeviceClass, ScsiHost, TargetFlags, TargetPrivate};
use crate::registry::{
    DeviceRef, DeviceRegistry, Membership, PcieDevice, RaidDevice, SasDevice, TrackedDevice,
};
use crate::reset::{AdapterState, StateHolder};
use crate::router::{ReplyOwner, ReplyRouter, TrackedIo};
use crate::stats::{AdapterStats, StatsSnapshot};
use crate::tm::handshake::RemovalHandshakes;
use crate::tm::TmSlot;
use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use hba_hal::config_page::{ConfigPage, PageRequest};
use hba_hal::firmware::ControllerTransport;
use hba_hal::interrupts::{Completion, WaitResult};
use hba_hal::mpi::{
    IocStatus, Reply, ReplyDescriptor, Request, ScsiIoReply, ScsiIoRequest, SlotPriority,
};
use hba_hal::scsi::Cdb;
use hba_hal::timer::Clock;
use hba_hal::{DeviceHandle, HalError, Lun, PortId, Smid};
use spin::Mutex;

/// Why a synchronous request produced no reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncError {
    /// No request frame was free
    NoSlot,
    /// The transport refused the request
    Submit(HalError),
    /// The bounded wait elapsed
    TimedOut,
    /// A host reset cancelled the request
    Reset,
}

/// Controller instance
pub struct Adapter {
    name: String,
    config: EngineConfig,
    transport: Arc<dyn ControllerTransport>,
    clock: Arc<dyn Clock>,
    host: Arc<dyn ScsiHost>,
    pub(crate) state: StateHolder,
    pub(crate) registry: DeviceRegistry,
    pub(crate) router: ReplyRouter,
    pub(crate) tm: TmSlot,
    pub(crate) handshakes: RemovalHandshakes,
    pub(crate) events: FwEventQueue,
    pub(crate) boot: Mutex<BootCandidates>,
    pub(crate) stats: AdapterStats,
    pub(crate) reset_lock: Mutex<()>,
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("name", &self.name)
            .field("state", &self.state.get())
            .field("loading", &self.state.is_loading())
            .field("devices", &self.registry.counts())
            .field("events", &self.events.len())
            .finish()
    }
}

impl Adapter {
    /// Create an adapter in the loading state
    pub fn new(
        name: impl Into<String>,
        config: EngineConfig,
        transport: Arc<dyn ControllerTransport>,
        clock: Arc<dyn Clock>,
        host: Arc<dyn ScsiHost>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            transport,
            clock,
            host,
            state: StateHolder::new(),
            registry: DeviceRegistry::new(),
            router: ReplyRouter::new(),
            tm: TmSlot::new(),
            handshakes: RemovalHandshakes::new(),
            events: FwEventQueue::new(),
            boot: Mutex::new(BootCandidates::default()),
            stats: AdapterStats::new(),
            reset_lock: Mutex::new(()),
        }
    }

    /// Adapter name used as the log prefix
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Device registry
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Firmware event queue
    pub fn events(&self) -> &FwEventQueue {
        &self.events
    }

    /// Counter snapshot
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Recovery state
    pub fn state(&self) -> AdapterState {
        self.state.get()
    }

    /// Whether initial discovery is still running
    pub fn is_loading(&self) -> bool {
        self.state.is_loading()
    }

    pub(crate) fn transport(&self) -> &dyn ControllerTransport {
        &*self.transport
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    pub(crate) fn host(&self) -> &dyn ScsiHost {
        &*self.host
    }

    /// Bring the adapter up: read the host node and enclosures, then ask
    /// the firmware to start discovery
    pub fn start(&self) -> HbaResult<()> {
        self.state.set_loading(true);
        self.refresh_host_node()?;
        self.load_enclosures();
        self.transport.send_port_enable()?;
        log::info!("{}: port enable sent, discovery started", self.name);
        Ok(())
    }

    pub(crate) fn read_page(&self, request: PageRequest) -> HbaResult<ConfigPage> {
        Ok(self.transport.read_config_page(request)?)
    }

    /// Device identity port: the controller port with multipath, else any
    pub(crate) fn resolve_port(&self, port: PortId) -> PortId {
        if self.config.multipath_on_hba {
            port
        } else {
            PortId::ANY
        }
    }

    // =========================================================================
    // REPLY PATH
    // =========================================================================

    /// Drain the reply queue (interrupt handler body)
    pub fn process_reply_queue(&self) -> usize {
        let mut handled = 0;
        while let Some(desc) = self.transport.poll_reply() {
            self.dispatch_reply(desc);
            handled += 1;
        }
        handled
    }

    fn dispatch_reply(&self, desc: ReplyDescriptor) {
        let ReplyDescriptor { smid, reply } = desc;
        match self.router.take(smid) {
            Some(ReplyOwner::Sync(completion)) => {
                // A waiter that already gave up no longer frees the frame
                if !completion.complete(reply) {
                    log::trace!("{}: late reply for smid {}", self.name, smid);
                    self.release_slot(smid);
                }
            }
            Some(ReplyOwner::Abandoned) => {
                hba_debug!(self, REPLY, "{}: timed-out smid {} returned", self.name, smid);
                self.release_slot(smid);
            }
            Some(ReplyOwner::UpstreamIo(_)) => {
                self.release_slot(smid);
                match reply {
                    Reply::ScsiIo(io) => self.host.io_done(smid, &io),
                    other => log::error!(
                        "{}: smid {} expected a scsi io reply, got {:?}",
                        self.name,
                        smid,
                        other
                    ),
                }
            }
            Some(ReplyOwner::Handshake(handle)) => {
                self.transport.free_request_slot(smid);
                self.handshake_reply(handle, reply);
                self.check_pending_removals();
            }
            None => log::trace!("{}: stray reply for smid {}", self.name, smid),
        }
    }

    /// Return a request frame and give parked handshakes a chance at it
    pub(crate) fn release_slot(&self, smid: Smid) {
        self.transport.free_request_slot(smid);
        self.check_pending_removals();
    }

    /// Post a request and block until its reply, a timeout or a reset
    pub(crate) fn send_sync(
        &self,
        priority: SlotPriority,
        request: Request,
        timeout_ms: u64,
    ) -> Result<Reply, SyncError> {
        let smid = self
            .transport
            .get_request_slot(priority)
            .ok_or(SyncError::NoSlot)?;
        let completion = Arc::new(Completion::new());
        completion.arm();
        self.router.register(smid, ReplyOwner::Sync(completion.clone()));

        if let Err(err) = self.transport.submit_request(smid, request) {
            self.router.take(smid);
            self.release_slot(smid);
            return Err(SyncError::Submit(err));
        }

        match completion.wait(&*self.clock, timeout_ms, || {
            self.process_reply_queue();
        }) {
            WaitResult::Completed(reply) => {
                self.release_slot(smid);
                Ok(reply)
            }
            // The firmware still owns the frame; the late reply or a reset
            // returns it
            WaitResult::TimedOut => {
                self.router.abandon(smid, &completion);
                Err(SyncError::TimedOut)
            }
            // The reset reclaimed every frame
            WaitResult::Reset => Err(SyncError::Reset),
        }
    }

    // =========================================================================
    // UPSTREAM ADMISSION
    // =========================================================================

    /// Admit and post an upstream command
    pub fn queue_scsi_io(
        &self,
        target: &TargetPrivate,
        lun: Lun,
        cdb: Cdb,
        data_in_len: u32,
    ) -> HbaResult<Smid> {
        if !self.state.admits_io() {
            return Err(HbaError::HostBusy);
        }
        if target.is_deleted() {
            return Err(HbaError::DeviceGone);
        }
        if target.is_blocked() || target.tm_busy() {
            return Err(HbaError::DeviceBlocked);
        }

        let handle = target.handle();
        let smid = self
            .transport
            .get_request_slot(SlotPriority::Normal)
            .ok_or(HbaError::HostBusy)?;
        self.router.register(
            smid,
            ReplyOwner::UpstreamIo(TrackedIo {
                handle,
                target: target.id(),
                lun,
            }),
        );
        let request = Request::ScsiIo(ScsiIoRequest {
            handle,
            lun,
            cdb,
            data_in_len,
            raid_passthrough: false,
            timeout_secs: self.config.probe_io_timeout_secs,
        });
        if let Err(err) = self.transport.submit_request(smid, request) {
            self.router.take(smid);
            self.release_slot(smid);
            return Err(err.into());
        }
        Ok(smid)
    }

    /// Complete every upstream command a reset swept away
    pub(crate) fn fail_swept_io(&self, smids: &[Smid]) {
        let reply = ScsiIoReply::terminated(IocStatus::ScsiIocTerminated);
        for smid in smids {
            self.host.io_done(*smid, &reply);
        }
    }

    // =========================================================================
    // FIRMWARE EVENTS
    // =========================================================================

    /// Accept a firmware notification (interrupt context)
    ///
    /// Superseded queued events are marked ignored before the new one is
    /// queued. Returns `false` if the queue is suspended for a reset.
    pub fn on_firmware_event(&self, mut data: FwEventData) -> bool {
        match &mut data {
            FwEventData::SasTopologyChange(list) => self.check_topo_delete_events(list),
            FwEventData::PcieTopologyChange(list) => self.check_pcie_topo_delete_events(list),
            _ => {}
        }
        let name = data.name();
        match self.events.enqueue(data) {
            Some(event) => {
                AdapterStats::bump(&self.stats.events_queued);
                hba_debug!(self, EVENTS, "{}: queued {} (id {})", self.name, name, event.id());
                true
            }
            None => {
                hba_debug!(self, EVENTS, "{}: dropped {} while suspended", self.name, name);
                false
            }
        }
    }

    /// Run queued events until none is due (event worker body)
    ///
    /// Returns the number of events run to completion. A second caller
    /// while a worker is active returns 0 immediately.
    pub fn process_fw_events(&self) -> usize {
        let mut processed = 0;
        loop {
            if !self.events.try_begin_work() {
                return processed;
            }
            while let Some(event) = self.events.pop_ready(self.clock.now_ms()) {
                if self.state.is_recovering() {
                    break;
                }
                if event.is_ignored() {
                    AdapterStats::bump(&self.stats.events_ignored);
                    hba_debug!(self, EVENT_WORK_TASK, "{}: skipping ignored event {}", self.name, event.id());
                    continue;
                }
                self.events.set_current(Some(event.clone()));
                let disposition = self.handle_fw_event(&event);
                self.events.set_current(None);

                match disposition {
                    EventDisposition::Done => {
                        processed += 1;
                        AdapterStats::bump(&self.stats.events_processed);
                    }
                    EventDisposition::Requeue => {
                        let due = self.clock.now_ms() + self.config.requeue_delay_ms;
                        if self.events.requeue_delayed(event.clone(), due) {
                            AdapterStats::bump(&self.stats.events_requeued);
                            hba_debug!(self, EVENT_WORK_TASK, "{}: event {} requeued for {}ms", self.name, event.id(), due);
                        }
                    }
                }
            }
            self.events.end_work();
            if self.state.is_recovering() || !self.events.has_ready(self.clock.now_ms()) {
                return processed;
            }
        }
    }

    fn handle_fw_event(&self, event: &Arc<FwEvent>) -> EventDisposition {
        let data = event.data();
        hba_debug!(self, EVENT_WORK_TASK, "{}: running {} (id {})", self.name, data.name(), event.id());
        match data {
            FwEventData::SasTopologyChange(_) => self.process_sas_topology_change(event),
            FwEventData::PcieTopologyChange(_) => self.process_pcie_topology_change(event),
            FwEventData::SasDeviceStatusChange(change) => {
                self.process_device_status_change(&change);
                EventDisposition::Done
            }
            FwEventData::EnclosureStatusChange(change) => {
                self.process_enclosure_status_change(&change);
                EventDisposition::Done
            }
            FwEventData::SasDiscovery(discovery) => {
                self.process_discovery_event(&discovery);
                EventDisposition::Done
            }
            FwEventData::IrConfigChange(list) => {
                self.process_ir_config_change(&list);
                EventDisposition::Done
            }
            FwEventData::IrVolume(volume) => {
                self.process_ir_volume(&volume);
                EventDisposition::Done
            }
            FwEventData::DeviceRescan { class, handle } => self.process_device_rescan(event, class, handle),
        }
    }

    // =========================================================================
    // TARGET PLUMBING
    // =========================================================================

    /// Upstream target of whichever device currently holds `handle`
    pub fn target_by_handle(&self, handle: DeviceHandle) -> Option<Arc<TargetPrivate>> {
        self.registry
            .find_by_handle::<SasDevice>(handle)
            .and_then(|d| d.state().target())
            .or_else(|| {
                self.registry
                    .find_by_handle::<PcieDevice>(handle)
                    .and_then(|d| d.state().target())
            })
            .or_else(|| {
                self.registry
                    .find_by_handle::<RaidDevice>(handle)
                    .and_then(|d| d.state().target())
            })
    }

    /// Stop admission to a target and tell the upstream layer
    pub(crate) fn block_target(&self, target: &TargetPrivate) {
        if !target.set_blocked(true) {
            self.host.device_block(target.id());
        }
    }

    /// Resume admission to a target
    pub(crate) fn unblock_target(&self, target: &TargetPrivate) {
        if target.set_blocked(false) {
            self.host.device_unblock(target.id());
        }
    }

    /// Register a new device, staged while loading and exposed otherwise
    pub(crate) fn register_device<T: TrackedDevice>(&self, dev: Arc<T>) -> HbaResult<DeviceRef> {
        let membership = if self.state.is_loading() {
            Membership::Staging
        } else {
            Membership::Live
        };
        let r = self.registry.insert(dev.clone(), membership)?;
        hba_debug!(self, REGISTRY, "{}: {} {} inserted as {:?}", self.name, T::CLASS.name(), r, membership);
        AdapterStats::bump(&self.stats.devices_added);
        if membership == Membership::Live {
            if let Err(err) = self.expose_device(&dev, r) {
                self.registry.remove(&dev);
                AdapterStats::bump(&self.stats.devices_removed);
                return Err(err);
            }
        }
        Ok(r)
    }

    /// Create the upstream target for a registered device
    pub(crate) fn expose_device<T: TrackedDevice>(&self, dev: &Arc<T>, r: DeviceRef) -> HbaResult<()> {
        let state = dev.state();
        if state.is_hidden() || state.target().is_some() {
            return Ok(());
        }
        let id = self.registry.allocate_target_id(T::CLASS);
        let mut flags = state.flags().target_flags();
        if T::CLASS == DeviceClass::RaidVolume {
            flags |= TargetFlags::RAID_VOLUME;
        }
        let target = Arc::new(TargetPrivate::new(id, T::CLASS, dev.identity(), dev.handle(), flags, r));
        state.attach_target(target.clone());
        if let Err(err) = self.host.device_add(&target) {
            state.take_target();
            target.clear_device_ref();
            log::warn!(
                "{}: upstream refused {} device handle {}: {}",
                self.name,
                T::CLASS.name(),
                dev.handle(),
                err
            );
            return Err(err);
        }
        log::info!(
            "{}: {} device added: handle({}), identity(0x{:016x}), target({})",
            self.name,
            T::CLASS.name(),
            dev.handle(),
            dev.identity(),
            id
        );
        Ok(())
    }

    /// Withdraw a device's upstream target without unregistering it
    pub(crate) fn hide_device<T: TrackedDevice>(&self, dev: &Arc<T>) {
        if let Some(target) = dev.state().take_target() {
            target.mark_deleted();
            target.clear_device_ref();
            self.host.device_remove(T::CLASS, target.id());
        }
    }

    /// Unregister a device and detach its upstream target
    ///
    /// Returns `false` if the device was already gone.
    pub(crate) fn detach_device<T: TrackedDevice>(&self, dev: &Arc<T>) -> bool {
        if self.registry.remove(dev).is_none() {
            return false;
        }
        AdapterStats::bump(&self.stats.devices_removed);
        self.hide_device(dev);
        log::info!(
            "{}: {} device removed: handle({}), identity(0x{:016x})",
            self.name,
            T::CLASS.name(),
            dev.handle(),
            dev.identity()
        );
        true
    }

    /// Unregister a SAS device and drop its port on the parent node
    pub(crate) fn detach_sas_device(&self, dev: &Arc<SasDevice>) -> bool {
        if !self.detach_device(dev) {
            return false;
        }
        self.registry.with_nodes(|nodes| {
            nodes.with_links(dev.parent_address, |links| links.detach(dev.sas_address, dev.port))
        });
        true
    }

    /// Detach whatever device of `class` the reference still resolves to
    pub(crate) fn detach_by_ref(&self, class: DeviceClass, r: DeviceRef) -> bool {
        match class {
            DeviceClass::Sas => self
                .registry
                .resolve::<SasDevice>(r)
                .is_some_and(|dev| self.detach_sas_device(&dev)),
            DeviceClass::Pcie => self
                .registry
                .resolve::<PcieDevice>(r)
                .is_some_and(|dev| self.detach_device(&dev)),
            DeviceClass::RaidVolume => self
                .registry
                .resolve::<RaidDevice>(r)
                .is_some_and(|dev| self.detach_device(&dev)),
        }
    }
}

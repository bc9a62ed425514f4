//! # Reset and Recovery Coordinator
//!
//! Full adapter reset moves the engine through
//! `Normal → ResetInProgress → Reconciling → Normal`:
//!
//! 1. admission to every target is blocked, producers are suspended and
//!    queued events are cancelled
//! 2. every outstanding request is swept: waiters wake with a reset result,
//!    upstream commands complete as terminated, handshakes are dropped
//! 3. the controller is reset
//! 4. every device class is re-enumerated and matched by identity, never by
//!    handle; whatever did not answer is detached without a handshake
//! 5. admission resumes
//!
//! A failed controller reset leaves the adapter in [`AdapterState::Fault`].

use crate::adapter::Adapter;
use crate::error::{HbaError, HbaResult};
use crate::fw_event::FwEventData;
use crate::host::{DeviceClass, TargetPrivate};
use crate::registry::{DeviceFlags, Identified, PcieDevice, RaidDevice, SasDevice, TrackedDevice};
use crate::stats::AdapterStats;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use hba_hal::config_page::{
    ExpanderPage0, PcieDevicePage0, PhysDiskPage0, RaidVolumePage1, SasDeviceFlags, SasDevicePage0,
};
use hba_hal::firmware::IocState;
use hba_hal::timer::Deadline;
use hba_hal::DeviceHandle;
use spin::RwLock;

/// Recovery state of the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Admitting I/O
    Normal,
    /// Controller reset under way; nothing is admitted
    ResetInProgress,
    /// Matching the registry against a fresh enumeration
    Reconciling,
    /// The controller could not be reset
    Fault,
}

/// Why a host reset was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// A task-management request timed out
    TmTimeout,
    /// The doorbell stayed busy
    DoorbellBusy,
    /// The controller reported a fault code
    FaultState(u16),
    /// The controller is writing a coredump
    CoredumpState,
    /// The upstream layer asked for it
    HostRequest,
    /// A readiness probe could not recover a device
    ProbeTimeout,
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TmTimeout => write!(f, "task management timeout"),
            Self::DoorbellBusy => write!(f, "doorbell busy"),
            Self::FaultState(code) => write!(f, "fault state 0x{:04x}", code),
            Self::CoredumpState => write!(f, "coredump state"),
            Self::HostRequest => write!(f, "host request"),
            Self::ProbeTimeout => write!(f, "probe timeout"),
        }
    }
}

/// The one authoritative holder of adapter-wide state
#[derive(Debug)]
pub struct StateHolder {
    state: RwLock<AdapterState>,
    loading: AtomicBool,
    discovery_active: AtomicBool,
    reset_generation: AtomicU64,
}

impl StateHolder {
    /// Normal state, loading
    pub const fn new() -> Self {
        Self {
            state: RwLock::new(AdapterState::Normal),
            loading: AtomicBool::new(true),
            discovery_active: AtomicBool::new(false),
            reset_generation: AtomicU64::new(0),
        }
    }

    /// Current state
    pub fn get(&self) -> AdapterState {
        *self.state.read()
    }

    pub(crate) fn set(&self, state: AdapterState) {
        *self.state.write() = state;
    }

    /// Whether upstream commands may be admitted
    pub fn admits_io(&self) -> bool {
        self.get() == AdapterState::Normal
    }

    /// Whether a reset or its reconciliation is running
    pub fn is_recovering(&self) -> bool {
        matches!(self.get(), AdapterState::ResetInProgress | AdapterState::Reconciling)
    }

    /// Whether initial discovery is still running
    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    pub(crate) fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::Release);
    }

    /// Whether the firmware reported discovery in progress
    pub fn discovery_active(&self) -> bool {
        self.discovery_active.load(Ordering::Acquire)
    }

    pub(crate) fn set_discovery_active(&self, active: bool) {
        self.discovery_active.store(active, Ordering::Release);
    }

    /// Number of resets started so far
    pub fn generation(&self) -> u64 {
        self.reset_generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) {
        self.reset_generation.fetch_add(1, Ordering::AcqRel);
    }
}

impl Default for StateHolder {
    fn default() -> Self {
        Self::new()
    }
}

/// A registry entry matched during reconciliation whose handle moved
struct HandleUpdate<T> {
    dev: Arc<T>,
    handle: DeviceHandle,
}

/// Fresh enumeration of one class, split against the registry
struct Sweep<T> {
    moved: Vec<HandleUpdate<T>>,
    new: Vec<DeviceHandle>,
}

impl<T> Default for Sweep<T> {
    fn default() -> Self {
        Self { moved: Vec::new(), new: Vec::new() }
    }
}

impl Adapter {
    /// Reset the controller and reconcile the registry
    ///
    /// Concurrent callers serialize; a caller that waited while another
    /// reset ran returns without resetting again.
    pub fn hard_reset(&self, reason: ResetReason) -> HbaResult<()> {
        let generation = self.state.generation();
        let _guard = self.reset_lock.lock();
        if self.state.generation() != generation {
            log::info!("{}: reset ({}) already handled", self.name(), reason);
            return Ok(());
        }

        log::info!("{}: host reset: {}", self.name(), reason);
        if reason == ResetReason::CoredumpState {
            self.wait_for_coredump();
        }

        self.state.set(AdapterState::ResetInProgress);
        self.state.bump_generation();
        self.for_each_target(|target| self.block_target(target));
        self.events.suspend();
        let dropped = self.events.cleanup();
        let sweep = self.router.abort_all_for_reset();
        let handshakes = self.handshakes.clear_for_reset();
        hba_debug!(
            self,
            RESET,
            "{}: dropped {} events, woke {} waiters, failing {} commands, cleared {} handshakes ({} in flight), reclaiming {} timed-out frames",
            self.name(),
            dropped,
            sweep.waiters_aborted,
            sweep.upstream.len(),
            handshakes,
            sweep.handshakes,
            sweep.abandoned
        );
        self.fail_swept_io(&sweep.upstream);

        if let Err(err) = self.transport().hard_reset() {
            self.state.set(AdapterState::Fault);
            AdapterStats::bump(&self.stats.reset_failures);
            log::error!("{}: host reset failed: {}", self.name(), err);
            return Err(HbaError::AdapterFatal(err));
        }

        self.state.set(AdapterState::Reconciling);
        let rescans = self.reconcile();

        self.state.set(AdapterState::Normal);
        self.events.resume();
        self.for_each_target(|target| {
            target.set_tm_busy(false);
            self.unblock_target(target);
        });
        for (class, handle) in rescans {
            if self.events.enqueue(FwEventData::DeviceRescan { class, handle }).is_some() {
                AdapterStats::bump(&self.stats.events_queued);
            }
        }
        AdapterStats::bump(&self.stats.resets);
        log::info!("{}: host reset complete", self.name());
        Ok(())
    }

    fn wait_for_coredump(&self) {
        let deadline = Deadline::after(self.clock(), u64::from(self.config().coredump_wait_secs) * 1000);
        while self.transport().adapter_state() == IocState::Coredump {
            if deadline.expired(self.clock()) {
                log::warn!("{}: coredump did not finish in {}s", self.name(), self.config().coredump_wait_secs);
                return;
            }
            self.clock().delay_ms(100);
        }
    }

    fn for_each_target(&self, mut f: impl FnMut(&TargetPrivate)) {
        fn collect<T: TrackedDevice>(adapter: &Adapter, out: &mut Vec<Arc<TargetPrivate>>) {
            out.extend(
                adapter
                    .registry
                    .with_list::<T, _>(|list| list.live())
                    .iter()
                    .filter_map(|dev| dev.state().target()),
            );
        }
        let mut targets = Vec::new();
        collect::<SasDevice>(self, &mut targets);
        collect::<PcieDevice>(self, &mut targets);
        collect::<RaidDevice>(self, &mut targets);
        for target in &targets {
            f(target);
        }
    }

    // =========================================================================
    // RECONCILIATION
    // =========================================================================

    /// Re-derive the registry from the controller's pages
    ///
    /// Returns the adds that asked to be retried later.
    fn reconcile(&self) -> Vec<(DeviceClass, DeviceHandle)> {
        if let Err(err) = self.refresh_host_node() {
            log::warn!("{}: host node refresh failed: {}", self.name(), err);
        }
        self.load_enclosures();
        self.registry.mark_all_unresponding();

        let hidden = self.hidden_handles();
        let expanders = self.sweep_expanders();
        let sas = self.sweep_sas(&hidden);
        let pcie = self.sweep_pcie();
        let raid = self.sweep_raid();

        self.remove_unresponding();

        apply_moves(self, sas.moved);
        apply_moves(self, pcie.moved);
        apply_moves(self, raid.moved);

        let mut rescans = Vec::new();
        for handle in expanders {
            if let Err(err) = self.expander_add(handle) {
                log::warn!("{}: expander {} not added after reset: {}", self.name(), handle, err);
            }
        }
        for handle in raid.new {
            if let Err(err) = self.add_raid_volume(handle) {
                log::warn!("{}: volume {} not added after reset: {}", self.name(), handle, err);
            }
        }
        for handle in sas.new {
            if self.add_after_reset(DeviceClass::Sas, handle, hidden.contains(&handle)) {
                rescans.push((DeviceClass::Sas, handle));
            }
        }
        for handle in pcie.new {
            if self.add_after_reset(DeviceClass::Pcie, handle, false) {
                rescans.push((DeviceClass::Pcie, handle));
            }
        }
        let counts = self.registry.counts();
        log::info!(
            "{}: reconciled: sas({}), pcie({}), raid({}), expanders({})",
            self.name(),
            counts.sas,
            counts.pcie,
            counts.raid,
            counts.expanders
        );
        rescans
    }

    /// Add a device found after a reset; `true` if it must be retried later
    fn add_after_reset(&self, class: DeviceClass, handle: DeviceHandle, hidden: bool) -> bool {
        let result = match class {
            DeviceClass::Sas => self.add_device(handle, 0, hidden),
            DeviceClass::Pcie => self.add_pcie_device(handle, 0),
            DeviceClass::RaidVolume => return false,
        };
        match result {
            Ok(crate::discovery::AddResult::Requeue) => true,
            Ok(crate::discovery::AddResult::Done) => false,
            Err(err) => {
                self.log_discovery_error(handle, &err);
                false
            }
        }
    }

    fn hidden_handles(&self) -> Vec<DeviceHandle> {
        self.enumerate::<PhysDiskPage0>()
            .into_iter()
            .map(|page| page.handle)
            .collect()
    }

    fn sweep_expanders(&self) -> Vec<DeviceHandle> {
        let mut new = Vec::new();
        let pages = self.enumerate::<ExpanderPage0>();
        for page in pages {
            let port = self.resolve_port(page.port);
            let Some(expander) = self.registry.expander_by_key(page.sas_address, port) else {
                new.push(page.handle);
                continue;
            };
            expander.set_responding(true);
            expander.set_parent_handle(page.parent_handle);
            if expander.handle() != page.handle {
                hba_debug!(self, RESET, "{}: expander {} moved to handle {}", self.name(), page.sas_address, page.handle);
                expander.set_handle(page.handle);
            }
            self.refresh_expander_links(&expander);
        }
        new
    }

    fn sweep_sas(&self, hidden: &[DeviceHandle]) -> Sweep<SasDevice> {
        let mut sweep = Sweep::default();
        let pages = self.enumerate::<SasDevicePage0>();
        for page in pages {
            if !page.device_info.is_end_device() || !page.flags.contains(SasDeviceFlags::DEVICE_PRESENT) {
                continue;
            }
            let key = (page.sas_address, self.resolve_port(page.port));
            match self.registry.find_by_key::<SasDevice>(key) {
                Some(dev) => {
                    dev.state().set_responding(true);
                    dev.set_parent_handle(page.parent_handle);
                    if hidden.contains(&page.handle) {
                        dev.state().insert_flags(DeviceFlags::RAID_COMPONENT);
                    }
                    if dev.handle() != page.handle {
                        sweep.moved.push(HandleUpdate { dev, handle: page.handle });
                    }
                }
                None => sweep.new.push(page.handle),
            }
        }
        sweep
    }

    fn sweep_pcie(&self) -> Sweep<PcieDevice> {
        let mut sweep = Sweep::default();
        let pages = self.enumerate::<PcieDevicePage0>();
        for page in pages {
            match self.registry.find_by_key::<PcieDevice>(page.wwid) {
                Some(dev) => {
                    dev.state().set_responding(true);
                    dev.set_parent_handle(page.parent_handle);
                    if dev.handle() != page.handle {
                        sweep.moved.push(HandleUpdate { dev, handle: page.handle });
                    }
                }
                None => sweep.new.push(page.handle),
            }
        }
        sweep
    }

    fn sweep_raid(&self) -> Sweep<RaidDevice> {
        let mut sweep = Sweep::default();
        let pages = self.enumerate::<RaidVolumePage1>();
        for page in pages {
            match self.registry.find_by_key::<RaidDevice>(page.wwid) {
                Some(dev) => {
                    dev.state().set_responding(true);
                    if dev.handle() != page.handle {
                        sweep.moved.push(HandleUpdate { dev, handle: page.handle });
                    }
                }
                None => sweep.new.push(page.handle),
            }
        }
        sweep
    }

    fn remove_unresponding(&self) {
        fn stale<T: TrackedDevice>(adapter: &Adapter) -> Vec<Arc<T>> {
            adapter
                .registry
                .all::<T>()
                .into_iter()
                .filter(|dev| !dev.state().is_responding())
                .collect()
        }

        for dev in stale::<SasDevice>(self) {
            self.detach_sas_device(&dev);
        }
        for dev in stale::<PcieDevice>(self) {
            self.detach_device(&dev);
        }
        for dev in stale::<RaidDevice>(self) {
            self.detach_device(&dev);
        }
        let expanders: Vec<_> = self.registry.with_nodes(|nodes| {
            nodes
                .expanders
                .all()
                .into_iter()
                .filter(|e| !e.is_responding())
                .collect()
        });
        for expander in expanders {
            self.expander_remove(&expander);
        }
    }
}

fn apply_moves<T: TrackedDevice>(adapter: &Adapter, moved: Vec<HandleUpdate<T>>) {
    for HandleUpdate { dev, handle } in moved {
        hba_debug!(
            adapter,
            RESET,
            "{}: {} 0x{:016x} moved from handle {} to {}",
            adapter.name(),
            T::CLASS.name(),
            dev.identity(),
            dev.handle(),
            handle
        );
        dev.state().set_handle(handle);
    }
}

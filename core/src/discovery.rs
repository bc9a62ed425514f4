//! # Discovery Engine
//!
//! Turns a firmware handle into a registry entry: read the identity page,
//! reject absent devices and firmware-reported discovery errors, resolve the
//! parent, probe for readiness when the policy asks for it, and register.
//!
//! While the adapter is loading, new devices are staged rather than exposed;
//! [`Adapter::complete_initial_discovery`] exposes them with the boot
//! devices first.

use crate::adapter::Adapter;
use crate::config::BootDeviceSelector;
use crate::config::ProbePolicy;
use crate::error::{HbaError, HbaResult};
use crate::fw_event::{
    DeviceStatusChange, DeviceStatusReason, DiscoveryEvent, EnclosureStatus, EnclosureStatusChange,
    EventDisposition, FwEvent,
};
use crate::host::DeviceClass;
use crate::registry::{
    DeviceFlags, DeviceRef, DeviceState, LinkTable, PcieDevice, PortKind, RaidDevice, SasDevice,
    SasPhy, SlotLocation, TrackedDevice, HostPhyReport,
};
use crate::reset::AdapterState;
use crate::stats::AdapterStats;
use alloc::sync::Arc;
use alloc::vec::Vec;
use hba_hal::config_page::{
    ConfigPage, EnclosurePage0, ExpanderPage0, PageForm, PageRequest, PageType, PcieDeviceFlags,
    PcieDeviceInfo, PcieDevicePage0, PhysDiskPage0, RaidVolumePage1, SasDeviceFlags,
    SasDeviceInfo, SasDevicePage0,
};
use hba_hal::{DeviceHandle, HalError, HalResult, SasAddress};

/// Outcome of an add
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    /// Registered, already known, or nothing to add
    Done,
    /// Not ready yet; the caller reschedules
    Requeue,
}

// =============================================================================
// ACCESS STATUS
// =============================================================================

/// Description of a SAS device page access status, `None` when usable
pub fn sas_access_status(status: u8) -> Option<&'static str> {
    let desc = match status {
        0x00 => return None,
        0x01 => "sata needs initialization",
        0x02 => "sata capability failed",
        0x03 => "sata affiliation conflict",
        0x04 => "route not addressable",
        0x05 => "smp error not addressable",
        0x06 => "device blocked",
        0x10 => "sata initialization failed",
        0x11 => "sata init: affiliation conflict",
        0x12 => "sata init: diagnostic",
        0x13 => "sata init: identification",
        0x14 => "sata init: check power",
        0x15 => "sata init: pio sn",
        0x16 => "sata init: mdma sn",
        0x17 => "sata init: udma sn",
        0x18 => "sata init: zoning violation",
        0x19 => "sata init: not addressable",
        0x1A..=0x1F => "sata init: max",
        _ => "unknown",
    };
    Some(desc)
}

/// Description of a PCIe device page access status, `None` when usable
pub fn pcie_access_status(status: u8) -> Option<&'static str> {
    let desc = match status {
        0x00 | 0x01 => return None,
        0x02 => "capability failed",
        0x07 => "device blocked",
        0x08 => "memory space access failed",
        0x09 => "unsupported device",
        0x0A => "msix required",
        0x10 => "initialization failed",
        0x11 => "nvme ready timeout",
        0x12 => "nvme device configuration unsupported",
        0x13 => "nvme identify failed",
        0x14 => "nvme queue configuration failed",
        0x15 => "nvme queue creation failed",
        0x16 => "nvme event configuration failed",
        0x17 => "nvme get feature status failed",
        0x18 => "nvme idle timeout",
        0x19 => "nvme failure status",
        _ => "unknown",
    };
    Some(desc)
}

fn check_access_status(handle: DeviceHandle, status: u8, decode: fn(u8) -> Option<&'static str>) -> HbaResult<()> {
    match decode(status) {
        None => Ok(()),
        Some(desc) => Err(HbaError::AccessStatus { handle, status, desc }),
    }
}

// =============================================================================
// PAGE ENUMERATION
// =============================================================================

/// A page type the firmware can enumerate with get-next-handle
pub(crate) trait EnumeratedPage: Sized {
    const PAGE: PageType;
    fn decode(page: ConfigPage) -> HalResult<Self>;
    fn page_handle(&self) -> DeviceHandle;
}

macro_rules! enumerated_page {
    ($ty:ty, $page:ident, $decode:ident) => {
        impl EnumeratedPage for $ty {
            const PAGE: PageType = PageType::$page;

            fn decode(page: ConfigPage) -> HalResult<Self> {
                page.$decode()
            }

            fn page_handle(&self) -> DeviceHandle {
                self.handle
            }
        }
    };
}

enumerated_page!(SasDevicePage0, SasDevice0, into_sas_device0);
enumerated_page!(ExpanderPage0, Expander0, into_expander0);
enumerated_page!(PcieDevicePage0, PcieDevice0, into_pcie_device0);
enumerated_page!(RaidVolumePage1, RaidVolume1, into_raid_volume1);
enumerated_page!(PhysDiskPage0, PhysDisk0, into_phys_disk0);
enumerated_page!(EnclosurePage0, Enclosure0, into_enclosure0);

// =============================================================================
// BOOT DEVICES
// =============================================================================

/// A staged device picked as a boot device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootPick {
    /// Device class
    pub class: DeviceClass,
    /// Registry reference
    pub device: DeviceRef,
}

/// Boot devices matched while loading
#[derive(Debug, Clone, Copy, Default)]
pub struct BootCandidates {
    /// Requested boot device
    pub requested: Option<BootPick>,
    /// Requested alternate boot device
    pub alternate: Option<BootPick>,
    /// Device the BIOS booted from
    pub current: Option<BootPick>,
}

fn selector_matches(selector: &BootDeviceSelector, class: DeviceClass, identity: u64, location: &SlotLocation) -> bool {
    match *selector {
        BootDeviceSelector::SasAddress(address) => class == DeviceClass::Sas && identity == address.as_u64(),
        BootDeviceSelector::Wwid(wwid) => class != DeviceClass::Sas && identity == wwid.as_u64(),
        BootDeviceSelector::EnclosureSlot { logical_id, slot } => {
            location.enclosure_logical_id == Some(logical_id) && location.slot == slot
        }
    }
}

impl Adapter {
    /// Read every page of type `P` by walking get-next-handle
    pub(crate) fn enumerate<P: EnumeratedPage>(&self) -> Vec<P> {
        let mut pages = Vec::new();
        let mut handle = DeviceHandle::ENUM_START;
        loop {
            let page = match self.transport().read_config_page(PageRequest::next(P::PAGE, handle)) {
                Ok(raw) => match P::decode(raw) {
                    Ok(page) => page,
                    Err(_) => break,
                },
                Err(HalError::ConfigPageInvalid) => break,
                Err(err) => {
                    log::warn!("{}: enumerating {:?} stopped: {}", self.name(), P::PAGE, err);
                    break;
                }
            };
            let next = page.page_handle();
            if !next.is_valid() || next == handle {
                break;
            }
            handle = next;
            pages.push(page);
        }
        pages
    }

    /// Rebuild the host node from the IO unit page
    pub(crate) fn refresh_host_node(&self) -> HbaResult<()> {
        let request = PageRequest {
            page: PageType::SasIoUnit0,
            form: PageForm::Unit,
        };
        let page = self.read_page(request)?.into_sas_io_unit0()?;

        let mut report = Vec::with_capacity(page.phys.len());
        let mut phys = Vec::with_capacity(page.phys.len());
        for phy in &page.phys {
            let attached_address = if phy.attached_handle.is_valid() {
                self.attached_address(phy.attached_handle)
            } else {
                SasAddress::default()
            };
            report.push(HostPhyReport {
                phy: phy.phy,
                port: phy.port,
                attached_address,
                is_virtual: phy.is_virtual,
            });
            phys.push(SasPhy {
                phy_id: phy.phy,
                attached_handle: phy.attached_handle,
                attached_address,
                link_rate: phy.link_rate,
                port: phy.port,
            });
        }

        let refresh = self.registry.with_nodes(|nodes| {
            nodes.host.sas_address = page.sas_address;
            if nodes.host.links.phys().len() == phys.len() {
                for phy in &phys {
                    nodes.host.links.update_phy(phy.phy_id, phy.attached_handle, phy.link_rate, phy.port);
                }
            } else {
                nodes.host.links = LinkTable::from_phys(phys);
            }
            nodes.host.refresh_ports(&report)
        });
        hba_debug!(
            self,
            DISCOVERY,
            "{}: host {} ports added {:?} removed {:?}",
            self.name(),
            page.sas_address,
            refresh.added,
            refresh.removed
        );
        Ok(())
    }

    fn attached_address(&self, handle: DeviceHandle) -> SasAddress {
        if let Ok(page) = self
            .read_page(PageRequest::by_handle(PageType::SasDevice0, handle))
            .and_then(|p| Ok(p.into_sas_device0()?))
        {
            return page.sas_address;
        }
        self.read_page(PageRequest::by_handle(PageType::Expander0, handle))
            .and_then(|p| Ok(p.into_expander0()?))
            .map(|p| p.sas_address)
            .unwrap_or_default()
    }

    /// Refill the enclosure cache
    pub(crate) fn load_enclosures(&self) {
        let pages = self.enumerate::<EnclosurePage0>();
        self.registry.with_nodes(|nodes| {
            nodes.enclosures.clear();
            for page in pages {
                nodes.enclosures.insert(page.handle, page.into());
            }
        });
    }

    fn slot_location(&self, enclosure_handle: DeviceHandle, slot: u16) -> SlotLocation {
        let enclosure = self.registry.enclosure(enclosure_handle);
        SlotLocation {
            enclosure_handle,
            enclosure_logical_id: enclosure.map(|e| e.logical_id),
            slot,
            chassis_slot: enclosure.and_then(|e| e.chassis_slot),
            enclosure_level: None,
            connector_name: Default::default(),
        }
    }

    fn should_probe(&self) -> bool {
        if self.state.get() != AdapterState::Normal {
            return false;
        }
        match self.config().bringup_probe {
            ProbePolicy::Never => false,
            ProbePolicy::DuringStartup => self.state.is_loading(),
            ProbePolicy::Always => true,
        }
    }

    /// Requeue, or give up once the retry cap is reached
    fn requeue_or_give_up(&self, handle: DeviceHandle, retry_count: u8) -> HbaResult<AddResult> {
        if retry_count >= self.config().command_retry_count {
            return Err(HbaError::NotReady(handle));
        }
        Ok(AddResult::Requeue)
    }

    /// Log a device skipped by discovery
    pub(crate) fn log_discovery_error(&self, handle: DeviceHandle, err: &HbaError) {
        AdapterStats::bump(&self.stats.discovery_errors);
        log::warn!("{}: device at handle {} skipped: {}", self.name(), handle, err);
    }

    /// Address of the node a device hangs off, discovering the parent
    /// expander if it is not known yet
    fn resolve_parent(&self, parent_handle: DeviceHandle) -> HbaResult<SasAddress> {
        if self.registry.host_owns(parent_handle) {
            return Ok(self.registry.host_address());
        }
        if let Some(expander) = self.registry.expander_by_handle(parent_handle) {
            return Ok(expander.sas_address);
        }
        self.expander_add(parent_handle)?;
        self.registry
            .expander_by_handle(parent_handle)
            .map(|e| e.sas_address)
            .ok_or(HbaError::ParentNotFound(parent_handle))
    }

    // =========================================================================
    // SAS
    // =========================================================================

    /// Add the SAS or SATA end device at `handle`
    ///
    /// An `Err` means the device was skipped; it is never fatal to the
    /// adapter.
    pub fn add_device(&self, handle: DeviceHandle, retry_count: u8, hidden: bool) -> HbaResult<AddResult> {
        let page = self
            .read_page(PageRequest::by_handle(PageType::SasDevice0, handle))?
            .into_sas_device0()?;
        if !page.flags.contains(SasDeviceFlags::DEVICE_PRESENT) {
            return Err(HbaError::DeviceNotPresent(handle));
        }
        check_access_status(handle, page.access_status, sas_access_status)?;
        if !page.device_info.is_end_device() {
            return Ok(AddResult::Done);
        }

        let port = self.resolve_port(page.port);
        if let Some(existing) = self.registry.find_by_key::<SasDevice>((page.sas_address, port)) {
            if existing.state().handle() != handle {
                log::info!(
                    "{}: sas device {} changed handle {} -> {}",
                    self.name(),
                    page.sas_address,
                    existing.state().handle(),
                    handle
                );
                existing.state().set_handle(handle);
                existing.set_parent_handle(page.parent_handle);
            }
            return Ok(AddResult::Done);
        }

        let parent_address = self.resolve_parent(page.parent_handle)?;

        let probed = self.should_probe();
        if probed {
            let readiness = self.wait_for_target_ready(handle, hidden);
            if readiness.should_retry() {
                hba_debug!(self, DISCOVERY, "{}: handle {} not ready ({:?})", self.name(), handle, readiness);
                return self.requeue_or_give_up(handle, retry_count);
            }
            if readiness == crate::prober::DeviceReadiness::Error {
                return Err(HbaError::NotReady(handle));
            }
        }

        let mut flags = DeviceFlags::empty();
        if page.device_info.contains(SasDeviceInfo::SATA_DEVICE) {
            flags |= DeviceFlags::SATA;
        }
        if page.device_info.contains(SasDeviceInfo::SEP) {
            flags |= DeviceFlags::SEP;
        }
        if page.flags.contains(SasDeviceFlags::FAST_PATH_CAPABLE) {
            flags |= DeviceFlags::FAST_PATH;
        }
        if hidden {
            flags |= DeviceFlags::RAID_COMPONENT;
        }
        let mut location = self.slot_location(page.enclosure_handle, page.slot);
        if page.flags.contains(SasDeviceFlags::ENCL_LEVEL_VALID) {
            location.enclosure_level = Some(page.enclosure_level);
            location.connector_name = page.connector_name.clone();
        }
        if !page.flags.contains(SasDeviceFlags::CHASSIS_SLOT_VALID) {
            location.chassis_slot = None;
        }

        let dev = Arc::new(SasDevice::new(
            page.sas_address,
            port,
            parent_address,
            page.parent_handle,
            page.phy,
            page.device_info,
            DeviceState::new(handle, flags, location),
        ));
        if probed && !hidden {
            if let Some(identity) = self.inquiry(handle, hidden) {
                dev.set_inquiry(identity);
            }
        }

        let r = match self.register_device(dev.clone()) {
            Ok(r) => r,
            Err(HbaError::HandleInUse(_)) => return self.requeue_or_give_up(handle, retry_count),
            Err(HbaError::DuplicateDevice) => return Ok(AddResult::Done),
            Err(err) => return Err(err),
        };
        self.registry.with_nodes(|nodes| {
            nodes.with_links(parent_address, |links| {
                links.attach(page.sas_address, handle, port, PortKind::EndDevice, Some(page.phy))
            })
        });
        if self.state.is_loading() {
            self.note_boot_candidate(&dev, r);
        }
        hba_debug!(
            self,
            DISCOVERY,
            "{}: sas device {} handle {} parent {} phy {}",
            self.name(),
            page.sas_address,
            handle,
            parent_address,
            page.phy
        );
        Ok(AddResult::Done)
    }

    // =========================================================================
    // PCIE
    // =========================================================================

    /// Add the PCIe device at `handle`
    pub fn add_pcie_device(&self, handle: DeviceHandle, retry_count: u8) -> HbaResult<AddResult> {
        let page = self
            .read_page(PageRequest::by_handle(PageType::PcieDevice0, handle))?
            .into_pcie_device0()?;
        if !page.flags.contains(PcieDeviceFlags::DEVICE_PRESENT) {
            return Err(HbaError::DeviceNotPresent(handle));
        }
        check_access_status(handle, page.access_status, pcie_access_status)?;
        if !page.device_info.contains(PcieDeviceInfo::END_DEVICE) {
            return Ok(AddResult::Done);
        }

        if let Some(existing) = self.registry.find_by_key::<PcieDevice>(page.wwid) {
            if existing.state().handle() != handle {
                log::info!(
                    "{}: pcie device {} changed handle {} -> {}",
                    self.name(),
                    page.wwid,
                    existing.state().handle(),
                    handle
                );
                existing.state().set_handle(handle);
                existing.set_parent_handle(page.parent_handle);
            }
            return Ok(AddResult::Done);
        }

        let scsi = page.device_info.contains(PcieDeviceInfo::PCIE_SCSI);
        if scsi && self.should_probe() {
            match self.wait_for_target_ready(handle, false) {
                readiness if readiness.should_retry() => return self.requeue_or_give_up(handle, retry_count),
                crate::prober::DeviceReadiness::Error => return Err(HbaError::NotReady(handle)),
                _ => {}
            }
        }

        let flags = if scsi { DeviceFlags::PCIE_SCSI } else { DeviceFlags::NVME };
        let location = self.slot_location(page.enclosure_handle, page.slot);
        let dev = Arc::new(PcieDevice::new(
            page.wwid,
            page.port_num,
            page.parent_handle,
            page.device_info,
            DeviceState::new(handle, flags, location),
        ));
        let r = match self.register_device(dev.clone()) {
            Ok(r) => r,
            Err(HbaError::HandleInUse(_)) => return self.requeue_or_give_up(handle, retry_count),
            Err(HbaError::DuplicateDevice) => return Ok(AddResult::Done),
            Err(err) => return Err(err),
        };
        if self.state.is_loading() {
            self.note_boot_candidate(&dev, r);
        }
        Ok(AddResult::Done)
    }

    /// Whether the firmware lists `handle` as a RAID member disk
    pub(crate) fn is_phys_disk(&self, handle: DeviceHandle) -> bool {
        self.enumerate::<PhysDiskPage0>().iter().any(|p| p.handle == handle)
    }

    /// Retry an add a reconciliation pass deferred
    pub(crate) fn process_device_rescan(&self, event: &FwEvent, class: DeviceClass, handle: DeviceHandle) -> EventDisposition {
        let retry_count = event.retry_count(0);
        let result = match class {
            DeviceClass::Sas => self.add_device(handle, retry_count, self.is_phys_disk(handle)),
            DeviceClass::Pcie => self.add_pcie_device(handle, retry_count),
            DeviceClass::RaidVolume => self.add_raid_volume(handle).map(|_| AddResult::Done),
        };
        match result {
            Ok(AddResult::Done) => EventDisposition::Done,
            Ok(AddResult::Requeue) => {
                event.bump_retry(0);
                EventDisposition::Requeue
            }
            Err(err) => {
                self.log_discovery_error(handle, &err);
                EventDisposition::Done
            }
        }
    }

    // =========================================================================
    // STATUS EVENTS
    // =========================================================================

    /// Firmware-internal device resets hold admission for their duration
    pub(crate) fn process_device_status_change(&self, change: &DeviceStatusChange) {
        let target = self.target_by_handle(change.handle);
        match change.reason {
            DeviceStatusReason::InternalDeviceResetStart => {
                if let Some(target) = target {
                    target.set_tm_busy(true);
                }
            }
            DeviceStatusReason::InternalDeviceResetComplete => {
                if let Some(target) = target {
                    target.set_tm_busy(false);
                }
            }
            reason => {
                hba_debug!(
                    self,
                    EVENTS,
                    "{}: device status change: handle({}), sas_addr({}), {:?}",
                    self.name(),
                    change.handle,
                    change.sas_address,
                    reason
                );
            }
        }
    }

    /// Keep the enclosure cache in step with the firmware
    pub(crate) fn process_enclosure_status_change(&self, change: &EnclosureStatusChange) {
        let handle = change.enclosure_handle;
        match change.status {
            EnclosureStatus::Added => {
                let page = self
                    .read_page(PageRequest::by_handle(PageType::Enclosure0, handle))
                    .and_then(|p| Ok(p.into_enclosure0()?));
                match page {
                    Ok(page) => {
                        self.registry.with_nodes(|nodes| nodes.enclosures.insert(handle, page.into()));
                    }
                    Err(err) => log::warn!("{}: enclosure {} not cached: {}", self.name(), handle, err),
                }
            }
            EnclosureStatus::NotResponding => {
                self.registry.with_nodes(|nodes| nodes.enclosures.remove(&handle));
            }
        }
    }

    /// Track firmware discovery progress
    pub(crate) fn process_discovery_event(&self, event: &DiscoveryEvent) {
        self.state.set_discovery_active(event.started);
        if !event.started && event.status != 0 {
            log::warn!("{}: discovery completed with errors: 0x{:08x}", self.name(), event.status);
        } else {
            hba_debug!(
                self,
                DISCOVERY,
                "{}: discovery {}",
                self.name(),
                if event.started { "started" } else { "complete" }
            );
        }
    }

    // =========================================================================
    // BOOT ORDERING
    // =========================================================================

    pub(crate) fn note_boot_candidate<T: TrackedDevice>(&self, dev: &Arc<T>, r: DeviceRef) {
        let requests = self.config().boot_devices;
        let location = dev.state().location();
        let identity = dev.identity();
        let pick = BootPick { class: T::CLASS, device: r };
        let mut guard = self.boot.lock();
        let boot = &mut *guard;
        let slots = [
            (requests.requested, &mut boot.requested),
            (requests.alternate, &mut boot.alternate),
            (requests.current, &mut boot.current),
        ];
        for (selector, slot) in slots {
            let Some(selector) = selector else { continue };
            if slot.is_none() && selector_matches(&selector, T::CLASS, identity, &location) {
                *slot = Some(pick);
                dev.state().insert_flags(DeviceFlags::BOOT);
            }
        }
    }

    fn promote_staged<T: TrackedDevice>(&self, r: DeviceRef) {
        if !self.registry.with_list::<T, _>(|list| list.promote(r)) {
            return;
        }
        let Some(dev) = self.registry.resolve::<T>(r) else {
            return;
        };
        if self.expose_device(&dev, r).is_err() {
            self.detach_device(&dev);
        }
    }

    fn promote_pick(&self, pick: BootPick) {
        match pick.class {
            DeviceClass::Sas => self.promote_staged::<SasDevice>(pick.device),
            DeviceClass::Pcie => self.promote_staged::<PcieDevice>(pick.device),
            DeviceClass::RaidVolume => self.promote_staged::<RaidDevice>(pick.device),
        }
    }

    fn promote_all<T: TrackedDevice>(&self) {
        let staged = self.registry.with_list::<T, _>(|list| list.staged());
        for (r, _) in staged {
            self.promote_staged::<T>(r);
        }
    }

    /// Expose everything staged while loading and leave the loading state
    ///
    /// Order: requested boot device, alternate, current, then volumes, SAS
    /// and PCIe devices in discovery order.
    pub fn complete_initial_discovery(&self) {
        let boot = core::mem::take(&mut *self.boot.lock());
        for pick in [boot.requested, boot.alternate, boot.current].into_iter().flatten() {
            hba_debug!(self, DISCOVERY, "{}: exposing boot device {:?}", self.name(), pick);
            self.promote_pick(pick);
        }
        self.promote_all::<RaidDevice>();
        self.promote_all::<SasDevice>();
        self.promote_all::<PcieDevice>();
        self.state.set_loading(false);

        let counts = self.registry.counts();
        log::info!(
            "{}: initial discovery complete: sas({}), pcie({}), raid({}), expanders({})",
            self.name(),
            counts.sas,
            counts.pcie,
            counts.raid,
            counts.expanders
        );
    }
}

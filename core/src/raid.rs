//! RAID volumes and their hidden member disks.
//!
//! Volumes are exposed on their own channel. Member disks stay registered
//! as SAS devices flagged `RAID_COMPONENT` and are never exposed upstream;
//! probing them goes through RAID passthrough.

use crate::adapter::Adapter;
use crate::discovery::AddResult;
use crate::error::{HbaError, HbaResult};
use crate::fw_event::{FwEventData, IrConfigChangeList, IrConfigElement, IrElementReason, IrVolumeEvent};
use crate::host::DeviceClass;
use crate::registry::{DeviceFlags, DeviceState, RaidDevice, SasDevice, SlotLocation, TrackedDevice};
use crate::stats::AdapterStats;
use crate::tm::RemovalPurpose;
use alloc::sync::Arc;
use hba_hal::config_page::{PageRequest, PageType, VolumeState};
use hba_hal::DeviceHandle;

impl Adapter {
    /// Add the volume at `handle`
    pub fn add_raid_volume(&self, handle: DeviceHandle) -> HbaResult<()> {
        let identity = self
            .read_page(PageRequest::by_handle(PageType::RaidVolume1, handle))?
            .into_raid_volume1()?;
        let page = self
            .read_page(PageRequest::by_handle(PageType::RaidVolume0, handle))?
            .into_raid_volume0()?;
        if !page.state.is_usable() {
            hba_debug!(self, DISCOVERY, "{}: volume {} not usable ({:?})", self.name(), handle, page.state);
            return Err(HbaError::DeviceNotPresent(handle));
        }

        if let Some(existing) = self.registry.find_by_key::<RaidDevice>(identity.wwid) {
            existing.state().set_handle(handle);
            existing.set_volume_state(page.state);
            return Ok(());
        }

        let volume = Arc::new(RaidDevice::new(
            identity.wwid,
            page.num_phys_disks,
            page.state,
            DeviceState::new(handle, DeviceFlags::empty(), SlotLocation::default()),
        ));
        let r = match self.register_device(volume.clone()) {
            Ok(r) => r,
            Err(HbaError::DuplicateDevice) => return Ok(()),
            Err(err) => return Err(err),
        };
        if self.state.is_loading() {
            self.note_boot_candidate(&volume, r);
        }
        log::info!(
            "{}: volume added: handle({}), wwid({}), disks({})",
            self.name(),
            handle,
            identity.wwid,
            page.num_phys_disks
        );
        Ok(())
    }

    /// Track a member disk; one that is not ready yet is rescanned later
    /// with the rest of its retry budget
    fn add_member_disk(&self, handle: DeviceHandle) {
        match self.add_device(handle, 0, true) {
            Ok(AddResult::Done) => {}
            Ok(AddResult::Requeue) => {
                let due = self.clock().now_ms() + self.config().requeue_delay_ms;
                let rescan = FwEventData::DeviceRescan {
                    class: DeviceClass::Sas,
                    handle,
                };
                match self.events.enqueue_delayed(rescan, due) {
                    Some(event) => {
                        event.bump_retry(0);
                        AdapterStats::bump(&self.stats.events_requeued);
                        hba_debug!(self, DISCOVERY, "{}: member disk {} not ready, rescan queued", self.name(), handle);
                    }
                    None => log::warn!("{}: member disk {} not ready during reset", self.name(), handle),
                }
            }
            Err(err) => self.log_discovery_error(handle, &err),
        }
    }

    fn hide_member_disk(&self, element: &IrConfigElement) {
        let Some(dev) = self.registry.find_by_handle::<SasDevice>(element.phys_disk_handle) else {
            self.add_member_disk(element.phys_disk_handle);
            return;
        };
        dev.state().insert_flags(DeviceFlags::RAID_COMPONENT);
        dev.set_volume(Some(element.volume_handle));
        self.hide_device(&dev);
    }

    fn unhide_member_disk(&self, element: &IrConfigElement) {
        let Some(dev) = self.registry.find_by_handle::<SasDevice>(element.phys_disk_handle) else {
            return;
        };
        dev.state().remove_flags(DeviceFlags::RAID_COMPONENT);
        dev.set_volume(None);
        if let Some(r) = self.registry.find_ref(&dev) {
            if self.expose_device(&dev, r).is_err() {
                self.detach_sas_device(&dev);
            }
        }
    }

    /// Apply an IR configuration change list
    pub(crate) fn process_ir_config_change(&self, list: &IrConfigChangeList) {
        for element in &list.elements {
            if self.state.is_recovering() {
                return;
            }
            hba_debug!(
                self,
                DISCOVERY,
                "{}: ir config: {:?} volume({}) pd({})",
                self.name(),
                element.reason,
                element.volume_handle,
                element.phys_disk_handle
            );
            match element.reason {
                IrElementReason::VolumeAdded | IrElementReason::VolumeDeleted if list.foreign => {}
                IrElementReason::VolumeAdded => {
                    if let Err(err) = self.add_raid_volume(element.volume_handle) {
                        self.log_discovery_error(element.volume_handle, &err);
                    }
                }
                IrElementReason::VolumeDeleted => {
                    self.initiate_device_removal(element.volume_handle, RemovalPurpose::Volume);
                }
                IrElementReason::PdHidden => self.hide_member_disk(element),
                IrElementReason::PdUnhidden => self.unhide_member_disk(element),
                IrElementReason::PdCreated => match self.registry.find_by_handle::<SasDevice>(element.phys_disk_handle) {
                    Some(_) => self.hide_member_disk(element),
                    None => self.add_member_disk(element.phys_disk_handle),
                },
                IrElementReason::PdDeleted => {
                    self.initiate_device_removal(element.phys_disk_handle, RemovalPurpose::Internal);
                }
            }
        }
    }

    /// Apply a volume state change
    pub(crate) fn process_ir_volume(&self, event: &IrVolumeEvent) {
        let volume = self.registry.find_by_handle::<RaidDevice>(event.volume_handle);
        log::info!(
            "{}: volume {} state -> {:?}",
            self.name(),
            event.volume_handle,
            event.new_state
        );
        match (event.new_state, volume) {
            (VolumeState::Missing | VolumeState::Failed, Some(_)) => {
                self.initiate_device_removal(event.volume_handle, RemovalPurpose::Volume);
            }
            (VolumeState::Missing | VolumeState::Failed, None) => {}
            (state, Some(volume)) => volume.set_volume_state(state),
            (state, None) if state.is_usable() => {
                if let Err(err) = self.add_raid_volume(event.volume_handle) {
                    self.log_discovery_error(event.volume_handle, &err);
                }
            }
            (_, None) => {}
        }
    }
}

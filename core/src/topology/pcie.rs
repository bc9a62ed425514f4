//! PCIe topology change lists: the switch-port analogue of the SAS path.
//!
//! Switches are not tracked as nodes; a device records the handle of the
//! switch it sits behind and a departing switch takes those devices with it.

use crate::adapter::Adapter;
use crate::discovery::AddResult;
use crate::fw_event::{
    EventDisposition, FwEvent, FwEventData, PciePortReason, PcieTopologyChangeList, SwitchStatus,
};
use crate::registry::{Identified, PcieDevice, TrackedDevice};
use crate::tm::RemovalPurpose;
use alloc::sync::Arc;
use alloc::vec::Vec;
use hba_hal::config_page::{PageRequest, PageType, PcieDeviceFlags};
use hba_hal::DeviceHandle;

impl Adapter {
    fn pcie_children(&self, switch_handle: DeviceHandle) -> Vec<Arc<PcieDevice>> {
        self.registry
            .all::<PcieDevice>()
            .into_iter()
            .filter(|d| d.parent_handle() == switch_handle)
            .collect()
    }

    /// Start removals announced by a freshly received PCIe list
    pub(crate) fn check_pcie_topo_delete_events(&self, list: &mut PcieTopologyChangeList) {
        if self.state.is_recovering() {
            return;
        }
        for entry in list.ports.iter_mut() {
            if !entry.attached_handle.is_valid() {
                continue;
            }
            match entry.reason {
                PciePortReason::PortNotResponding => {
                    self.initiate_device_removal(entry.attached_handle, RemovalPurpose::Device);
                }
                PciePortReason::DelayNotResponding => {
                    entry.departing = self.note_delayed_departure::<PcieDevice>(entry.attached_handle);
                }
                _ => {}
            }
        }

        if self.registry.host_owns(list.switch_handle) {
            return;
        }
        if list.switch_status.is_removal() {
            for dev in self.pcie_children(list.switch_handle) {
                if let Some(target) = dev.state().target() {
                    self.block_target(&target);
                }
            }
        }

        let departing: Vec<DeviceHandle> = list
            .ports
            .iter()
            .filter(|e| {
                matches!(e.reason, PciePortReason::PortNotResponding | PciePortReason::DelayNotResponding)
            })
            .map(|e| e.attached_handle)
            .collect();
        let switch_gone = list.switch_status == SwitchStatus::NotResponding;
        if departing.is_empty() && !switch_gone {
            return;
        }
        for queued in self.events.pending() {
            if queued.is_ignored() {
                continue;
            }
            let ignore = queued.with_data(|data| {
                let FwEventData::PcieTopologyChange(old) = data else {
                    return false;
                };
                if old.switch_handle != list.switch_handle {
                    return false;
                }
                if switch_gone {
                    return true;
                }
                for entry in old.ports.iter_mut() {
                    if entry.reason == PciePortReason::DevAdded && departing.contains(&entry.attached_handle) {
                        entry.vacant = true;
                    }
                }
                old.switch_status != SwitchStatus::Added
                    && old
                        .ports
                        .iter()
                        .all(|e| e.vacant || e.reason != PciePortReason::DevAdded)
            });
            if ignore {
                hba_debug!(self, EVENTS, "{}: ignoring superseded pcie event {}", self.name(), queued.id());
                queued.ignore();
            }
        }
    }

    fn mark_port_vacant(event: &FwEvent, index: usize) {
        event.with_data(|data| {
            if let FwEventData::PcieTopologyChange(list) = data {
                if let Some(entry) = list.ports.get_mut(index) {
                    entry.vacant = true;
                }
            }
        });
    }

    /// Run one PCIe topology change list on the event worker
    pub(crate) fn process_pcie_topology_change(&self, event: &FwEvent) -> EventDisposition {
        let FwEventData::PcieTopologyChange(list) = event.data() else {
            return EventDisposition::Done;
        };
        if self.state.is_recovering() {
            return EventDisposition::Done;
        }
        hba_debug!(
            self,
            TOPOLOGY,
            "{}: pcie topology change: switch({}) status({:?}) start_port({}) entries({})",
            self.name(),
            list.switch_handle,
            list.switch_status,
            list.start_port,
            list.ports.len()
        );

        let mut requeue = false;
        for (index, entry) in list.ports.iter().enumerate() {
            if event.is_ignored() || self.state.is_recovering() {
                return EventDisposition::Done;
            }
            let handle = entry.attached_handle;
            if entry.vacant || !handle.is_valid() {
                continue;
            }
            match entry.reason {
                PciePortReason::NoChange => continue,
                PciePortReason::PortNotResponding => {
                    Self::mark_port_vacant(event, index);
                    continue;
                }
                PciePortReason::DelayNotResponding => {
                    self.remove_delayed_departure::<PcieDevice>(handle, entry.departing);
                    Self::mark_port_vacant(event, index);
                    continue;
                }
                PciePortReason::LinkRateChanged => {
                    if entry.link_rate == entry.prev_link_rate {
                        continue;
                    }
                    if self.registry.find_by_handle::<PcieDevice>(handle).is_some() {
                        self.check_pcie_device(handle);
                        Self::mark_port_vacant(event, index);
                        continue;
                    }
                }
                PciePortReason::DevAdded => {}
            }

            match self.add_pcie_device(handle, event.retry_count(index)) {
                Ok(AddResult::Done) => Self::mark_port_vacant(event, index),
                Ok(AddResult::Requeue) => {
                    event.bump_retry(index);
                    requeue = true;
                }
                Err(err) => {
                    self.log_discovery_error(handle, &err);
                    Self::mark_port_vacant(event, index);
                }
            }
        }

        if list.switch_status == SwitchStatus::NotResponding {
            for dev in self.pcie_children(list.switch_handle) {
                self.detach_device(&dev);
            }
        }

        if requeue {
            EventDisposition::Requeue
        } else {
            EventDisposition::Done
        }
    }

    fn check_pcie_device(&self, handle: DeviceHandle) {
        let Ok(page) = self
            .read_page(PageRequest::by_handle(PageType::PcieDevice0, handle))
            .and_then(|p| Ok(p.into_pcie_device0()?))
        else {
            return;
        };
        if !page.flags.contains(PcieDeviceFlags::DEVICE_PRESENT) {
            return;
        }
        let Some(dev) = self.registry.find_by_key::<PcieDevice>(page.wwid) else {
            return;
        };
        if dev.handle() != handle {
            log::info!("{}: pcie device {} handle changed {} -> {}", self.name(), page.wwid, dev.handle(), handle);
            dev.state().set_handle(handle);
            dev.set_parent_handle(page.parent_handle);
        }
        if crate::discovery::pcie_access_status(page.access_status).is_some() {
            return;
        }
        if let Some(target) = dev.state().target() {
            if !target.is_deleted() {
                self.unblock_target(&target);
            }
        }
    }
}

//! # Topology Change Processor
//!
//! Applies SAS topology change lists to the registry. Each list names one
//! parent (an expander, or the host for direct-attached phys) and carries
//! one entry per phy.
//!
//! Work is split between two points:
//!
//! - When a list is *received* ([`Adapter::check_topo_delete_events`]),
//!   removals start at once: not-responding targets enter the removal
//!   handshake, targets behind a departing expander are blocked, and queued
//!   adds the new list supersedes are marked ignored. A delayed
//!   not-responding target is only blocked; the entry records which
//!   registered device held the handle.
//! - When the list is *processed* on the event worker, link records are
//!   updated, added targets are discovered, delayed departures enter the
//!   handshake and a not-responding expander is torn down depth-first.
//!
//! The worker never starts a second handshake for a not-responding entry.
//! The one started on receipt owns the handle until the firmware releases
//! it, and by the time the worker runs the handle may name a new device.
//!
//! An add that asks to be retried bumps that entry's retry counter and the
//! whole list is requeued; entries already resolved are marked vacant so a
//! second pass skips them.

mod pcie;

use crate::adapter::Adapter;
use crate::discovery::AddResult;
use crate::error::{HbaError, HbaResult};
use crate::fw_event::{
    EventDisposition, ExpanderStatus, FwEvent, FwEventData, PhyReason, SasTopologyChangeList,
};
use crate::registry::{
    DeviceRef, Expander, Identified, Membership, PortKind, SasDevice, SasPhy, TrackedDevice,
};
use crate::reset::AdapterState;
use crate::tm::RemovalPurpose;
use alloc::sync::Arc;
use alloc::vec::Vec;
use hba_hal::config_page::{PageForm, PageRequest, PageType, SasDeviceFlags};
use hba_hal::{DeviceHandle, LinkRate, PortId, SasAddress};

/// Node a topology list's phys belong to
#[derive(Debug, Clone, Copy)]
struct ParentNode {
    sas_address: SasAddress,
    num_phys: u8,
}

impl Adapter {
    // =========================================================================
    // RECEIVE-TIME WORK
    // =========================================================================

    /// Start removals announced by a freshly received list
    pub(crate) fn check_topo_delete_events(&self, list: &mut SasTopologyChangeList) {
        if self.state.is_recovering() {
            return;
        }
        for entry in list.phys.iter_mut() {
            if !entry.attached_handle.is_valid() {
                continue;
            }
            match entry.reason {
                PhyReason::TargetNotResponding => {
                    self.initiate_device_removal(entry.attached_handle, RemovalPurpose::Device);
                }
                PhyReason::DelayNotResponding => {
                    entry.departing = self.note_delayed_departure::<SasDevice>(entry.attached_handle);
                }
                _ => {}
            }
        }

        if self.registry.host_owns(list.expander_handle) {
            return;
        }
        if list.exp_status.is_removal() {
            if let Some(expander) = self.registry.expander_by_handle(list.expander_handle) {
                self.block_expander_children(&expander);
            }
        }
        self.ignore_superseded_adds(list);
    }

    /// Block the device holding `handle` and remember which one it was
    fn note_delayed_departure<T: TrackedDevice>(&self, handle: DeviceHandle) -> Option<DeviceRef> {
        let dev = self.registry.find_by_handle::<T>(handle)?;
        if let Some(target) = dev.state().target() {
            self.block_target(&target);
        }
        self.registry.find_ref(&dev)
    }

    /// Start the handshake for a delayed departure noted on receipt
    ///
    /// Nothing is sent unless the same registered device still holds the
    /// handle.
    fn remove_delayed_departure<T: TrackedDevice>(&self, handle: DeviceHandle, departing: Option<DeviceRef>) {
        let Some(dev) = departing.and_then(|r| self.registry.resolve::<T>(r)) else {
            hba_debug!(self, TOPOLOGY, "{}: delayed departure of {} already handled", self.name(), handle);
            return;
        };
        if dev.handle() != handle {
            hba_debug!(self, TOPOLOGY, "{}: device left {} for {}, kept", self.name(), handle, dev.handle());
            return;
        }
        self.initiate_device_removal(handle, RemovalPurpose::Device);
    }

    /// Mark queued adds the new list makes stale
    fn ignore_superseded_adds(&self, list: &SasTopologyChangeList) {
        let departing: Vec<DeviceHandle> = list
            .phys
            .iter()
            .filter(|e| {
                matches!(e.reason, PhyReason::TargetNotResponding | PhyReason::DelayNotResponding)
            })
            .map(|e| e.attached_handle)
            .collect();
        let expander_gone = list.exp_status == ExpanderStatus::NotResponding;
        if departing.is_empty() && !expander_gone {
            return;
        }

        for queued in self.events.pending() {
            if queued.is_ignored() {
                continue;
            }
            let ignore = queued.with_data(|data| {
                let FwEventData::SasTopologyChange(old) = data else {
                    return false;
                };
                if old.expander_handle != list.expander_handle {
                    return false;
                }
                if expander_gone {
                    return matches!(old.exp_status, ExpanderStatus::Added | ExpanderStatus::Responding)
                        || old.phys.iter().any(|e| e.is_add());
                }
                for entry in old.phys.iter_mut() {
                    if entry.is_add() && departing.contains(&entry.attached_handle) {
                        entry.vacant = true;
                    }
                }
                old.exp_status != ExpanderStatus::Added && old.phys.iter().all(|e| e.vacant || !e.is_add())
            });
            if ignore {
                hba_debug!(self, EVENTS, "{}: ignoring superseded event {}", self.name(), queued.id());
                queued.ignore();
            }
        }
    }

    /// Block every device below an expander, depth-first
    fn block_expander_children(&self, expander: &Arc<Expander>) {
        for dev in self.sas_children(expander) {
            if let Some(target) = dev.state().target() {
                self.block_target(&target);
            }
        }
        for child in self.child_expanders(expander) {
            self.block_expander_children(&child);
        }
    }

    fn sas_children(&self, expander: &Expander) -> Vec<Arc<SasDevice>> {
        self.registry
            .all::<SasDevice>()
            .into_iter()
            .filter(|d| d.parent_address == expander.sas_address && d.port == expander.port)
            .collect()
    }

    fn child_expanders(&self, expander: &Expander) -> Vec<Arc<Expander>> {
        self.registry.with_nodes(|nodes| {
            nodes
                .expanders
                .all()
                .into_iter()
                .filter(|e| e.parent_address == expander.sas_address && e.port == expander.port)
                .collect()
        })
    }

    // =========================================================================
    // PROCESSING
    // =========================================================================

    fn topology_parent(&self, handle: DeviceHandle) -> Option<ParentNode> {
        if self.registry.host_owns(handle) {
            let num_phys = self.registry.with_nodes(|nodes| nodes.host.links.phys().len());
            return Some(ParentNode {
                sas_address: self.registry.host_address(),
                num_phys: num_phys.min(usize::from(u8::MAX)) as u8,
            });
        }
        self.registry.expander_by_handle(handle).map(|e| ParentNode {
            sas_address: e.sas_address,
            num_phys: e.num_phys,
        })
    }

    fn mark_phy_vacant(event: &FwEvent, index: usize) {
        event.with_data(|data| {
            if let FwEventData::SasTopologyChange(list) = data {
                if let Some(entry) = list.phys.get_mut(index) {
                    entry.vacant = true;
                }
            }
        });
    }

    fn update_parent_link(&self, parent: ParentNode, phy: u8, handle: DeviceHandle, rate: LinkRate, port: PortId) {
        self.registry.with_nodes(|nodes| {
            nodes.with_links(parent.sas_address, |links| links.update_phy(phy, handle, rate, port))
        });
    }

    /// Run one SAS topology change list on the event worker
    pub(crate) fn process_sas_topology_change(&self, event: &FwEvent) -> EventDisposition {
        let FwEventData::SasTopologyChange(list) = event.data() else {
            return EventDisposition::Done;
        };
        if self.state.is_recovering() {
            return EventDisposition::Done;
        }
        hba_debug!(
            self,
            TOPOLOGY,
            "{}: topology change: expander({}) status({:?}) start_phy({}) entries({})",
            self.name(),
            list.expander_handle,
            list.exp_status,
            list.start_phy,
            list.phys.len()
        );

        if !self.registry.host_owns(list.expander_handle)
            && !list.exp_status.is_removal()
            && self.registry.expander_by_handle(list.expander_handle).is_none()
        {
            if let Err(err) = self.expander_add(list.expander_handle) {
                self.log_discovery_error(list.expander_handle, &err);
                return EventDisposition::Done;
            }
        }
        let parent = self.topology_parent(list.expander_handle);

        let mut requeue = false;
        for (index, entry) in list.phys.iter().enumerate() {
            if event.is_ignored() || self.state.is_recovering() {
                return EventDisposition::Done;
            }
            if entry.vacant {
                continue;
            }
            let phy = list.start_phy.saturating_add(index as u8);
            if parent.is_some_and(|p| phy >= p.num_phys) {
                continue;
            }
            let handle = entry.attached_handle;
            if !handle.is_valid() {
                continue;
            }

            match entry.reason {
                PhyReason::NoChange => continue,
                PhyReason::TargetNotResponding => {
                    Self::mark_phy_vacant(event, index);
                    continue;
                }
                PhyReason::DelayNotResponding => {
                    self.remove_delayed_departure::<SasDevice>(handle, entry.departing);
                    Self::mark_phy_vacant(event, index);
                    continue;
                }
                PhyReason::PhyLinkRateChanged => {
                    if entry.link_rate == entry.prev_link_rate {
                        continue;
                    }
                    if let Some(parent) = parent {
                        self.update_parent_link(parent, phy, handle, entry.link_rate, list.port);
                    }
                    if entry.link_rate < self.config().min_link_rate {
                        continue;
                    }
                    if self.registry.find_by_handle::<SasDevice>(handle).is_some() {
                        self.check_device(handle);
                        Self::mark_phy_vacant(event, index);
                        continue;
                    }
                }
                PhyReason::TargetAdded => {
                    if let Some(parent) = parent {
                        self.update_parent_link(parent, phy, handle, entry.link_rate, list.port);
                    }
                    if entry.link_rate < self.config().min_link_rate {
                        continue;
                    }
                }
            }

            let retries = event.retry_count(index);
            match self.add_device(handle, retries, self.is_phys_disk(handle)) {
                Ok(AddResult::Done) => Self::mark_phy_vacant(event, index),
                Ok(AddResult::Requeue) => {
                    event.bump_retry(index);
                    requeue = true;
                }
                Err(err) => {
                    self.log_discovery_error(handle, &err);
                    Self::mark_phy_vacant(event, index);
                }
            }
        }

        if list.exp_status == ExpanderStatus::NotResponding {
            if let Some(expander) = self.registry.expander_by_handle(list.expander_handle) {
                self.expander_remove(&expander);
            }
        }

        if requeue {
            EventDisposition::Requeue
        } else {
            EventDisposition::Done
        }
    }

    /// Re-read a known device after a link change
    ///
    /// Picks up a reassigned handle and enclosure data and lifts the block a
    /// delayed not-responding entry put on it.
    fn check_device(&self, handle: DeviceHandle) {
        let page = match self
            .read_page(PageRequest::by_handle(PageType::SasDevice0, handle))
            .and_then(|p| Ok(p.into_sas_device0()?))
        {
            Ok(page) => page,
            Err(err) => {
                hba_debug!(self, TOPOLOGY, "{}: check of handle {} failed: {}", self.name(), handle, err);
                return;
            }
        };
        if !page.flags.contains(SasDeviceFlags::DEVICE_PRESENT) {
            return;
        }
        let port = self.resolve_port(page.port);
        let Some(dev) = self.registry.find_by_key::<SasDevice>((page.sas_address, port)) else {
            return;
        };
        if dev.handle() != handle {
            log::info!(
                "{}: sas device {} handle changed {} -> {}",
                self.name(),
                page.sas_address,
                dev.handle(),
                handle
            );
            dev.state().set_handle(handle);
            dev.set_parent_handle(page.parent_handle);
        }
        let mut location = dev.state().location();
        if page.enclosure_handle.is_valid() && location.enclosure_handle != page.enclosure_handle {
            location.enclosure_handle = page.enclosure_handle;
            location.slot = page.slot;
            location.enclosure_logical_id = self.registry.enclosure(page.enclosure_handle).map(|e| e.logical_id);
            dev.state().set_location(location);
        }
        if crate::discovery::sas_access_status(page.access_status).is_some() {
            return;
        }
        if let Some(target) = dev.state().target() {
            if !target.is_deleted() {
                self.unblock_target(&target);
            }
        }
    }

    // =========================================================================
    // EXPANDERS
    // =========================================================================

    fn read_expander_phys(&self, handle: DeviceHandle, num_phys: u8, port: PortId) -> HbaResult<Vec<SasPhy>> {
        let mut phys = Vec::with_capacity(usize::from(num_phys));
        for phy in 0..num_phys {
            let request = PageRequest {
                page: PageType::Expander1,
                form: PageForm::HandleAndPhy(handle, phy),
            };
            let page = self.read_page(request)?.into_expander1()?;
            phys.push(SasPhy {
                phy_id: phy,
                attached_handle: page.attached_handle,
                attached_address: SasAddress::default(),
                link_rate: page.link_rate,
                port,
            });
        }
        Ok(phys)
    }

    /// Discover the expander at `handle`, and its parents if needed
    pub(crate) fn expander_add(&self, handle: DeviceHandle) -> HbaResult<Arc<Expander>> {
        if !handle.is_valid() || self.registry.host_owns(handle) {
            return Err(HbaError::ParentNotFound(handle));
        }
        if self.state.get() == AdapterState::ResetInProgress {
            return Err(HbaError::HostBusy);
        }
        let page = self
            .read_page(PageRequest::by_handle(PageType::Expander0, handle))?
            .into_expander0()?;
        let port = self.resolve_port(page.port);

        if let Some(existing) = self.registry.expander_by_key(page.sas_address, port) {
            if existing.handle() != handle {
                existing.set_handle(handle);
            }
            return Ok(existing);
        }

        let parent_address = if self.registry.host_owns(page.parent_handle) {
            self.registry.host_address()
        } else if let Some(parent) = self.registry.expander_by_handle(page.parent_handle) {
            parent.sas_address
        } else {
            self.expander_add(page.parent_handle)?.sas_address
        };

        let phys = self.read_expander_phys(handle, page.num_phys, port)?;
        let expander = Arc::new(Expander::new(
            handle,
            page.sas_address,
            port,
            page.parent_handle,
            parent_address,
            page.enclosure_handle,
            phys,
        ));
        self.registry
            .with_nodes(|nodes| nodes.expanders.insert(expander.clone(), Membership::Live))?;
        self.registry.with_nodes(|nodes| {
            nodes.with_links(parent_address, |links| {
                links.attach(page.sas_address, handle, port, PortKind::Expander, None)
            })
        });
        log::info!(
            "{}: expander added: handle({}), sas_addr({}), phys({})",
            self.name(),
            handle,
            page.sas_address,
            page.num_phys
        );
        Ok(expander)
    }

    /// Re-read an expander's phys after a reset
    pub(crate) fn refresh_expander_links(&self, expander: &Arc<Expander>) {
        match self.read_expander_phys(expander.handle(), expander.num_phys, expander.port) {
            Ok(phys) => expander.with_links(|links| {
                for phy in phys {
                    links.update_phy(phy.phy_id, phy.attached_handle, phy.link_rate, phy.port);
                }
            }),
            Err(err) => log::warn!(
                "{}: expander {} links not refreshed: {}",
                self.name(),
                expander.sas_address,
                err
            ),
        }
    }

    /// Tear down an expander and everything below it, depth-first
    pub(crate) fn expander_remove(&self, expander: &Arc<Expander>) {
        for child in self.child_expanders(expander) {
            self.expander_remove(&child);
        }
        for dev in self.sas_children(expander) {
            self.detach_sas_device(&dev);
        }

        let removed = self.registry.with_nodes(|nodes| {
            let removed = nodes.expanders.remove(expander).is_some();
            if removed {
                nodes.with_links(expander.parent_address, |links| {
                    links.detach(expander.sas_address, expander.port)
                });
            }
            removed
        });
        if removed {
            log::info!(
                "{}: expander removed: handle({}), sas_addr({})",
                self.name(),
                expander.handle(),
                expander.sas_address
            );
        }
    }
}

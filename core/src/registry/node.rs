//! Topology nodes: the host, expanders, host ports and enclosures.

use super::device::Identified;
use super::list::DeviceList;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use hba_hal::config_page::EnclosurePage0;
use hba_hal::{DeviceHandle, LinkRate, PortId, SasAddress};
use spin::Mutex;

/// One phy of the host or of an expander
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SasPhy {
    /// Phy number
    pub phy_id: u8,
    /// Handle of the attached device
    pub attached_handle: DeviceHandle,
    /// Address of the attached device, once known
    pub attached_address: SasAddress,
    /// Negotiated link rate
    pub link_rate: LinkRate,
    /// Controller port
    pub port: PortId,
}

/// What a downstream port leads to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// An end device
    EndDevice,
    /// Another expander
    Expander,
}

/// Phys of one node that share an attached device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamPort {
    /// Address of the attached device
    pub remote_address: SasAddress,
    /// Handle of the attached device
    pub remote_handle: DeviceHandle,
    /// Controller port
    pub port: PortId,
    /// Kind of the attached device
    pub kind: PortKind,
    /// Member phys
    pub phys: Vec<u8>,
}

/// Phy and port records of one node
#[derive(Debug, Clone, Default)]
pub struct LinkTable {
    phys: Box<[SasPhy]>,
    ports: Vec<DownstreamPort>,
}

impl LinkTable {
    /// Table with `num_phys` empty phys
    pub fn new(num_phys: u8) -> Self {
        let phys = (0..num_phys)
            .map(|phy_id| SasPhy {
                phy_id,
                ..SasPhy::default()
            })
            .collect();
        Self {
            phys,
            ports: Vec::new(),
        }
    }

    /// Table from already-read phys
    pub fn from_phys(phys: Vec<SasPhy>) -> Self {
        Self {
            phys: phys.into_boxed_slice(),
            ports: Vec::new(),
        }
    }

    /// Phys
    pub fn phys(&self) -> &[SasPhy] {
        &self.phys
    }

    /// Downstream ports
    pub fn ports(&self) -> &[DownstreamPort] {
        &self.ports
    }

    /// Record the current state of one phy; `false` if the phy does not exist
    pub fn update_phy(&mut self, phy: u8, attached_handle: DeviceHandle, link_rate: LinkRate, port: PortId) -> bool {
        let Some(entry) = self.phys.get_mut(phy as usize) else {
            return false;
        };
        if entry.attached_handle != attached_handle {
            entry.attached_address = SasAddress::default();
        }
        entry.attached_handle = attached_handle;
        entry.link_rate = link_rate;
        entry.port = port;
        true
    }

    /// Group the phys attached to `remote_handle` into a downstream port
    pub fn attach(&mut self, remote_address: SasAddress, remote_handle: DeviceHandle, port: PortId, kind: PortKind, hint_phy: Option<u8>) {
        let mut members: Vec<u8> = Vec::new();
        for phy in self.phys.iter_mut() {
            if remote_handle.is_valid() && phy.attached_handle == remote_handle {
                phy.attached_address = remote_address;
                members.push(phy.phy_id);
            }
        }
        if members.is_empty() {
            if let Some(phy) = hint_phy.and_then(|p| self.phys.get_mut(p as usize)) {
                phy.attached_handle = remote_handle;
                phy.attached_address = remote_address;
                members.push(phy.phy_id);
            }
        }

        if let Some(existing) = self
            .ports
            .iter_mut()
            .find(|p| p.remote_address == remote_address && p.port == port)
        {
            existing.remote_handle = remote_handle;
            existing.phys = members;
            return;
        }
        self.ports.push(DownstreamPort {
            remote_address,
            remote_handle,
            port,
            kind,
            phys: members,
        });
    }

    /// Drop the downstream port leading to `remote_address`
    pub fn detach(&mut self, remote_address: SasAddress, port: PortId) -> Option<DownstreamPort> {
        let pos = self
            .ports
            .iter()
            .position(|p| p.remote_address == remote_address && p.port == port)?;
        let removed = self.ports.remove(pos);
        for phy in self.phys.iter_mut() {
            if removed.phys.contains(&phy.phy_id) {
                phy.attached_address = SasAddress::default();
            }
        }
        Some(removed)
    }
}

// =============================================================================
// EXPANDER
// =============================================================================

/// SAS expander
#[derive(Debug)]
pub struct Expander {
    /// Expander address
    pub sas_address: SasAddress,
    /// Controller port
    pub port: PortId,
    /// Phy count, fixed at creation
    pub num_phys: u8,
    /// Address of the parent expander or host
    pub parent_address: SasAddress,
    /// Enclosure handle
    pub enclosure_handle: DeviceHandle,
    handle: AtomicU16,
    parent_handle: AtomicU16,
    responding: AtomicBool,
    links: Mutex<LinkTable>,
}

impl Expander {
    /// Create an expander node; `phys` must hold exactly `num_phys` entries
    pub fn new(
        handle: DeviceHandle,
        sas_address: SasAddress,
        port: PortId,
        parent_handle: DeviceHandle,
        parent_address: SasAddress,
        enclosure_handle: DeviceHandle,
        phys: Vec<SasPhy>,
    ) -> Self {
        Self {
            sas_address,
            port,
            num_phys: phys.len() as u8,
            parent_address,
            enclosure_handle,
            handle: AtomicU16::new(handle.as_u16()),
            parent_handle: AtomicU16::new(parent_handle.as_u16()),
            responding: AtomicBool::new(true),
            links: Mutex::new(LinkTable::from_phys(phys)),
        }
    }

    /// Record a reassigned handle
    pub fn set_handle(&self, handle: DeviceHandle) {
        self.handle.store(handle.as_u16(), Ordering::Release);
    }

    /// Parent handle
    pub fn parent_handle(&self) -> DeviceHandle {
        DeviceHandle::new(self.parent_handle.load(Ordering::Acquire))
    }

    pub(crate) fn set_parent_handle(&self, handle: DeviceHandle) {
        self.parent_handle.store(handle.as_u16(), Ordering::Release);
    }

    /// Reconciliation marker
    pub fn is_responding(&self) -> bool {
        self.responding.load(Ordering::Acquire)
    }

    /// Set the reconciliation marker
    pub fn set_responding(&self, responding: bool) {
        self.responding.store(responding, Ordering::Release);
    }

    /// Run `f` on the phy and port table
    pub fn with_links<R>(&self, f: impl FnOnce(&mut LinkTable) -> R) -> R {
        f(&mut self.links.lock())
    }

    /// Snapshot of the downstream ports
    pub fn downstream(&self) -> Vec<DownstreamPort> {
        self.links.lock().ports().to_vec()
    }
}

impl Identified for Expander {
    type Key = (SasAddress, PortId);

    fn key(&self) -> Self::Key {
        (self.sas_address, self.port)
    }

    fn handle(&self) -> DeviceHandle {
        DeviceHandle::new(self.handle.load(Ordering::Acquire))
    }
}

// =============================================================================
// HOST PORTS
// =============================================================================

/// Virtual phy backing an enclosure services device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualPhy {
    /// Address of the virtual device
    pub sas_address: SasAddress,
    /// Host phys carrying it
    pub phy_mask: u64,
    /// Not yet re-validated after a reset
    pub dirty: bool,
}

/// One logical host port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HbaPort {
    /// Controller port id
    pub port_id: PortId,
    /// Address of the device attached to the port
    pub sas_address: SasAddress,
    /// Host phys in the port
    pub phy_mask: u64,
    /// Not yet re-validated after a reset
    pub dirty: bool,
    /// Virtual phys on the port
    pub vphys: Vec<VirtualPhy>,
}

/// One host phy as reported by the IO unit page, with its attached address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPhyReport {
    /// Host phy
    pub phy: u8,
    /// Controller port id
    pub port: PortId,
    /// Address of the attached device
    pub attached_address: SasAddress,
    /// Virtual phy
    pub is_virtual: bool,
}

/// Port table changes after a refresh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortRefresh {
    /// Ports seen for the first time
    pub added: Vec<PortId>,
    /// Ports that did not come back
    pub removed: Vec<PortId>,
}

/// The controller's own SAS node
#[derive(Debug, Default)]
pub struct HostNode {
    /// Host SAS address
    pub sas_address: SasAddress,
    /// Host phys and direct-attached ports
    pub links: LinkTable,
    ports: Vec<HbaPort>,
}

impl HostNode {
    /// Logical host ports
    pub fn ports(&self) -> &[HbaPort] {
        &self.ports
    }

    /// Whether a firmware handle names the host itself
    ///
    /// The firmware numbers the host's own handles from 1 up to its phy count.
    pub fn owns_handle(&self, handle: DeviceHandle) -> bool {
        handle == DeviceHandle::NONE || (handle.as_u16() as usize) <= self.links.phys().len()
    }

    /// Rebuild the host port table from a fresh IO unit report
    ///
    /// Every port is marked dirty, re-validated against `report` (same port
    /// id and attached address), and anything still dirty is dropped.
    pub fn refresh_ports(&mut self, report: &[HostPhyReport]) -> PortRefresh {
        for port in &mut self.ports {
            port.dirty = true;
            for vphy in &mut port.vphys {
                vphy.dirty = true;
            }
        }

        let mut refresh = PortRefresh::default();
        for phy in report {
            if phy.attached_address.is_zero() || phy.phy >= 64 {
                continue;
            }
            let bit = 1u64 << phy.phy;
            let index = match self.ports.iter().position(|p| p.port_id == phy.port) {
                Some(index) => index,
                None => {
                    refresh.added.push(phy.port);
                    self.ports.push(HbaPort {
                        port_id: phy.port,
                        sas_address: phy.attached_address,
                        phy_mask: 0,
                        dirty: false,
                        vphys: Vec::new(),
                    });
                    self.ports.len() - 1
                }
            };
            let port = &mut self.ports[index];
            if port.dirty {
                port.dirty = false;
                port.phy_mask = 0;
            }

            if phy.is_virtual {
                match port.vphys.iter_mut().find(|v| v.sas_address == phy.attached_address) {
                    Some(vphy) => {
                        vphy.dirty = false;
                        vphy.phy_mask |= bit;
                    }
                    None => port.vphys.push(VirtualPhy {
                        sas_address: phy.attached_address,
                        phy_mask: bit,
                        dirty: false,
                    }),
                }
            } else {
                port.sas_address = phy.attached_address;
                port.phy_mask |= bit;
            }
        }

        for port in &mut self.ports {
            port.vphys.retain(|v| !v.dirty);
        }
        self.ports.retain(|p| {
            if p.dirty {
                refresh.removed.push(p.port_id);
            }
            !p.dirty
        });
        refresh
    }
}

// =============================================================================
// ENCLOSURES
// =============================================================================

/// Cached enclosure page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnclosureNode {
    /// Enclosure handle
    pub handle: DeviceHandle,
    /// Logical id
    pub logical_id: u64,
    /// Slot count
    pub num_slots: u16,
    /// First slot number
    pub start_slot: u16,
    /// Chassis slot
    pub chassis_slot: Option<u8>,
}

impl From<EnclosurePage0> for EnclosureNode {
    fn from(page: EnclosurePage0) -> Self {
        Self {
            handle: page.handle,
            logical_id: page.logical_id,
            num_slots: page.num_slots,
            start_slot: page.start_slot,
            chassis_slot: page.chassis_slot,
        }
    }
}

// =============================================================================
// NODE TABLE
// =============================================================================

/// Everything that is not an exposed device, under one lock
#[derive(Debug, Default)]
pub struct NodeTable {
    /// The host node
    pub host: HostNode,
    /// Expanders
    pub expanders: DeviceList<Expander>,
    /// Enclosures by handle
    pub enclosures: BTreeMap<DeviceHandle, EnclosureNode>,
}

impl NodeTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Expander by address on any port
    pub fn expander_by_address(&self, sas_address: SasAddress) -> Option<alloc::sync::Arc<Expander>> {
        self.expanders
            .all()
            .into_iter()
            .find(|e| e.sas_address == sas_address)
    }

    /// Run `f` on the link table of the node with this address
    pub fn with_links<R>(&mut self, node_address: SasAddress, f: impl FnOnce(&mut LinkTable) -> R) -> Option<R> {
        if node_address == self.host.sas_address {
            return Some(f(&mut self.host.links));
        }
        self.expander_by_address(node_address)
            .map(|expander| expander.with_links(f))
    }
}

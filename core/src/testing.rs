//! Test doubles: a scripted controller, a stepping clock and a recording
//! upstream host.

use crate::adapter::Adapter;
use crate::config::EngineConfig;
use crate::error::{HbaError, HbaResult};
use crate::host::{DeviceClass, ScsiHost, TargetId, TargetPrivate};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use hashbrown::HashMap;
use hba_hal::config_page::{
    ConfigPage, EnclosurePage0, ExpanderPage0, ExpanderPage1, IoUnitPhy, PageForm, PageRequest,
    PageType, PcieDeviceFlags, PcieDeviceInfo, PcieDevicePage0, PhysDiskPage0, RaidVolumePage0,
    RaidVolumePage1, SasDeviceFlags, SasDeviceInfo, SasDevicePage0, SasIoUnitPage0, VolumeState,
};
use hba_hal::firmware::{ControllerTransport, IocState};
use hba_hal::mpi::{
    IoUnitControlReply, IocStatus, Reply, ReplyDescriptor, Request, ScsiIoReply, ScsiIoRequest,
    SlotPriority, TaskType, TmReply,
};
use hba_hal::scsi::{self, opcode};
use hba_hal::timer::Clock;
use hba_hal::{DeviceHandle, HalError, HalResult, LinkRate, PortId, SasAddress, Smid, Wwid};
use spin::Mutex;

pub(crate) const HOST_ADDRESS: u64 = 0x5000_0000_0000_0001;
pub(crate) const HOST_PHYS: u8 = 8;

pub(crate) fn h(raw: u16) -> DeviceHandle {
    DeviceHandle::new(raw)
}

// =============================================================================
// CLOCK
// =============================================================================

/// Clock that only moves when someone delays
#[derive(Debug, Default)]
pub(crate) struct MockClock(AtomicU64);

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn delay_ms(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::Relaxed);
    }
}

impl MockClock {
    pub(crate) fn advance(&self, ms: u64) {
        self.delay_ms(ms);
    }
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// What the scripted controller does with one request
#[derive(Debug, Clone)]
pub(crate) enum MockReply {
    /// Answer with this reply
    Reply(Reply),
    /// Never answer
    Hold,
    /// Whatever the default behaviour is
    Default,
}

type Responder = Box<dyn FnMut(&Request) -> MockReply + Send>;

struct MockInner {
    ioc_state: IocState,
    slot_limit: usize,
    in_use: BTreeSet<u16>,
    next_smid: u16,
    lowest_free_smid: bool,
    io_unit: Option<SasIoUnitPage0>,
    pages: HashMap<PageType, BTreeMap<DeviceHandle, ConfigPage>>,
    expander_phys: BTreeMap<(DeviceHandle, u8), ExpanderPage1>,
    replies: VecDeque<ReplyDescriptor>,
    held: Vec<(Smid, ScsiIoRequest)>,
    submitted: Vec<(Smid, Request)>,
    responder: Option<Responder>,
    tm_terminates: bool,
    resets: usize,
    reset_result: HalResult<()>,
    port_enables: usize,
}

/// Scripted controller
///
/// Requests are answered at submit time by pushing the reply onto the reply
/// queue. SCSI commands other than the probe commands are held until a test
/// completes them. A successful task-management request terminates the held
/// commands in its scope before its own reply is queued.
pub(crate) struct MockController {
    inner: Mutex<MockInner>,
}

impl core::fmt::Debug for MockController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MockController").finish_non_exhaustive()
    }
}

fn inquiry_data() -> Vec<u8> {
    let mut data = vec![0u8; 36];
    data[8..16].copy_from_slice(b"VENDOR  ");
    data[16..32].copy_from_slice(b"DISK            ");
    data[32..36].copy_from_slice(b"0001");
    data
}

fn default_reply(request: &Request) -> Option<Reply> {
    match request {
        Request::ScsiIo(io) => match io.cdb.opcode() {
            opcode::TEST_UNIT_READY | opcode::START_STOP_UNIT => Some(Reply::ScsiIo(ScsiIoReply::good(Vec::new()))),
            opcode::REPORT_LUNS => Some(Reply::ScsiIo(ScsiIoReply::good(scsi::encode_report_luns(&[0])))),
            opcode::INQUIRY => Some(Reply::ScsiIo(ScsiIoReply::good(inquiry_data()))),
            _ => None,
        },
        Request::TaskManagement(_) => Some(Reply::TaskManagement(TmReply::success(0))),
        Request::IoUnitControl(_) => Some(Reply::IoUnitControl(IoUnitControlReply {
            ioc_status: IocStatus::Success,
        })),
    }
}

impl MockController {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(MockInner {
                ioc_state: IocState::Operational,
                slot_limit: 64,
                in_use: BTreeSet::new(),
                next_smid: 1,
                lowest_free_smid: false,
                io_unit: None,
                pages: HashMap::new(),
                expander_phys: BTreeMap::new(),
                replies: VecDeque::new(),
                held: Vec::new(),
                submitted: Vec::new(),
                responder: None,
                tm_terminates: true,
                resets: 0,
                reset_result: Ok(()),
                port_enables: 0,
            }),
        }
    }

    pub(crate) fn set_io_unit(&self, page: SasIoUnitPage0) {
        self.inner.lock().io_unit = Some(page);
    }

    pub(crate) fn set_page(&self, handle: DeviceHandle, page: ConfigPage) {
        let kind = match &page {
            ConfigPage::SasIoUnit0(_) => PageType::SasIoUnit0,
            ConfigPage::SasDevice0(_) => PageType::SasDevice0,
            ConfigPage::Expander0(_) => PageType::Expander0,
            ConfigPage::Expander1(_) => PageType::Expander1,
            ConfigPage::PcieDevice0(_) => PageType::PcieDevice0,
            ConfigPage::RaidVolume0(_) => PageType::RaidVolume0,
            ConfigPage::RaidVolume1(_) => PageType::RaidVolume1,
            ConfigPage::PhysDisk0(_) => PageType::PhysDisk0,
            ConfigPage::Enclosure0(_) => PageType::Enclosure0,
        };
        self.inner.lock().pages.entry(kind).or_default().insert(handle, page);
    }

    pub(crate) fn remove_page(&self, kind: PageType, handle: DeviceHandle) {
        if let Some(pages) = self.inner.lock().pages.get_mut(&kind) {
            pages.remove(&handle);
        }
    }

    pub(crate) fn set_expander_phy(&self, handle: DeviceHandle, page: ExpanderPage1) {
        self.inner.lock().expander_phys.insert((handle, page.phy), page);
    }

    pub(crate) fn set_responder(&self, responder: impl FnMut(&Request) -> MockReply + Send + 'static) {
        self.inner.lock().responder = Some(Box::new(responder));
    }

    pub(crate) fn set_ioc_state(&self, state: IocState) {
        self.inner.lock().ioc_state = state;
    }

    pub(crate) fn set_slot_limit(&self, limit: usize) {
        self.inner.lock().slot_limit = limit;
    }

    /// Hand out the lowest free SMID, the way real frame pools recycle them
    pub(crate) fn set_lowest_free_smid(&self, enabled: bool) {
        self.inner.lock().lowest_free_smid = enabled;
    }

    pub(crate) fn set_tm_terminates(&self, terminates: bool) {
        self.inner.lock().tm_terminates = terminates;
    }

    pub(crate) fn set_reset_result(&self, result: HalResult<()>) {
        self.inner.lock().reset_result = result;
    }

    pub(crate) fn resets(&self) -> usize {
        self.inner.lock().resets
    }

    pub(crate) fn port_enables(&self) -> usize {
        self.inner.lock().port_enables
    }

    pub(crate) fn slots_in_use(&self) -> usize {
        self.inner.lock().in_use.len()
    }

    pub(crate) fn held(&self) -> Vec<Smid> {
        self.inner.lock().held.iter().map(|(smid, _)| *smid).collect()
    }

    /// Complete a held SCSI command
    pub(crate) fn complete_held(&self, smid: Smid, reply: ScsiIoReply) {
        let mut inner = self.inner.lock();
        inner.held.retain(|(s, _)| *s != smid);
        inner.replies.push_back(ReplyDescriptor {
            smid,
            reply: Reply::ScsiIo(reply),
        });
    }

    pub(crate) fn submitted_with_smids(&self) -> Vec<(Smid, Request)> {
        self.inner.lock().submitted.clone()
    }

    pub(crate) fn submitted(&self) -> Vec<Request> {
        self.inner.lock().submitted.iter().map(|(_, r)| r.clone()).collect()
    }

    pub(crate) fn clear_submitted(&self) {
        self.inner.lock().submitted.clear();
    }

    /// Submitted CDB opcodes for one handle, in order
    pub(crate) fn scsi_opcodes(&self, handle: DeviceHandle) -> Vec<u8> {
        self.submitted()
            .iter()
            .filter_map(|r| match r {
                Request::ScsiIo(io) if io.handle == handle => Some(io.cdb.opcode()),
                _ => None,
            })
            .collect()
    }

    /// Submitted task-management functions, in order
    pub(crate) fn tm_types(&self) -> Vec<(DeviceHandle, TaskType, bool)> {
        self.submitted()
            .iter()
            .filter_map(|r| match r {
                Request::TaskManagement(tm) => Some((tm.handle, tm.task_type, tm.for_removal)),
                _ => None,
            })
            .collect()
    }

    /// Number of remove-device directives submitted for `handle`
    pub(crate) fn directives(&self, handle: DeviceHandle) -> usize {
        self.submitted()
            .iter()
            .filter(|r| matches!(r, Request::IoUnitControl(c) if c.handle == handle))
            .count()
    }

    fn terminate_held(inner: &mut MockInner, request: &hba_hal::mpi::TmRequest) -> u32 {
        let in_scope = |io: &ScsiIoRequest, smid: Smid| match request.task_type {
            TaskType::AbortTask | TaskType::QueryTask => Some(smid) == request.task_smid,
            TaskType::AbortTaskSet | TaskType::LogicalUnitReset => {
                io.handle == request.handle && io.lun == request.lun
            }
            TaskType::TargetReset => io.handle == request.handle,
        };
        if request.task_type == TaskType::QueryTask {
            return 0;
        }
        let (terminated, kept): (Vec<_>, Vec<_>) = core::mem::take(&mut inner.held)
            .into_iter()
            .partition(|(smid, io)| in_scope(io, *smid));
        inner.held = kept;
        for (smid, _) in &terminated {
            inner.replies.push_back(ReplyDescriptor {
                smid: *smid,
                reply: Reply::ScsiIo(ScsiIoReply::terminated(IocStatus::ScsiTaskTerminated)),
            });
        }
        terminated.len() as u32
    }

    fn next_by_handle(pages: &BTreeMap<DeviceHandle, ConfigPage>, after: DeviceHandle) -> Option<ConfigPage> {
        if after == DeviceHandle::ENUM_START {
            return pages.values().next().cloned();
        }
        pages
            .range((core::ops::Bound::Excluded(after), core::ops::Bound::Unbounded))
            .next()
            .map(|(_, page)| page.clone())
    }
}

impl ControllerTransport for MockController {
    fn adapter_state(&self) -> IocState {
        self.inner.lock().ioc_state
    }

    fn get_request_slot(&self, _priority: SlotPriority) -> Option<Smid> {
        let mut inner = self.inner.lock();
        if inner.in_use.len() >= inner.slot_limit {
            return None;
        }
        if inner.lowest_free_smid {
            let smid = (1..=u16::MAX).find(|s| !inner.in_use.contains(s))?;
            inner.in_use.insert(smid);
            return Some(Smid::new(smid));
        }
        loop {
            let smid = inner.next_smid;
            inner.next_smid = if smid == u16::MAX { 1 } else { smid + 1 };
            if inner.in_use.insert(smid) {
                return Some(Smid::new(smid));
            }
        }
    }

    fn free_request_slot(&self, smid: Smid) {
        self.inner.lock().in_use.remove(&smid.as_u16());
    }

    fn submit_request(&self, smid: Smid, request: Request) -> HalResult<()> {
        let mut inner = self.inner.lock();
        if !inner.ioc_state.is_operational() {
            return Err(HalError::NotOperational);
        }
        inner.submitted.push((smid, request.clone()));

        let scripted = match inner.responder.as_mut() {
            Some(responder) => responder(&request),
            None => MockReply::Default,
        };
        let reply = match scripted {
            MockReply::Reply(reply) => Some(reply),
            MockReply::Hold => None,
            MockReply::Default => default_reply(&request),
        };

        match (&request, reply) {
            (Request::TaskManagement(tm), Some(Reply::TaskManagement(mut tm_reply))) => {
                if tm_reply.ioc_status.is_success() && tm_reply.response_code.is_success() && inner.tm_terminates {
                    tm_reply.termination_count = Self::terminate_held(&mut inner, tm);
                }
                inner.replies.push_back(ReplyDescriptor {
                    smid,
                    reply: Reply::TaskManagement(tm_reply),
                });
            }
            (_, Some(reply)) => inner.replies.push_back(ReplyDescriptor { smid, reply }),
            (Request::ScsiIo(io), None) => inner.held.push((smid, io.clone())),
            (_, None) => {}
        }
        Ok(())
    }

    fn poll_reply(&self) -> Option<ReplyDescriptor> {
        self.inner.lock().replies.pop_front()
    }

    fn read_config_page(&self, request: PageRequest) -> HalResult<ConfigPage> {
        let inner = self.inner.lock();
        let found = match (request.page, request.form) {
            (PageType::SasIoUnit0, _) => inner.io_unit.clone().map(ConfigPage::SasIoUnit0),
            (PageType::Expander1, PageForm::HandleAndPhy(handle, phy)) => inner
                .expander_phys
                .get(&(handle, phy))
                .copied()
                .map(ConfigPage::Expander1),
            (kind, PageForm::Handle(handle)) => inner.pages.get(&kind).and_then(|p| p.get(&handle).cloned()),
            (kind, PageForm::GetNextHandle(after)) => inner
                .pages
                .get(&kind)
                .and_then(|p| Self::next_by_handle(p, after)),
            _ => None,
        };
        found.ok_or(HalError::ConfigPageInvalid)
    }

    fn hard_reset(&self) -> HalResult<()> {
        let mut inner = self.inner.lock();
        inner.resets += 1;
        inner.replies.clear();
        inner.held.clear();
        inner.in_use.clear();
        if inner.reset_result.is_ok() {
            inner.ioc_state = IocState::Operational;
        }
        inner.reset_result
    }

    fn send_port_enable(&self) -> HalResult<()> {
        self.inner.lock().port_enables += 1;
        Ok(())
    }
}

// =============================================================================
// UPSTREAM HOST
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostCall {
    Add(TargetId, u64),
    Remove(DeviceClass, TargetId),
    Block(TargetId),
    Unblock(TargetId),
    IoDone(Smid, IocStatus),
}

#[derive(Debug, Default)]
pub(crate) struct RecordingHost {
    calls: Mutex<Vec<HostCall>>,
    refuse_adds: AtomicBool,
}

impl RecordingHost {
    pub(crate) fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().clone()
    }

    /// Identities exposed, in order
    pub(crate) fn added(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                HostCall::Add(_, identity) => Some(identity),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn removed(&self) -> Vec<TargetId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                HostCall::Remove(_, id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn io_done(&self) -> Vec<(Smid, IocStatus)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                HostCall::IoDone(smid, status) => Some((smid, status)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn set_refuse_adds(&self, refuse: bool) {
        self.refuse_adds.store(refuse, Ordering::Relaxed);
    }
}

impl ScsiHost for RecordingHost {
    fn device_add(&self, target: &Arc<TargetPrivate>) -> HbaResult<()> {
        if self.refuse_adds.load(Ordering::Relaxed) {
            return Err(HbaError::HostBusy);
        }
        self.calls.lock().push(HostCall::Add(target.id(), target.identity()));
        Ok(())
    }

    fn device_remove(&self, class: DeviceClass, id: TargetId) {
        self.calls.lock().push(HostCall::Remove(class, id));
    }

    fn device_block(&self, id: TargetId) {
        self.calls.lock().push(HostCall::Block(id));
    }

    fn device_unblock(&self, id: TargetId) {
        self.calls.lock().push(HostCall::Unblock(id));
    }

    fn io_done(&self, smid: Smid, reply: &ScsiIoReply) {
        self.calls.lock().push(HostCall::IoDone(smid, reply.ioc_status));
    }
}

// =============================================================================
// PAGES
// =============================================================================

pub(crate) fn sas_page(handle: u16, address: u64, parent: u16, phy: u8) -> SasDevicePage0 {
    SasDevicePage0 {
        handle: h(handle),
        sas_address: SasAddress::new(address),
        parent_handle: h(parent),
        phy,
        enclosure_handle: DeviceHandle::NONE,
        slot: 0,
        port: PortId::new(0),
        device_info: SasDeviceInfo::END_DEVICE | SasDeviceInfo::SSP_TARGET,
        flags: SasDeviceFlags::DEVICE_PRESENT,
        access_status: 0,
        enclosure_level: 0,
        connector_name: String::new(),
    }
}

pub(crate) fn expander_page(handle: u16, address: u64, parent: u16, num_phys: u8) -> ExpanderPage0 {
    ExpanderPage0 {
        handle: h(handle),
        parent_handle: h(parent),
        sas_address: SasAddress::new(address),
        num_phys,
        enclosure_handle: DeviceHandle::NONE,
        port: PortId::new(0),
    }
}

pub(crate) fn pcie_page(handle: u16, wwid: u64, parent: u16) -> PcieDevicePage0 {
    PcieDevicePage0 {
        handle: h(handle),
        wwid: Wwid::new(wwid),
        parent_handle: h(parent),
        port_num: 0,
        enclosure_handle: DeviceHandle::NONE,
        slot: 0,
        device_info: PcieDeviceInfo::NVME | PcieDeviceInfo::END_DEVICE,
        flags: PcieDeviceFlags::DEVICE_PRESENT,
        access_status: 0,
    }
}

pub(crate) fn enclosure_page(handle: u16, logical_id: u64) -> EnclosurePage0 {
    EnclosurePage0 {
        handle: h(handle),
        logical_id,
        num_slots: 24,
        start_slot: 0,
        chassis_slot: None,
    }
}

// =============================================================================
// FIXTURE
// =============================================================================

/// An adapter wired to the test doubles
pub(crate) struct Fixture {
    pub(crate) mock: Arc<MockController>,
    pub(crate) clock: Arc<MockClock>,
    pub(crate) host: Arc<RecordingHost>,
    pub(crate) adapter: Adapter,
}

impl Fixture {
    /// Adapter with an 8-phy host and nothing attached, not yet started
    pub(crate) fn new(config: EngineConfig) -> Self {
        let mock = Arc::new(MockController::new());
        mock.set_io_unit(SasIoUnitPage0 {
            sas_address: SasAddress::new(HOST_ADDRESS),
            phys: (0..HOST_PHYS)
                .map(|phy| IoUnitPhy {
                    phy,
                    port: PortId::new(0),
                    attached_handle: DeviceHandle::NONE,
                    link_rate: LinkRate::UNKNOWN,
                    is_virtual: false,
                })
                .collect(),
        });
        let clock = Arc::new(MockClock::default());
        let host = Arc::new(RecordingHost::default());
        let adapter = Adapter::new("hba0", config, mock.clone(), clock.clone(), host.clone());
        Self { mock, clock, host, adapter }
    }

    /// Started adapter with initial discovery already complete
    pub(crate) fn running(config: EngineConfig) -> Self {
        let fixture = Self::new(config);
        fixture.adapter.start().expect("start");
        fixture.adapter.complete_initial_discovery();
        fixture
    }

    pub(crate) fn add_sas(&self, page: SasDevicePage0) {
        self.mock.set_page(page.handle, ConfigPage::SasDevice0(page));
    }

    pub(crate) fn add_expander(&self, page: ExpanderPage0, attached: &[(u8, u16)]) {
        for phy in 0..page.num_phys {
            let attached_handle = attached
                .iter()
                .find(|(p, _)| *p == phy)
                .map_or(DeviceHandle::NONE, |(_, handle)| h(*handle));
            self.mock.set_expander_phy(
                page.handle,
                ExpanderPage1 {
                    phy,
                    attached_handle,
                    link_rate: LinkRate::RATE_12_0,
                    attached_device_info: SasDeviceInfo::END_DEVICE | SasDeviceInfo::SSP_TARGET,
                },
            );
        }
        self.mock.set_page(page.handle, ConfigPage::Expander0(page));
    }

    pub(crate) fn add_pcie(&self, page: PcieDevicePage0) {
        self.mock.set_page(page.handle, ConfigPage::PcieDevice0(page));
    }

    pub(crate) fn add_volume(&self, handle: u16, wwid: u64, state: VolumeState) {
        self.mock.set_page(
            h(handle),
            ConfigPage::RaidVolume0(RaidVolumePage0 {
                handle: h(handle),
                state,
                num_phys_disks: 2,
            }),
        );
        self.mock.set_page(
            h(handle),
            ConfigPage::RaidVolume1(RaidVolumePage1 {
                handle: h(handle),
                wwid: Wwid::new(wwid),
            }),
        );
    }

    pub(crate) fn add_phys_disk(&self, number: u8, handle: u16) {
        self.mock.set_page(
            h(handle),
            ConfigPage::PhysDisk0(PhysDiskPage0 {
                phys_disk_num: number,
                handle: h(handle),
            }),
        );
    }
}

//! End-to-end tests of the adapter against the scripted controller.

use crate::config::{BootDeviceRequests, BootDeviceSelector, EngineConfig, ProbePolicy};
use crate::discovery::AddResult;
use crate::error::{HbaError, TmFailure};
use crate::fw_event::{
    DeviceStatusChange, DeviceStatusReason, DiscoveryEvent, EnclosureStatus, EnclosureStatusChange,
    ExpanderStatus, FwEventData, IrConfigChangeList, IrConfigElement, IrElementReason, IrVolumeEvent,
    PciePortChange, PciePortReason, PcieTopologyChangeList, PhyChange, PhyReason,
    SasTopologyChangeList, SwitchStatus,
};
use crate::host::{DeviceClass, TargetFlags, TargetPrivate};
use crate::prober::DeviceReadiness;
use crate::registry::{DeviceFlags, PcieDevice, RaidDevice, SasDevice, TrackedDevice};
use crate::reset::{AdapterState, ResetReason};
use crate::testing::*;
use crate::tm::{RecoveryStep, RemovalPurpose, RemovalStart, TmRequestParams};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use hba_hal::config_page::{PageType, VolumeState};
use hba_hal::firmware::IocState;
use hba_hal::mpi::{
    IoUnitControlReply, IocStatus, Reply, Request, ScsiIoReply, TaskType, TmReply, TmResponseCode,
};
use hba_hal::scsi::{asc, ascq, opcode, sense_key, Cdb, ScsiStatus, SenseData};
use hba_hal::timer::Clock;
use hba_hal::{DeviceHandle, HalError, LinkRate, PortId, SasAddress, Smid, Wwid};

const ADDR_A: u64 = 0x5000_C500_0000_00A0;
const ADDR_B: u64 = 0x5000_C500_0000_00B0;
const EXP_ADDR: u64 = 0x5000_0800_0000_0E00;
const CHILD_EXP_ADDR: u64 = 0x5000_0800_0000_0E10;

fn no_probe() -> Fixture {
    Fixture::running(EngineConfig::no_probe())
}

fn read_cdb() -> Cdb {
    Cdb::from_bytes(&[0x28, 0, 0, 0, 0, 0, 0, 0, 8, 0])
}

fn sas_list(expander: u16, status: ExpanderStatus, phys: &[(u16, PhyReason)]) -> FwEventData {
    FwEventData::SasTopologyChange(SasTopologyChangeList {
        expander_handle: h(expander),
        enclosure_handle: DeviceHandle::NONE,
        exp_status: status,
        start_phy: 0,
        port: PortId::new(0),
        phys: phys
            .iter()
            .map(|&(handle, reason)| PhyChange::new(h(handle), reason, LinkRate::RATE_12_0))
            .collect(),
    })
}

fn pcie_list(switch: u16, status: SwitchStatus, ports: &[(u16, PciePortReason)]) -> FwEventData {
    FwEventData::PcieTopologyChange(PcieTopologyChangeList {
        switch_handle: h(switch),
        enclosure_handle: DeviceHandle::NONE,
        switch_status: status,
        start_port: 0,
        ports: ports
            .iter()
            .map(|&(handle, reason)| PciePortChange::new(h(handle), reason, LinkRate::RATE_12_0))
            .collect(),
    })
}

fn ir_change(reason: IrElementReason, volume: u16, disk: u16) -> FwEventData {
    FwEventData::IrConfigChange(IrConfigChangeList {
        foreign: false,
        elements: vec![IrConfigElement {
            reason,
            volume_handle: h(volume),
            phys_disk_handle: h(disk),
        }],
    })
}

/// Register a direct-attached SAS device and return its upstream target
fn exposed(fx: &Fixture, handle: u16, address: u64) -> Arc<TargetPrivate> {
    fx.add_sas(sas_page(handle, address, 0, 0));
    assert_eq!(fx.adapter.add_device(h(handle), 0, false), Ok(AddResult::Done));
    fx.adapter.target_by_handle(h(handle)).expect("device exposed")
}

fn not_ready(qualifier: u8) -> MockReply {
    MockReply::Reply(Reply::ScsiIo(ScsiIoReply::check_condition(SenseData::new(
        sense_key::NOT_READY,
        asc::LUN_NOT_READY,
        qualifier,
    ))))
}

fn is_tur(request: &Request) -> bool {
    matches!(request, Request::ScsiIo(io) if io.cdb.opcode() == opcode::TEST_UNIT_READY)
}

fn removal_resets(fx: &Fixture, handle: u16) -> usize {
    fx.mock
        .tm_types()
        .iter()
        .filter(|(hd, task, for_removal)| *hd == h(handle) && *task == TaskType::TargetReset && *for_removal)
        .count()
}

// =============================================================================
// DISCOVERY
// =============================================================================

#[test]
fn test_add_device_registers_and_exposes() {
    let fx = no_probe();
    fx.add_sas(sas_page(0x0012, 0xAABB_CCDD, 0, 3));

    assert_eq!(fx.adapter.add_device(h(0x0012), 0, false), Ok(AddResult::Done));

    let dev = fx.adapter.registry().find_by_handle::<SasDevice>(h(0x0012)).expect("registered");
    assert_eq!(dev.sas_address, SasAddress::new(0xAABB_CCDD));
    assert_eq!(dev.parent_address, SasAddress::new(HOST_ADDRESS));
    let target = dev.state().target().expect("target");
    assert_eq!(target.class(), DeviceClass::Sas);
    assert_eq!(target.handle(), h(0x0012));
    assert_eq!(fx.host.added(), [0xAABB_CCDD]);
}

#[test]
fn test_add_device_twice_keeps_one_entry() {
    let fx = no_probe();
    fx.add_sas(sas_page(0x09, ADDR_A, 0, 0));

    assert_eq!(fx.adapter.add_device(h(0x09), 0, false), Ok(AddResult::Done));
    assert_eq!(fx.adapter.add_device(h(0x09), 0, false), Ok(AddResult::Done));

    // Same device reported under a new handle
    fx.add_sas(sas_page(0x0A, ADDR_A, 0, 0));
    assert_eq!(fx.adapter.add_device(h(0x0A), 0, false), Ok(AddResult::Done));

    assert_eq!(fx.adapter.registry().counts().sas, 1);
    assert_eq!(fx.host.added().len(), 1);
    assert_eq!(fx.adapter.stats().devices_added, 1);
    let dev = fx.adapter.registry().find_by_handle::<SasDevice>(h(0x0A)).expect("moved");
    assert_eq!(dev.state().target().map(|t| t.handle()), Some(h(0x0A)));
}

#[test]
fn test_add_device_rejects_discovery_errors() {
    let fx = no_probe();
    let mut page = sas_page(0x09, ADDR_A, 0, 0);
    page.access_status = 0x01;
    fx.add_sas(page);

    assert!(matches!(
        fx.adapter.add_device(h(0x09), 0, false),
        Err(HbaError::AccessStatus { status: 0x01, .. })
    ));
    assert_eq!(
        fx.adapter.add_device(h(0x44), 0, false),
        Err(HbaError::Hal(HalError::ConfigPageInvalid))
    );
    assert_eq!(fx.adapter.registry().counts().sas, 0);
    assert!(fx.host.added().is_empty());
}

#[test]
fn test_upstream_refusal_unregisters() {
    let fx = no_probe();
    fx.host.set_refuse_adds(true);
    fx.add_sas(sas_page(0x09, ADDR_A, 0, 0));

    assert_eq!(fx.adapter.add_device(h(0x09), 0, false), Err(HbaError::HostBusy));
    assert!(fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).is_none());
}

#[test]
fn test_boot_devices_exposed_first() {
    let config = EngineConfig::new().with_boot_devices(BootDeviceRequests {
        requested: Some(BootDeviceSelector::SasAddress(SasAddress::new(ADDR_B))),
        ..BootDeviceRequests::default()
    });
    let fx = Fixture::new(config);
    fx.adapter.start().expect("start");
    assert!(fx.adapter.is_loading());
    assert_eq!(fx.mock.port_enables(), 1);

    fx.add_sas(sas_page(0x09, ADDR_A, 0, 0));
    fx.add_sas(sas_page(0x0A, ADDR_B, 0, 1));
    assert!(fx.adapter.on_firmware_event(sas_list(
        0,
        ExpanderStatus::Responding,
        &[(0x09, PhyReason::TargetAdded), (0x0A, PhyReason::TargetAdded)],
    )));
    assert_eq!(fx.adapter.process_fw_events(), 1);

    // Staged while loading, probed because the adapter is starting up
    assert_eq!(fx.adapter.registry().counts().sas, 2);
    assert!(fx.host.added().is_empty());
    assert!(fx.mock.scsi_opcodes(h(0x09)).contains(&opcode::TEST_UNIT_READY));
    let boot = fx.adapter.registry().find_by_handle::<SasDevice>(h(0x0A)).expect("staged");
    assert!(boot.state().flags().contains(DeviceFlags::BOOT));
    assert!(boot.inquiry().is_some());

    fx.adapter.complete_initial_discovery();
    assert!(!fx.adapter.is_loading());
    assert_eq!(fx.host.added(), [ADDR_B, ADDR_A]);
}

#[test]
fn test_topology_adds_direct_attached_device() {
    let fx = no_probe();
    fx.add_sas(sas_page(0x09, ADDR_A, 0, 2));
    let mut list = sas_list(0, ExpanderStatus::Responding, &[(0, PhyReason::NoChange), (0, PhyReason::NoChange)]);
    if let FwEventData::SasTopologyChange(list) = &mut list {
        list.phys.push(PhyChange::new(h(0x09), PhyReason::TargetAdded, LinkRate::RATE_6_0));
    }

    fx.adapter.on_firmware_event(list);
    assert_eq!(fx.adapter.process_fw_events(), 1);

    assert!(fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).is_some());
    let link = fx.adapter.registry().with_nodes(|nodes| nodes.host.links.phys()[2]);
    assert_eq!(link.attached_handle, h(0x09));
    assert_eq!(link.link_rate, LinkRate::RATE_6_0);
    assert_eq!(fx.adapter.stats().events_processed, 1);
}

#[test]
fn test_slow_link_is_not_added() {
    let fx = no_probe();
    fx.add_sas(sas_page(0x09, ADDR_A, 0, 0));
    let list = FwEventData::SasTopologyChange(SasTopologyChangeList {
        expander_handle: DeviceHandle::NONE,
        enclosure_handle: DeviceHandle::NONE,
        exp_status: ExpanderStatus::Responding,
        start_phy: 0,
        port: PortId::new(0),
        phys: vec![PhyChange::new(h(0x09), PhyReason::TargetAdded, LinkRate::DISABLED)],
    });

    fx.adapter.on_firmware_event(list);
    fx.adapter.process_fw_events();

    assert!(fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).is_none());
}

#[test]
fn test_unready_device_requeued_then_added() {
    let fx = Fixture::running(EngineConfig {
        bringup_probe: ProbePolicy::Always,
        ..EngineConfig::no_probe()
    });
    let ready = Arc::new(AtomicBool::new(false));
    let gate = ready.clone();
    fx.mock.set_responder(move |request| {
        if is_tur(request) && !gate.load(Ordering::Relaxed) {
            not_ready(ascq::BECOMING_READY)
        } else {
            MockReply::Default
        }
    });
    fx.add_sas(sas_page(0x09, ADDR_A, 0, 0));
    fx.adapter
        .on_firmware_event(sas_list(0, ExpanderStatus::Responding, &[(0x09, PhyReason::TargetAdded)]));

    assert_eq!(fx.adapter.process_fw_events(), 0);
    assert_eq!(fx.adapter.stats().events_requeued, 1);
    assert!(fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).is_none());
    let pending = fx.adapter.events().pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count(0), 1);

    // Not due yet
    ready.store(true, Ordering::Relaxed);
    assert_eq!(fx.adapter.process_fw_events(), 0);

    let due = fx.adapter.events().next_due_ms().expect("delayed");
    fx.clock.advance(due - fx.clock.now_ms());
    assert_eq!(fx.adapter.process_fw_events(), 1);
    assert!(fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).is_some());
}

#[test]
fn test_device_status_change_holds_admission() {
    let fx = no_probe();
    let target = exposed(&fx, 0x09, ADDR_A);
    let status = |reason| {
        FwEventData::SasDeviceStatusChange(DeviceStatusChange {
            handle: h(0x09),
            sas_address: SasAddress::new(ADDR_A),
            reason,
        })
    };

    fx.adapter.on_firmware_event(status(DeviceStatusReason::InternalDeviceResetStart));
    fx.adapter.process_fw_events();
    assert_eq!(
        fx.adapter.queue_scsi_io(&target, 0, read_cdb(), 4096),
        Err(HbaError::DeviceBlocked)
    );

    fx.adapter.on_firmware_event(status(DeviceStatusReason::InternalDeviceResetComplete));
    fx.adapter.process_fw_events();
    assert!(fx.adapter.queue_scsi_io(&target, 0, read_cdb(), 4096).is_ok());
}

#[test]
fn test_enclosure_and_discovery_events() {
    let fx = no_probe();
    fx.mock.set_page(h(0x02), hba_hal::config_page::ConfigPage::Enclosure0(enclosure_page(0x02, 0x5000_1234)));

    fx.adapter.on_firmware_event(FwEventData::EnclosureStatusChange(EnclosureStatusChange {
        enclosure_handle: h(0x02),
        status: EnclosureStatus::Added,
    }));
    fx.adapter.on_firmware_event(FwEventData::SasDiscovery(DiscoveryEvent { started: true, status: 0 }));
    fx.adapter.process_fw_events();
    assert_eq!(fx.adapter.registry().enclosure(h(0x02)).map(|e| e.logical_id), Some(0x5000_1234));
    assert!(fx.adapter.state.discovery_active());

    let mut page = sas_page(0x09, ADDR_A, 0, 0);
    page.enclosure_handle = h(0x02);
    page.slot = 5;
    fx.add_sas(page);
    fx.adapter.add_device(h(0x09), 0, false).expect("added");
    let location = fx
        .adapter
        .registry()
        .find_by_handle::<SasDevice>(h(0x09))
        .map(|d| d.state().location())
        .expect("registered");
    assert_eq!(location.enclosure_logical_id, Some(0x5000_1234));
    assert_eq!(location.slot, 5);

    fx.adapter.on_firmware_event(FwEventData::EnclosureStatusChange(EnclosureStatusChange {
        enclosure_handle: h(0x02),
        status: EnclosureStatus::NotResponding,
    }));
    fx.adapter.on_firmware_event(FwEventData::SasDiscovery(DiscoveryEvent { started: false, status: 0 }));
    fx.adapter.process_fw_events();
    assert!(fx.adapter.registry().enclosure(h(0x02)).is_none());
    assert!(!fx.adapter.state.discovery_active());
}

// =============================================================================
// PROBING
// =============================================================================

#[test]
fn test_exactly_one_start_unit_per_probe() {
    let fx = no_probe();
    fx.mock.set_responder(|request| {
        if is_tur(request) {
            not_ready(ascq::INITIALIZING_COMMAND_REQUIRED)
        } else {
            MockReply::Default
        }
    });

    let readiness = fx.adapter.wait_for_device_ready(h(0x09), 0, false);

    assert_eq!(readiness, DeviceReadiness::NeedsStartUnit);
    assert!(readiness.should_retry());
    let ops = fx.mock.scsi_opcodes(h(0x09));
    assert_eq!(ops.iter().filter(|op| **op == opcode::START_STOP_UNIT).count(), 1);
    assert_eq!(ops, [opcode::TEST_UNIT_READY, opcode::START_STOP_UNIT, opcode::TEST_UNIT_READY]);
}

#[test]
fn test_start_unit_then_ready() {
    let fx = no_probe();
    let mut turs = 0;
    fx.mock.set_responder(move |request| {
        if is_tur(request) {
            turs += 1;
            if turs == 1 {
                return not_ready(ascq::NOTIFY_REQUIRED);
            }
        }
        MockReply::Default
    });

    assert_eq!(fx.adapter.wait_for_device_ready(h(0x09), 0, false), DeviceReadiness::Ready);
    let starts = fx
        .mock
        .submitted()
        .into_iter()
        .filter(|r| matches!(r, Request::ScsiIo(io) if io.cdb.is_start_unit()))
        .count();
    assert_eq!(starts, 1);
}

#[test]
fn test_low_power_unit_stopped_before_start() {
    let fx = no_probe();
    let mut turs = 0;
    fx.mock.set_responder(move |request| {
        if is_tur(request) {
            turs += 1;
            if turs == 1 {
                return MockReply::Reply(Reply::ScsiIo(ScsiIoReply::check_condition(SenseData::new(
                    sense_key::NOT_READY,
                    asc::LOW_POWER_CONDITION_ON,
                    0,
                ))));
            }
        }
        MockReply::Default
    });

    assert_eq!(fx.adapter.wait_for_device_ready(h(0x09), 0, false), DeviceReadiness::Ready);
    let cdbs: Vec<Cdb> = fx
        .mock
        .submitted()
        .into_iter()
        .filter_map(|r| match r {
            Request::ScsiIo(io) => Some(io.cdb),
            _ => None,
        })
        .collect();
    assert_eq!(cdbs.len(), 4);
    assert!(cdbs[1].is_stop_unit());
    assert!(cdbs[2].is_start_unit());
}

#[test]
fn test_busy_probe_retried_after_delay() {
    let fx = no_probe();
    let mut busy = 2;
    fx.mock.set_responder(move |request| {
        if is_tur(request) && busy > 0 {
            busy -= 1;
            return MockReply::Reply(Reply::ScsiIo(ScsiIoReply::status(ScsiStatus::Busy)));
        }
        MockReply::Default
    });
    let start = fx.clock.now_ms();

    assert_eq!(fx.adapter.wait_for_device_ready(h(0x09), 0, false), DeviceReadiness::Ready);
    assert_eq!(fx.mock.scsi_opcodes(h(0x09)).len(), 3);
    assert_eq!(fx.clock.now_ms() - start, 2 * fx.adapter.config().busy_retry_delay_ms);
}

#[test]
fn test_report_luns_unsupported_falls_back_to_lun0() {
    let fx = no_probe();
    fx.mock.set_responder(|request| match request {
        Request::ScsiIo(io) if io.cdb.opcode() == opcode::REPORT_LUNS => MockReply::Reply(Reply::ScsiIo(
            ScsiIoReply::check_condition(SenseData::new(sense_key::ILLEGAL_REQUEST, 0x20, 0)),
        )),
        _ => MockReply::Default,
    });

    assert_eq!(fx.adapter.report_luns(h(0x09), false), Ok(vec![0]));
    assert_eq!(fx.mock.scsi_opcodes(h(0x09)), [opcode::REPORT_LUNS]);
}

#[test]
fn test_probe_timeout_resets_device() {
    let fx = Fixture::running(EngineConfig {
        probe_io_timeout_secs: 1,
        tm_timeout_secs: 1,
        command_retry_count: 2,
        ..EngineConfig::no_probe()
    });
    fx.mock.set_responder(|request| if is_tur(request) { MockReply::Hold } else { MockReply::Default });

    assert_eq!(fx.adapter.wait_for_device_ready(h(0x09), 0, false), DeviceReadiness::Retry);
    // One reset between the two timed-out attempts
    assert_eq!(fx.mock.tm_types(), [(h(0x09), TaskType::TargetReset, false)]);
    assert_eq!(fx.mock.scsi_opcodes(h(0x09)).len(), 2);
}

#[test]
fn test_timed_out_unit_ready_keeps_its_frame() {
    let fx = Fixture::running(EngineConfig {
        probe_io_timeout_secs: 1,
        tm_timeout_secs: 1,
        command_retry_count: 2,
        ..EngineConfig::no_probe()
    });
    fx.mock.set_lowest_free_smid(true);
    fx.mock.set_responder(|request| if is_tur(request) { MockReply::Hold } else { MockReply::Default });

    assert_eq!(fx.adapter.wait_for_device_ready(h(0x09), 0, false), DeviceReadiness::Retry);

    // The reset cannot reuse the frame of the command it terminates; the
    // second attempt gets it back once the terminated reply returned it
    let smids: Vec<(u16, bool)> = fx
        .mock
        .submitted_with_smids()
        .iter()
        .map(|(smid, request)| (smid.as_u16(), is_tur(request)))
        .collect();
    assert_eq!(smids, [(1, true), (2, false), (1, true)]);
    assert_eq!(fx.mock.held(), [Smid::new(1)]);
    assert_eq!(fx.mock.slots_in_use(), 1);

    // A late reply returns the frame exactly once
    fx.mock.complete_held(Smid::new(1), ScsiIoReply::good(Vec::new()));
    fx.adapter.process_reply_queue();
    assert_eq!(fx.mock.slots_in_use(), 0);
    assert!(fx.host.io_done().is_empty());
}

// =============================================================================
// REMOVAL HANDSHAKE
// =============================================================================

#[test]
fn test_removal_is_idempotent() {
    let fx = no_probe();
    let target = exposed(&fx, 0x09, ADDR_A);
    let smid = fx.adapter.queue_scsi_io(&target, 0, read_cdb(), 4096).expect("admitted");

    assert_eq!(
        fx.adapter.initiate_device_removal(h(0x09), RemovalPurpose::Device),
        RemovalStart::Started
    );
    assert!(target.is_deleted());
    assert!(target.is_blocked());
    assert_eq!(
        fx.adapter.queue_scsi_io(&target, 0, read_cdb(), 4096),
        Err(HbaError::DeviceGone)
    );
    assert_eq!(
        fx.adapter.initiate_device_removal(h(0x09), RemovalPurpose::Device),
        RemovalStart::AlreadyInProgress
    );

    fx.adapter.process_reply_queue();

    assert_eq!(fx.host.io_done(), [(smid, IocStatus::ScsiTaskTerminated)]);
    assert!(fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).is_none());
    assert_eq!(fx.host.removed(), [target.id()]);
    assert_eq!(fx.mock.directives(h(0x09)), 1);
    assert_eq!(fx.adapter.handshakes.active_count(), 0);
    assert!(target.device_ref().is_none());
    assert_eq!(removal_resets(&fx, 0x09), 1);
    assert_eq!(fx.adapter.stats().devices_removed, 1);
    assert_eq!(fx.mock.slots_in_use(), 0);
}

#[test]
fn test_handshake_retries_rejected_directive() {
    let fx = no_probe();
    exposed(&fx, 0x09, ADDR_A);
    let mut directives = 0;
    fx.mock.set_responder(move |request| match request {
        Request::IoUnitControl(_) => {
            directives += 1;
            if directives == 1 {
                MockReply::Reply(Reply::IoUnitControl(IoUnitControlReply {
                    ioc_status: IocStatus::InternalError,
                }))
            } else {
                MockReply::Default
            }
        }
        _ => MockReply::Default,
    });

    fx.adapter.initiate_device_removal(h(0x09), RemovalPurpose::Device);
    fx.adapter.process_reply_queue();

    assert_eq!(fx.mock.directives(h(0x09)), 2);
    assert_eq!(removal_resets(&fx, 0x09), 2);
    assert!(fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).is_none());
    let stats = fx.adapter.stats();
    assert_eq!(stats.handshakes_completed, 1);
    assert_eq!(stats.handshakes_exhausted, 0);
}

#[test]
fn test_handshake_gives_up_after_retries() {
    let fx = no_probe();
    let target = exposed(&fx, 0x09, ADDR_A);
    fx.mock.set_responder(|request| match request {
        Request::IoUnitControl(_) => MockReply::Reply(Reply::IoUnitControl(IoUnitControlReply {
            ioc_status: IocStatus::InvalidField,
        })),
        _ => MockReply::Default,
    });

    fx.adapter.initiate_device_removal(h(0x09), RemovalPurpose::Device);
    fx.adapter.process_reply_queue();

    let rounds = 1 + usize::from(fx.adapter.config().handshake_retries);
    assert_eq!(fx.mock.directives(h(0x09)), rounds);
    assert_eq!(removal_resets(&fx, 0x09), rounds);
    assert!(!fx.adapter.handshakes.is_active(h(0x09)));
    assert!(fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).is_none());
    assert_eq!(fx.host.removed(), [target.id()]);
    assert_eq!(fx.adapter.stats().handshakes_exhausted, 1);
}

#[test]
fn test_failed_removal_reset_still_sends_directive() {
    let fx = no_probe();
    exposed(&fx, 0x09, ADDR_A);
    fx.mock.set_responder(|request| match request {
        Request::TaskManagement(tm) if tm.for_removal => MockReply::Reply(Reply::TaskManagement(TmReply {
            ioc_status: IocStatus::TaskMgmtFailed,
            response_code: TmResponseCode::Rejected,
            termination_count: 0,
        })),
        _ => MockReply::Default,
    });

    fx.adapter.initiate_device_removal(h(0x09), RemovalPurpose::Device);
    fx.adapter.process_reply_queue();

    assert_eq!(fx.mock.directives(h(0x09)), 1);
    assert!(fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).is_none());
}

#[test]
fn test_parked_removals_serviced_round_robin() {
    let fx = no_probe();
    fx.mock.set_slot_limit(0);
    let parked = [
        (0x21, RemovalPurpose::Device),
        (0x22, RemovalPurpose::Device),
        (0x31, RemovalPurpose::Volume),
        (0x41, RemovalPurpose::Internal),
    ];
    for (handle, purpose) in parked {
        assert_eq!(fx.adapter.initiate_device_removal(h(handle), purpose), RemovalStart::Deferred);
    }
    assert_eq!(fx.adapter.handshakes.deferred_count(RemovalPurpose::Device), 2);
    assert_eq!(fx.adapter.stats().handshakes_deferred, 4);

    fx.mock.set_slot_limit(64);
    fx.adapter.check_pending_removals();
    let order: Vec<DeviceHandle> = fx.mock.tm_types().into_iter().map(|(handle, _, _)| handle).collect();
    assert_eq!(order, [h(0x21), h(0x31), h(0x41), h(0x22)]);

    fx.adapter.process_reply_queue();
    assert_eq!(fx.adapter.handshakes.active_count(), 0);
    assert_eq!(fx.adapter.stats().handshakes_completed, 4);
}

#[test]
fn test_freed_slot_resumes_parked_removal() {
    let fx = no_probe();
    let target = exposed(&fx, 0x09, ADDR_A);
    exposed(&fx, 0x0A, ADDR_B);
    fx.mock.set_slot_limit(1);
    let smid = fx.adapter.queue_scsi_io(&target, 0, read_cdb(), 4096).expect("admitted");

    assert_eq!(
        fx.adapter.initiate_device_removal(h(0x0A), RemovalPurpose::Device),
        RemovalStart::Deferred
    );
    fx.mock.complete_held(smid, ScsiIoReply::good(vec![0; 4096]));
    fx.adapter.process_reply_queue();

    assert_eq!(fx.host.io_done(), [(smid, IocStatus::Success)]);
    assert!(fx.adapter.registry().find_by_handle::<SasDevice>(h(0x0A)).is_none());
    assert!(fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).is_some());
    assert_eq!(fx.adapter.stats().handshakes_completed, 1);
}

// =============================================================================
// TOPOLOGY
// =============================================================================

fn attach_expander(fx: &Fixture) {
    fx.add_expander(expander_page(0x0B, EXP_ADDR, 0, 8), &[(0, 0x20), (1, 0x21)]);
    fx.add_sas(sas_page(0x20, ADDR_A, 0x0B, 0));
    fx.add_sas(sas_page(0x21, ADDR_B, 0x0B, 1));
}

#[test]
fn test_not_responding_ignores_queued_add() {
    let fx = no_probe();
    attach_expander(&fx);
    fx.adapter.expander_add(h(0x0B)).expect("expander");

    fx.adapter
        .on_firmware_event(sas_list(0x0B, ExpanderStatus::Responding, &[(0x20, PhyReason::TargetAdded)]));
    fx.adapter
        .on_firmware_event(sas_list(0x0B, ExpanderStatus::Responding, &[(0x20, PhyReason::TargetNotResponding)]));

    let pending = fx.adapter.events().pending();
    assert!(pending[0].is_ignored());
    assert!(!pending[1].is_ignored());
    assert!(fx.adapter.handshakes.is_active(h(0x20)));

    fx.adapter.process_fw_events();
    fx.adapter.process_reply_queue();
    assert_eq!(fx.adapter.stats().events_ignored, 1);
    assert!(fx.adapter.registry().find_by_handle::<SasDevice>(h(0x20)).is_none());
    assert!(fx.host.added().is_empty());
}

#[test]
fn test_partial_supersede_keeps_other_adds() {
    let fx = no_probe();
    attach_expander(&fx);
    fx.adapter.expander_add(h(0x0B)).expect("expander");

    fx.adapter.on_firmware_event(sas_list(
        0x0B,
        ExpanderStatus::Responding,
        &[(0x20, PhyReason::TargetAdded), (0x21, PhyReason::TargetAdded)],
    ));
    fx.adapter
        .on_firmware_event(sas_list(0x0B, ExpanderStatus::Responding, &[(0x20, PhyReason::TargetNotResponding)]));
    assert!(!fx.adapter.events().pending()[0].is_ignored());

    fx.adapter.process_fw_events();
    fx.adapter.process_reply_queue();
    assert!(fx.adapter.registry().find_by_handle::<SasDevice>(h(0x20)).is_none());
    assert!(fx.adapter.registry().find_by_handle::<SasDevice>(h(0x21)).is_some());
}

#[test]
fn test_expander_added_with_its_devices() {
    let fx = no_probe();
    attach_expander(&fx);

    fx.adapter.on_firmware_event(sas_list(
        0x0B,
        ExpanderStatus::Added,
        &[(0x20, PhyReason::TargetAdded), (0x21, PhyReason::TargetAdded)],
    ));
    fx.adapter.process_fw_events();

    let counts = fx.adapter.registry().counts();
    assert_eq!((counts.expanders, counts.sas), (1, 2));
    let expander = fx.adapter.registry().expander_by_handle(h(0x0B)).expect("expander");
    assert_eq!(expander.parent_address, SasAddress::new(HOST_ADDRESS));
    assert_eq!(expander.downstream().len(), 2);
    let dev = fx.adapter.registry().find_by_handle::<SasDevice>(h(0x21)).expect("device");
    assert_eq!(dev.parent_address, SasAddress::new(EXP_ADDR));
}

#[test]
fn test_expander_removal_cascades() {
    let fx = no_probe();
    fx.add_expander(expander_page(0x0B, EXP_ADDR, 0, 8), &[(0, 0x0C)]);
    fx.add_expander(expander_page(0x0C, CHILD_EXP_ADDR, 0x0B, 8), &[(0, 0x30)]);
    fx.add_sas(sas_page(0x30, ADDR_A, 0x0C, 0));
    fx.add_sas(sas_page(0x20, ADDR_B, 0x0B, 1));

    // Parents are discovered on demand
    assert_eq!(fx.adapter.add_device(h(0x30), 0, false), Ok(AddResult::Done));
    assert_eq!(fx.adapter.add_device(h(0x20), 0, false), Ok(AddResult::Done));
    assert_eq!(fx.adapter.registry().counts().expanders, 2);
    let deep = fx.adapter.target_by_handle(h(0x30)).expect("deep target");

    fx.adapter.on_firmware_event(sas_list(0x0B, ExpanderStatus::NotResponding, &[]));
    assert!(deep.is_blocked());
    assert!(fx.host.calls().contains(&HostCall::Block(deep.id())));

    fx.adapter.process_fw_events();
    let counts = fx.adapter.registry().counts();
    assert_eq!((counts.expanders, counts.sas), (0, 0));
    assert_eq!(fx.host.removed().len(), 2);
    let host_ports = fx.adapter.registry().with_nodes(|nodes| nodes.host.links.ports().len());
    assert_eq!(host_ports, 0);
}

#[test]
fn test_expander_not_responding_with_entries() {
    let fx = no_probe();
    attach_expander(&fx);
    fx.adapter.on_firmware_event(sas_list(
        0x0B,
        ExpanderStatus::Added,
        &[(0x20, PhyReason::TargetAdded), (0x21, PhyReason::TargetAdded)],
    ));
    fx.adapter.process_fw_events();

    fx.adapter.on_firmware_event(sas_list(
        0x0B,
        ExpanderStatus::NotResponding,
        &[(0x20, PhyReason::TargetNotResponding), (0x21, PhyReason::TargetNotResponding)],
    ));
    fx.adapter.process_fw_events();
    fx.adapter.process_reply_queue();

    assert_eq!(fx.adapter.registry().counts().sas, 0);
    assert!(fx.adapter.registry().expander_by_handle(h(0x0B)).is_none());
    // Detached by the teardown, not again by the handshake
    assert_eq!(fx.host.removed().len(), 2);
    assert_eq!(fx.adapter.stats().handshakes_completed, 2);
}

#[test]
fn test_delay_not_responding_blocks_until_link_returns() {
    let fx = no_probe();
    let target = exposed(&fx, 0x09, ADDR_A);

    fx.adapter.block_target(&target);
    assert_eq!(
        fx.adapter.queue_scsi_io(&target, 0, read_cdb(), 4096),
        Err(HbaError::DeviceBlocked)
    );

    fx.adapter
        .on_firmware_event(sas_list(0, ExpanderStatus::Responding, &[(0x09, PhyReason::PhyLinkRateChanged)]));
    fx.adapter.process_fw_events();

    assert!(!target.is_blocked());
    assert!(fx.host.calls().contains(&HostCall::Unblock(target.id())));
    assert!(fx.adapter.queue_scsi_io(&target, 0, read_cdb(), 4096).is_ok());
}

#[test]
fn test_delay_not_responding_blocks_on_receipt() {
    let fx = no_probe();
    let target = exposed(&fx, 0x09, ADDR_A);

    fx.adapter
        .on_firmware_event(sas_list(0, ExpanderStatus::Responding, &[(0x09, PhyReason::DelayNotResponding)]));

    assert!(target.is_blocked());
    assert!(!target.is_deleted());
    assert!(fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).is_some());
}

#[test]
fn test_not_responding_handshake_sent_once() {
    let fx = no_probe();
    let target = exposed(&fx, 0x09, ADDR_A);

    fx.adapter
        .on_firmware_event(sas_list(0, ExpanderStatus::Responding, &[(0x09, PhyReason::TargetNotResponding)]));
    // Interrupt path finishes the handshake before the worker runs
    fx.adapter.process_reply_queue();
    assert_eq!(fx.host.removed(), [target.id()]);

    fx.adapter.process_fw_events();
    fx.adapter.process_reply_queue();
    assert_eq!(removal_resets(&fx, 0x09), 1);
    assert_eq!(fx.mock.directives(h(0x09)), 1);
    assert_eq!(fx.host.removed(), [target.id()]);
    assert_eq!(fx.adapter.stats().devices_removed, 1);
    assert_eq!(fx.mock.slots_in_use(), 0);
}

#[test]
fn test_not_responding_leaves_reused_handle_alone() {
    let fx = no_probe();
    exposed(&fx, 0x09, ADDR_A);

    fx.adapter
        .on_firmware_event(sas_list(0, ExpanderStatus::Responding, &[(0x09, PhyReason::TargetNotResponding)]));
    fx.adapter.process_reply_queue();

    // Firmware hands the freed handle to another device before the worker
    // gets to the change list
    let newcomer = exposed(&fx, 0x09, ADDR_B);
    fx.adapter.process_fw_events();
    fx.adapter.process_reply_queue();

    assert_eq!(removal_resets(&fx, 0x09), 1);
    assert_eq!(fx.mock.directives(h(0x09)), 1);
    assert!(!newcomer.is_deleted());
    assert!(!newcomer.is_blocked());
    let dev = fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).expect("newcomer");
    assert_eq!(dev.sas_address, SasAddress::new(ADDR_B));
    assert!(fx.adapter.queue_scsi_io(&newcomer, 0, read_cdb(), 4096).is_ok());
}

#[test]
fn test_delayed_departure_removed_by_worker() {
    let fx = no_probe();
    let target = exposed(&fx, 0x09, ADDR_A);

    fx.adapter
        .on_firmware_event(sas_list(0, ExpanderStatus::Responding, &[(0x09, PhyReason::DelayNotResponding)]));
    assert_eq!(removal_resets(&fx, 0x09), 0);

    fx.adapter.process_fw_events();
    fx.adapter.process_reply_queue();

    assert!(target.is_deleted());
    assert!(fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).is_none());
    assert_eq!(fx.host.removed(), [target.id()]);
    assert_eq!(removal_resets(&fx, 0x09), 1);
    assert_eq!(fx.mock.directives(h(0x09)), 1);
}

#[test]
fn test_delayed_departure_skips_replacement_device() {
    let fx = no_probe();
    let departed = exposed(&fx, 0x09, ADDR_A);

    fx.adapter
        .on_firmware_event(sas_list(0, ExpanderStatus::Responding, &[(0x09, PhyReason::DelayNotResponding)]));
    // Removed by another path, then the handle is reused
    fx.adapter.initiate_device_removal(h(0x09), RemovalPurpose::Device);
    fx.adapter.process_reply_queue();
    let newcomer = exposed(&fx, 0x09, ADDR_B);

    fx.adapter.process_fw_events();
    fx.adapter.process_reply_queue();

    assert_eq!(removal_resets(&fx, 0x09), 1);
    assert_eq!(fx.host.removed(), [departed.id()]);
    assert!(!newcomer.is_deleted());
    assert!(fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).is_some());
}

// =============================================================================
// PCIE
// =============================================================================

#[test]
fn test_pcie_device_added_and_removed() {
    let fx = no_probe();
    fx.add_pcie(pcie_page(0x31, 0x0025_3800_0000_0001, 0x30));

    fx.adapter
        .on_firmware_event(pcie_list(0x30, SwitchStatus::Responding, &[(0x31, PciePortReason::DevAdded)]));
    fx.adapter.process_fw_events();

    let dev = fx.adapter.registry().find_by_handle::<PcieDevice>(h(0x31)).expect("registered");
    assert!(dev.state().flags().contains(DeviceFlags::NVME));
    let target = dev.state().target().expect("exposed");
    assert_eq!(target.class(), DeviceClass::Pcie);

    fx.adapter
        .on_firmware_event(pcie_list(0x30, SwitchStatus::Responding, &[(0x31, PciePortReason::PortNotResponding)]));
    assert!(target.is_deleted());
    fx.adapter.process_fw_events();
    fx.adapter.process_reply_queue();

    assert!(fx.adapter.registry().find_by_key::<PcieDevice>(Wwid::new(0x0025_3800_0000_0001)).is_none());
    assert_eq!(fx.host.removed(), [target.id()]);
    assert_eq!(fx.mock.directives(h(0x31)), 1);
}

#[test]
fn test_pcie_switch_removal_detaches_children() {
    let fx = no_probe();
    fx.add_pcie(pcie_page(0x31, 0x0025_3800_0000_0001, 0x30));
    fx.add_pcie(pcie_page(0x32, 0x0025_3800_0000_0002, 0x30));
    fx.adapter.on_firmware_event(pcie_list(
        0x30,
        SwitchStatus::Added,
        &[(0x31, PciePortReason::DevAdded), (0x32, PciePortReason::DevAdded)],
    ));
    fx.adapter.process_fw_events();
    assert_eq!(fx.adapter.registry().counts().pcie, 2);
    let target = fx.adapter.target_by_handle(h(0x32)).expect("exposed");

    fx.adapter.on_firmware_event(pcie_list(0x30, SwitchStatus::NotResponding, &[]));
    assert!(target.is_blocked());
    fx.adapter.process_fw_events();

    assert_eq!(fx.adapter.registry().counts().pcie, 0);
    assert_eq!(fx.host.removed().len(), 2);
}

// =============================================================================
// RAID
// =============================================================================

#[test]
fn test_volume_lifecycle() {
    let fx = no_probe();
    fx.add_volume(0x40, 0x600A_0B80_0000_0001, VolumeState::Optimal);

    fx.adapter.on_firmware_event(ir_change(IrElementReason::VolumeAdded, 0x40, 0));
    fx.adapter.process_fw_events();
    let volume = fx.adapter.registry().find_by_handle::<RaidDevice>(h(0x40)).expect("volume");
    let target = volume.state().target().expect("exposed");
    assert_eq!(target.class(), DeviceClass::RaidVolume);
    assert!(target.flags().contains(TargetFlags::RAID_VOLUME));

    fx.adapter.on_firmware_event(FwEventData::IrVolume(IrVolumeEvent {
        volume_handle: h(0x40),
        new_state: VolumeState::Degraded,
    }));
    fx.adapter.process_fw_events();
    assert_eq!(volume.volume_state(), VolumeState::Degraded);

    fx.adapter.on_firmware_event(FwEventData::IrVolume(IrVolumeEvent {
        volume_handle: h(0x40),
        new_state: VolumeState::Failed,
    }));
    fx.adapter.process_fw_events();
    fx.adapter.process_reply_queue();
    assert!(fx.adapter.registry().find_by_handle::<RaidDevice>(h(0x40)).is_none());
    assert_eq!(fx.host.removed(), [target.id()]);
}

#[test]
fn test_unusable_and_foreign_volumes_skipped() {
    let fx = no_probe();
    fx.add_volume(0x40, 0x600A_0B80_0000_0001, VolumeState::Failed);
    assert_eq!(fx.adapter.add_raid_volume(h(0x40)), Err(HbaError::DeviceNotPresent(h(0x40))));

    fx.add_volume(0x41, 0x600A_0B80_0000_0002, VolumeState::Optimal);
    fx.adapter.on_firmware_event(FwEventData::IrConfigChange(IrConfigChangeList {
        foreign: true,
        elements: vec![IrConfigElement {
            reason: IrElementReason::VolumeAdded,
            volume_handle: h(0x41),
            phys_disk_handle: DeviceHandle::NONE,
        }],
    }));
    fx.adapter.process_fw_events();
    assert_eq!(fx.adapter.registry().counts().raid, 0);
}

#[test]
fn test_member_disk_hidden_and_unhidden() {
    let fx = no_probe();
    let first = exposed(&fx, 0x09, ADDR_A);

    fx.adapter.on_firmware_event(ir_change(IrElementReason::PdHidden, 0x40, 0x09));
    fx.adapter.process_fw_events();
    let disk = fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).expect("still tracked");
    assert!(disk.state().is_hidden());
    assert!(disk.state().target().is_none());
    assert_eq!(disk.volume(), Some(h(0x40)));
    assert_eq!(fx.host.removed(), [first.id()]);

    fx.adapter.on_firmware_event(ir_change(IrElementReason::PdUnhidden, 0x40, 0x09));
    fx.adapter.process_fw_events();
    assert!(!disk.state().is_hidden());
    let second = disk.state().target().expect("exposed again");
    assert_ne!(second.id(), first.id());
    assert_eq!(fx.host.added(), [ADDR_A, ADDR_A]);
}

#[test]
fn test_member_disk_created_hidden() {
    let fx = no_probe();
    fx.add_sas(sas_page(0x09, ADDR_A, 0, 0));
    fx.add_phys_disk(0, 0x09);

    fx.adapter.on_firmware_event(ir_change(IrElementReason::PdCreated, 0x40, 0x09));
    fx.adapter.process_fw_events();

    let disk = fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).expect("tracked");
    assert!(disk.state().flags().contains(DeviceFlags::RAID_COMPONENT));
    assert!(fx.host.added().is_empty());

    fx.adapter.on_firmware_event(ir_change(IrElementReason::PdDeleted, 0x40, 0x09));
    fx.adapter.process_fw_events();
    fx.adapter.process_reply_queue();
    assert!(fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).is_none());
    assert!(fx.host.removed().is_empty());
}

#[test]
fn test_unready_member_disk_rescanned() {
    let fx = Fixture::running(EngineConfig {
        bringup_probe: ProbePolicy::Always,
        ..EngineConfig::no_probe()
    });
    let ready = Arc::new(AtomicBool::new(false));
    let gate = ready.clone();
    fx.mock.set_responder(move |request| {
        if is_tur(request) && !gate.load(Ordering::Relaxed) {
            not_ready(ascq::BECOMING_READY)
        } else {
            MockReply::Default
        }
    });
    fx.add_sas(sas_page(0x09, ADDR_A, 0, 0));
    fx.add_phys_disk(0, 0x09);

    fx.adapter.on_firmware_event(ir_change(IrElementReason::PdCreated, 0x40, 0x09));
    fx.adapter.process_fw_events();

    assert!(fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).is_none());
    assert_eq!(fx.adapter.stats().events_requeued, 1);
    let pending = fx.adapter.events().pending();
    assert_eq!(pending.len(), 1);
    assert!(matches!(
        pending[0].data(),
        FwEventData::DeviceRescan { class: DeviceClass::Sas, handle } if handle == h(0x09)
    ));
    assert_eq!(pending[0].retry_count(0), 1);

    ready.store(true, Ordering::Relaxed);
    let due = fx.adapter.events().next_due_ms().expect("delayed");
    fx.clock.advance(due - fx.clock.now_ms());
    assert_eq!(fx.adapter.process_fw_events(), 1);

    let disk = fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).expect("tracked");
    assert!(disk.state().flags().contains(DeviceFlags::RAID_COMPONENT));
    assert!(disk.state().target().is_none());
    assert!(fx.host.added().is_empty());
}

// =============================================================================
// TASK MANAGEMENT
// =============================================================================

#[test]
fn test_abort_terminates_command() {
    let fx = no_probe();
    let target = exposed(&fx, 0x09, ADDR_A);
    let smid = fx.adapter.queue_scsi_io(&target, 0, read_cdb(), 4096).expect("admitted");
    assert_eq!(fx.mock.held(), [smid]);

    assert_eq!(fx.adapter.eh_abort(smid), Ok(()));

    assert_eq!(fx.host.io_done(), [(smid, IocStatus::ScsiTaskTerminated)]);
    assert_eq!(fx.mock.tm_types(), [(h(0x09), TaskType::AbortTask, false)]);
    assert_eq!(fx.adapter.router.outstanding(), 0);
    assert!(!target.tm_busy());
    assert!(fx.adapter.tm.in_flight().is_none());
}

#[test]
fn test_abort_of_finished_command_succeeds() {
    let fx = no_probe();
    assert_eq!(fx.adapter.eh_abort(Smid::new(77)), Ok(()));
    assert!(fx.mock.tm_types().is_empty());
}

#[test]
fn test_abort_verified_against_tracker() {
    let fx = no_probe();
    let target = exposed(&fx, 0x09, ADDR_A);
    let smid = fx.adapter.queue_scsi_io(&target, 0, read_cdb(), 4096).expect("admitted");
    fx.mock.set_tm_terminates(false);

    assert_eq!(
        fx.adapter.eh_abort(smid),
        Err(HbaError::TmFailed(TmFailure::CommandStillOutstanding))
    );
    assert_eq!(fx.adapter.stats().tm_failed, 1);
}

#[test]
fn test_lun_reset_scoped_to_lun() {
    let fx = no_probe();
    let target = exposed(&fx, 0x09, ADDR_A);
    let lun0 = fx.adapter.queue_scsi_io(&target, 0, read_cdb(), 4096).expect("admitted");
    let lun1 = fx.adapter.queue_scsi_io(&target, 1, read_cdb(), 4096).expect("admitted");

    assert_eq!(fx.adapter.eh_device_reset(target.id(), 1), Ok(()));

    assert_eq!(fx.host.io_done(), [(lun1, IocStatus::ScsiTaskTerminated)]);
    assert_eq!(fx.mock.held(), [lun0]);
    assert_eq!(fx.adapter.router.tracked_io(lun0).map(|io| io.lun), Some(0));
}

#[test]
fn test_timed_out_command_climbs_ladder() {
    let fx = no_probe();
    let target = exposed(&fx, 0x09, ADDR_A);
    let smid = fx.adapter.queue_scsi_io(&target, 0, read_cdb(), 4096).expect("admitted");
    fx.mock.set_tm_terminates(false);

    assert_eq!(fx.adapter.recover_timed_out_command(smid), Ok(RecoveryStep::HostReset));

    let tasks: Vec<TaskType> = fx.mock.tm_types().into_iter().map(|(_, task, _)| task).collect();
    assert_eq!(
        tasks,
        [TaskType::AbortTask, TaskType::LogicalUnitReset, TaskType::TargetReset]
    );
    assert_eq!(fx.mock.resets(), 1);
    assert_eq!(fx.host.io_done(), [(smid, IocStatus::ScsiIocTerminated)]);
    assert_eq!(fx.adapter.state(), AdapterState::Normal);
    assert!(!target.is_blocked());
    assert!(fx.adapter.queue_scsi_io(&target, 0, read_cdb(), 4096).is_ok());
}

#[test]
fn test_tm_timeout_escalates_to_reset() {
    let fx = Fixture::running(EngineConfig {
        tm_timeout_secs: 1,
        ..EngineConfig::no_probe()
    });
    let target = exposed(&fx, 0x09, ADDR_A);
    fx.mock.set_responder(|request| match request {
        Request::TaskManagement(_) => MockReply::Hold,
        _ => MockReply::Default,
    });

    assert_eq!(fx.adapter.eh_target_reset(target.id()), Ok(()));

    let stats = fx.adapter.stats();
    assert_eq!(stats.tm_timeouts, 1);
    assert_eq!(stats.resets, 1);
    assert_eq!(stats.tm_failed, 0);
    assert_eq!(fx.mock.resets(), 1);
    assert!(fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).is_some());
}

#[test]
fn test_tm_waits_out_busy_slot() {
    let fx = no_probe();
    exposed(&fx, 0x09, ADDR_A);
    let params = TmRequestParams::new(h(0x09), TaskType::TargetReset, 1);

    // A completion callback asking for a TM while one is outstanding
    // sees the slot taken and gives up after its own timeout
    let held = fx.adapter.tm.try_claim().expect("idle slot");
    let start = fx.clock.now_ms();
    assert_eq!(
        fx.adapter.issue_tm(params),
        Err(HbaError::TmFailed(TmFailure::SlotBusy))
    );
    assert!(fx.clock.now_ms() - start >= 1000);
    assert!(fx.mock.tm_types().is_empty());
    assert_eq!(fx.mock.resets(), 0);

    drop(held);
    assert_eq!(fx.adapter.issue_tm(params), Ok(()));
    assert_eq!(fx.mock.tm_types(), [(h(0x09), TaskType::TargetReset, false)]);
}

#[test]
fn test_faulted_controller_resets_instead_of_tm() {
    let fx = no_probe();
    let target = exposed(&fx, 0x09, ADDR_A);
    fx.mock.set_ioc_state(IocState::Fault(0x2622));

    assert_eq!(fx.adapter.eh_target_reset(target.id()), Ok(()));
    assert!(fx.mock.tm_types().is_empty());
    assert_eq!(fx.mock.resets(), 1);
}

#[test]
fn test_tm_for_unknown_target() {
    let fx = no_probe();
    let target = exposed(&fx, 0x09, ADDR_A);
    fx.adapter.initiate_device_removal(h(0x09), RemovalPurpose::Device);
    fx.adapter.process_reply_queue();

    assert_eq!(fx.adapter.eh_target_reset(target.id()), Err(HbaError::DeviceGone));
    assert_eq!(fx.adapter.eh_device_reset(target.id(), 0), Err(HbaError::DeviceGone));
}

// =============================================================================
// RESET AND RECONCILIATION
// =============================================================================

#[test]
fn test_reset_removes_absent_device_once() {
    let fx = no_probe();
    let kept = exposed(&fx, 0x09, ADDR_A);
    let gone = exposed(&fx, 0x0A, ADDR_B);
    fx.mock.remove_page(PageType::SasDevice0, h(0x0A));

    assert_eq!(fx.adapter.hard_reset(ResetReason::HostRequest), Ok(()));

    assert_eq!(fx.host.removed(), [gone.id()]);
    assert!(gone.is_deleted());
    assert!(gone.device_ref().is_none());
    assert!(kept.device_ref().is_some());
    assert!(!kept.is_blocked());
    assert_eq!(fx.adapter.registry().counts().sas, 1);
    assert_eq!(fx.adapter.state.generation(), 1);
}

#[test]
fn test_reset_follows_reassigned_handle() {
    let fx = no_probe();
    let target = exposed(&fx, 0x09, ADDR_A);
    let before = fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).expect("registered");
    fx.mock.remove_page(PageType::SasDevice0, h(0x09));
    fx.add_sas(sas_page(0x1F, ADDR_A, 0, 0));

    fx.adapter.eh_host_reset().expect("reset");

    let after = fx.adapter.registry().find_by_handle::<SasDevice>(h(0x1F)).expect("same device");
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(target.handle(), h(0x1F));
    assert!(fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).is_none());
    assert!(fx.host.removed().is_empty());
    assert_eq!(fx.host.added().len(), 1);
}

#[test]
fn test_reset_handle_reused_by_other_device() {
    let fx = no_probe();
    let stale = exposed(&fx, 0x09, ADDR_A);
    fx.add_sas(sas_page(0x09, ADDR_B, 0, 0));

    fx.adapter.eh_host_reset().expect("reset");

    assert_eq!(fx.host.removed(), [stale.id()]);
    assert!(stale.device_ref().is_none());
    assert!(fx.adapter.registry().find_by_key::<SasDevice>((SasAddress::new(ADDR_A), PortId::ANY)).is_none());
    let fresh = fx.adapter.registry().find_by_handle::<SasDevice>(h(0x09)).expect("new entry");
    assert_eq!(fresh.sas_address, SasAddress::new(ADDR_B));
    assert_eq!(fx.adapter.registry().counts().sas, 1);
    assert_eq!(fx.host.added(), [ADDR_A, ADDR_B]);
}

#[test]
fn test_reset_discovers_new_devices() {
    let fx = no_probe();
    exposed(&fx, 0x09, ADDR_A);
    fx.add_sas(sas_page(0x0A, ADDR_B, 0, 1));
    fx.add_pcie(pcie_page(0x31, 0x0025_3800_0000_0001, 0x30));

    fx.adapter.eh_host_reset().expect("reset");

    let counts = fx.adapter.registry().counts();
    assert_eq!((counts.sas, counts.pcie), (2, 1));
    assert_eq!(fx.host.added().len(), 3);
}

#[test]
fn test_reset_cancels_queued_work() {
    let fx = no_probe();
    let target = exposed(&fx, 0x09, ADDR_A);
    let smid = fx.adapter.queue_scsi_io(&target, 0, read_cdb(), 4096).expect("admitted");
    fx.add_sas(sas_page(0x0A, ADDR_B, 0, 1));
    fx.adapter
        .on_firmware_event(sas_list(0, ExpanderStatus::Responding, &[(0x0A, PhyReason::TargetAdded)]));
    let queued = fx.adapter.events().pending().remove(0);

    fx.adapter.eh_host_reset().expect("reset");

    assert!(queued.is_ignored());
    assert!(fx.adapter.events().is_empty());
    assert!(!fx.adapter.events().is_suspended());
    assert_eq!(fx.host.io_done(), [(smid, IocStatus::ScsiIocTerminated)]);
    assert_eq!(fx.adapter.router.outstanding(), 0);
    let calls = fx.host.calls();
    let blocked = calls.iter().position(|c| *c == HostCall::Block(target.id()));
    let unblocked = calls.iter().position(|c| *c == HostCall::Unblock(target.id()));
    assert!(blocked < unblocked);
}

#[test]
fn test_failed_reset_faults_adapter() {
    let fx = no_probe();
    let target = exposed(&fx, 0x09, ADDR_A);
    fx.mock.set_reset_result(Err(HalError::HardwareError));

    assert_eq!(
        fx.adapter.eh_host_reset(),
        Err(HbaError::AdapterFatal(HalError::HardwareError))
    );
    assert_eq!(fx.adapter.state(), AdapterState::Fault);
    assert_eq!(fx.adapter.stats().reset_failures, 1);
    assert_eq!(
        fx.adapter.queue_scsi_io(&target, 0, read_cdb(), 4096),
        Err(HbaError::HostBusy)
    );
}

#[test]
fn test_events_processed_by_one_worker() {
    let fx = Arc::new(no_probe());
    for raw in 0..16u16 {
        fx.adapter.on_firmware_event(FwEventData::SasDiscovery(DiscoveryEvent {
            started: raw % 2 == 0,
            status: 0,
        }));
    }
    let processed = Arc::new(AtomicUsize::new(0));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let fx = fx.clone();
            let processed = processed.clone();
            std::thread::spawn(move || {
                processed.fetch_add(fx.adapter.process_fw_events(), Ordering::Relaxed);
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker");
    }
    while !fx.adapter.events().is_empty() {
        processed.fetch_add(fx.adapter.process_fw_events(), Ordering::Relaxed);
    }

    assert_eq!(processed.load(Ordering::Relaxed), 16);
    assert_eq!(fx.adapter.stats().events_processed, 16);
}

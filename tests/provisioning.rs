//! End-to-end provisioning scenarios against the simulated host.

use regex::Regex;
use std::time::Duration;
use vmshim::driver::simulated::{FaultMode, Operation};
use vmshim::driver::{props, HypervisorDriver, SimulatedHost, TemplateKind};
use vmshim::power;
use vmshim::protocol::{DiskSpec, DiskType, NicSpec, VmSpec};
use vmshim::{ErrorKind, JobPoller, PowerState, RequestedState, VmOps};

fn poller() -> JobPoller {
    JobPoller::new(Duration::from_millis(1), Some(Duration::from_millis(200)))
}

fn scenario_spec() -> VmSpec {
    serde_json::from_str(
        r#"{
            "name": "vm1",
            "cpus": 1,
            "maxRam": 536870912,
            "disks": [{"type": "ROOT", "path": "root.vhdx", "deviceId": 0}],
            "nics": [{"mac": "02:00:67:06:00:04"}]
        }"#,
    )
    .unwrap()
}

fn disk(disk_type: DiskType, path: Option<&str>, device_id: u32) -> DiskSpec {
    DiskSpec {
        id: u64::from(device_id),
        disk_type,
        path: path.map(String::from),
        device_id,
        size: None,
        name: None,
    }
}

fn nic(mac: &str, isolation_uri: Option<&str>) -> NicSpec {
    NicSpec {
        mac: mac.to_string(),
        isolation_uri: isolation_uri.map(String::from),
    }
}

#[test]
fn spawn_fresh_vm() {
    let mut host = SimulatedHost::new().with_async_jobs(2);
    VmOps::new(&mut host, poller())
        .spawn(&scenario_spec())
        .unwrap();

    let vms = host.vms_named("vm1");
    assert_eq!(vms.len(), 1);
    let vm = vms[0];
    assert_eq!(vm.power_state(), PowerState::Running);
    assert_eq!(vm.memory.get_u64(props::VIRTUAL_QUANTITY), Some(512));

    let drives = vm.resources_of(TemplateKind::DiskDrive.resource_subtype());
    assert_eq!(drives.len(), 1);
    let controller = drives[0].settings.get_str(props::PARENT).unwrap();
    assert!(controller.ends_with("ide-0"), "drive on {}", controller);
    assert_eq!(drives[0].settings.get_str(props::ADDRESS), Some("0"));

    let nics = vm.resources_of(TemplateKind::SyntheticNic.resource_subtype());
    assert_eq!(nics.len(), 1);
    assert_eq!(nics[0].settings.get_str(props::ADDRESS), Some("020067060004"));

    let identifier = &nics[0]
        .settings
        .get_list(props::VIRTUAL_SYSTEM_IDENTIFIERS)
        .unwrap()[0];
    let guid = Regex::new(r"^\{[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}\}$")
        .unwrap();
    assert!(guid.is_match(identifier), "identifier {}", identifier);

    let port = &nics[0].settings.get_list(props::CONNECTION).unwrap()[0];
    assert_eq!(host.port(port).unwrap().vlan.get(props::ACCESS_VLAN), None);
}

#[test]
fn spawn_running_conflict_makes_no_mutations() {
    let mut host = SimulatedHost::new();
    host.seed_vm("vm1", power::ENABLED);

    let err = VmOps::new(&mut host, poller())
        .spawn(&scenario_spec())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(err.to_string(), "VM 'vm1' is already running");
    assert!(host.mutations().is_empty());
    assert_eq!(host.vm_count(), 1);
}

#[test]
fn nic_vlan_follows_isolation_uri() {
    let mut spec = scenario_spec();
    spec.nics = vec![
        nic("02:00:67:06:00:04", Some("vlan://261")),
        nic("02:00:67:06:00:05", None),
        nic("02:00:67:06:00:06", Some("lswitch://7")),
    ];

    let mut host = SimulatedHost::new();
    VmOps::new(&mut host, poller()).spawn(&spec).unwrap();

    let vm = host.vms_named("vm1")[0];
    let nics = vm.resources_of(TemplateKind::SyntheticNic.resource_subtype());
    let vlans: Vec<Option<u64>> = nics
        .iter()
        .map(|n| {
            let port = &n.settings.get_list(props::CONNECTION).unwrap()[0];
            host.port(port).unwrap().vlan.get_u64(props::ACCESS_VLAN)
        })
        .collect();
    assert_eq!(vlans, vec![Some(261), None, None]);
}

#[test]
fn get_info_unknown_vm_skips_summary() {
    let mut host = SimulatedHost::new();
    let err = VmOps::new(&mut host, poller())
        .get_info("ghost")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(host
        .calls()
        .iter()
        .all(|c| c.operation != Operation::SummaryInfo));
}

#[test]
fn iso_goes_to_second_controller() {
    let mut spec = scenario_spec();
    spec.disks.push(disk(DiskType::Iso, Some("tools.iso"), 1));
    spec.disks.push(disk(DiskType::Iso, None, 0));

    let mut host = SimulatedHost::new();
    VmOps::new(&mut host, poller()).spawn(&spec).unwrap();

    let vm = host.vms_named("vm1")[0];
    let dvds = vm.resources_of(TemplateKind::DvdDrive.resource_subtype());
    assert_eq!(dvds.len(), 2);
    for dvd in &dvds {
        assert!(dvd.settings.get_str(props::PARENT).unwrap().ends_with("ide-1"));
    }
    let media = vm.resources_of(TemplateKind::VirtualDvdDisk.resource_subtype());
    assert_eq!(media.len(), 1);
    assert_eq!(
        media[0].settings.get_list(props::CONNECTION).unwrap(),
        &["tools.iso".to_string()]
    );
}

/// Failing the k-th attach call at any point leaves no VM behind.
#[test]
fn failed_attach_rolls_back_for_every_k() {
    let mut spec = scenario_spec();
    spec.disks.push(disk(DiskType::Iso, Some("tools.iso"), 0));
    spec.nics.push(nic("02:00:67:06:00:05", Some("vlan://42")));

    // Each disk with media is two add-resource calls, each nic one.
    let attach_calls = 2 + 2 + 2;
    let modes = [
        FaultMode::ReturnCode(32768),
        FaultMode::JobFailure("resource busy".to_string()),
        FaultMode::JobHang,
    ];

    for k in 1..=attach_calls {
        for mode in &modes {
            let mut host = SimulatedHost::new().with_async_jobs(1);
            host.inject_fault(Operation::AddResource, k, mode.clone());

            let err = VmOps::new(&mut host, poller()).spawn(&spec).unwrap_err();
            assert!(
                matches!(err.kind(), ErrorKind::DriverFailure | ErrorKind::Timeout),
                "k={} mode={:?}: {}",
                k,
                mode,
                err
            );
            assert!(
                host.find_vms_by_name("vm1").unwrap().is_empty(),
                "vm left behind after failing attach {} with {:?}",
                k,
                mode
            );
        }
    }
}

#[test]
fn failed_power_on_rolls_back() {
    let mut host = SimulatedHost::new();
    host.inject_fault(
        Operation::RequestStateChange,
        1,
        FaultMode::JobFailure("insufficient memory".to_string()),
    );
    let err = VmOps::new(&mut host, poller())
        .spawn(&scenario_spec())
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "set vm vm1 to Enabled failed: insufficient memory"
    );
    assert!(host.vms_named("vm1").is_empty());
}

#[test]
fn respawn_after_stop() {
    let mut host = SimulatedHost::new();
    let mut ops = VmOps::new(&mut host, poller());
    ops.spawn(&scenario_spec()).unwrap();
    ops.power_off("vm1").unwrap();
    ops.spawn(&scenario_spec()).unwrap();
    assert_eq!(ops.check_vm("vm1").unwrap(), Some(PowerState::Running));
    assert_eq!(ops.list_instances().unwrap(), vec!["vm1".to_string()]);
}

#[test]
fn attach_calls_follow_input_order_then_power_on() {
    let mut spec = scenario_spec();
    spec.disks.push(disk(DiskType::Iso, None, 0));
    spec.nics.push(nic("02:00:67:06:00:05", Some("vlan://9")));

    let mut host = SimulatedHost::new();
    VmOps::new(&mut host, poller()).spawn(&spec).unwrap();

    let mutations = host.mutations();
    let attached: Vec<&str> = mutations
        .iter()
        .filter(|c| c.operation == Operation::AddResource)
        .filter_map(|c| c.detail.as_deref())
        .collect();
    assert_eq!(
        attached,
        vec![
            TemplateKind::DiskDrive.resource_subtype(),
            TemplateKind::VirtualHardDisk.resource_subtype(),
            TemplateKind::DvdDrive.resource_subtype(),
            TemplateKind::SyntheticNic.resource_subtype(),
            TemplateKind::SyntheticNic.resource_subtype(),
        ]
    );

    let state_changes: Vec<_> = mutations
        .iter()
        .filter(|c| c.operation == Operation::RequestStateChange)
        .collect();
    assert_eq!(state_changes.len(), 1);
    assert_eq!(state_changes[0].detail.as_deref(), Some("2"));
    assert_eq!(mutations.last().unwrap().operation, Operation::RequestStateChange);
}

#[test]
fn destroy_missing_vm_only_looks_up() {
    let mut host = SimulatedHost::new();
    VmOps::new(&mut host, poller()).destroy("ghost").unwrap();
    let calls = host.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].operation, Operation::FindVms);
}

#[test]
fn requesting_current_state_is_success() {
    let cases = [
        (power::ENABLED, RequestedState::Enabled),
        (power::DISABLED, RequestedState::Disabled),
        (power::PAUSED, RequestedState::Paused),
        (power::SUSPENDED, RequestedState::Suspended),
    ];
    for (native, requested) in cases {
        let mut host = SimulatedHost::new().with_async_jobs(1);
        host.seed_vm("vm1", native);
        VmOps::new(&mut host, poller())
            .set_power_state("vm1", requested)
            .unwrap();
        assert_eq!(host.vms_named("vm1")[0].enabled_state, native);
    }
}

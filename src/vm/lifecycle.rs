//! VM lifecycle: spawn, destroy, power control and queries.
//!
//! `spawn` is the provisioning state machine:
//!
//! ```text
//! check conflicts -> destroy halted remnants -> define shell -> memory/cpu
//!     -> drives -> nics -> power on
//! ```
//!
//! Any failure after the shell is defined destroys every VM with the
//! requested name before the error is returned, so a failed spawn never
//! leaves a partial VM behind.

use super::builder::{DriveKind, ResourceBuilder, ISO_CONTROLLER, ROOT_CONTROLLER};
use super::VmInfo;
use crate::driver::{HypervisorDriver, SummaryField, VmRecord, VmRef, INVALID_STATE};
use crate::error::{Error, Result};
use crate::job::JobPoller;
use crate::power::{PowerState, RequestedState};
use vmshim_protocol::{DiskType, VmSpec};

/// Lifecycle operations over one driver session.
pub struct VmOps<'d> {
    driver: &'d mut dyn HypervisorDriver,
    poller: JobPoller,
}

impl<'d> VmOps<'d> {
    pub fn new(driver: &'d mut dyn HypervisorDriver, poller: JobPoller) -> Self {
        Self { driver, poller }
    }

    fn builder(&mut self) -> ResourceBuilder<'_> {
        ResourceBuilder::new(&mut *self.driver, &self.poller)
    }

    /// Names of every VM on the host.
    pub fn list_instances(&mut self) -> Result<Vec<String>> {
        let vms = self.driver.list_vms()?;
        Ok(vms.into_iter().map(|r| r.name).collect())
    }

    // ========================================================================
    // Spawn / destroy
    // ========================================================================

    /// Create, configure and power on a VM.
    ///
    /// Fails with a conflict if a VM with this name exists in any state
    /// other than halted. Halted VMs with the name are destroyed first.
    pub fn spawn(&mut self, spec: &VmSpec) -> Result<()> {
        let vlans = validate(spec)?;
        tracing::info!(
            vm = %spec.name,
            cpus = spec.cpus,
            memory_mb = spec.memory_mb(),
            disks = spec.disks.len(),
            nics = spec.nics.len(),
            "spawning vm"
        );

        let existing = self.driver.find_vms_by_name(&spec.name)?;
        for record in &existing {
            match record.power_state() {
                PowerState::Halted => {}
                PowerState::Running => return Err(Error::VmRunning(spec.name.clone())),
                state => {
                    return Err(Error::VmExists {
                        name: spec.name.clone(),
                        state,
                    })
                }
            }
        }
        for record in &existing {
            tracing::info!(vm = %spec.name, vm_ref = %record.vm, "destroying halted vm with same name");
            self.destroy_record(record)?;
        }

        match self.provision(spec, &vlans) {
            Ok(()) => {
                tracing::info!(vm = %spec.name, "vm started");
                Ok(())
            }
            Err(e) => {
                tracing::error!(vm = %spec.name, error = %e, "spawn failed, rolling back");
                if let Err(cleanup) = self.destroy(&spec.name) {
                    tracing::error!(vm = %spec.name, error = %cleanup, "rollback failed");
                }
                Err(e)
            }
        }
    }

    fn provision(&mut self, spec: &VmSpec, vlans: &[Option<u16>]) -> Result<()> {
        let mut builder = self.builder();
        let vm = builder.define_vm_shell(spec)?;
        builder.set_memory_and_cpu(&vm, &spec.name, spec.memory_mb(), spec.cpus)?;

        for disk in &spec.disks {
            let (controller, kind) = match disk.disk_type {
                DiskType::Root => (ROOT_CONTROLLER, DriveKind::Disk),
                DiskType::Iso => (ISO_CONTROLLER, DriveKind::Dvd),
                ref other => {
                    return Err(Error::unsupported(
                        "disk type",
                        format!("{} (disk {})", other, disk.display_name()),
                    ))
                }
            };
            builder.attach_drive(
                &vm,
                &spec.name,
                disk.path.as_deref(),
                controller,
                disk.device_id,
                kind,
            )?;
        }

        for (nic, vlan) in spec.nics.iter().zip(vlans) {
            builder.attach_nic(&vm, &spec.name, &nic.mac, *vlan)?;
        }

        self.request_state(&vm, &spec.name, RequestedState::Enabled)
    }

    /// Power off and destroy every VM with this name. Absent is success.
    pub fn destroy(&mut self, name: &str) -> Result<()> {
        let records = self.driver.find_vms_by_name(name)?;
        if records.is_empty() {
            tracing::debug!(vm = %name, "no vm to destroy");
            return Ok(());
        }
        for record in &records {
            self.destroy_record(record)?;
        }
        tracing::info!(vm = %name, count = records.len(), "destroyed vm");
        Ok(())
    }

    fn destroy_record(&mut self, record: &VmRecord) -> Result<()> {
        if record.power_state() != PowerState::Halted {
            self.request_state(&record.vm, &record.name, RequestedState::Disabled)?;
        }
        let submission = self.driver.destroy_vm(&record.vm)?;
        self.poller
            .resolve(&mut *self.driver, submission)
            .map_err(|e| e.during(format!("destroy vm {}", record.name)))?;
        Ok(())
    }

    // ========================================================================
    // Power control
    // ========================================================================

    /// Request a state change on the named VM.
    pub fn set_power_state(&mut self, name: &str, requested: RequestedState) -> Result<()> {
        let record = self.lookup(name)?;
        self.request_state(&record.vm, name, requested)
    }

    fn request_state(&mut self, vm: &VmRef, name: &str, requested: RequestedState) -> Result<()> {
        let submission = self.driver.request_state_change(vm, requested.code())?;
        if submission.return_value == INVALID_STATE {
            tracing::debug!(vm = %name, requested = %requested, "vm already in requested state");
            return Ok(());
        }
        self.poller
            .resolve(&mut *self.driver, submission)
            .map_err(|e| e.during(format!("set vm {} to {}", name, requested)))?;
        tracing::info!(vm = %name, requested = %requested, "changed vm state");
        Ok(())
    }

    pub fn reboot(&mut self, name: &str) -> Result<()> {
        self.set_power_state(name, RequestedState::Reboot)
    }

    pub fn pause(&mut self, name: &str) -> Result<()> {
        self.set_power_state(name, RequestedState::Paused)
    }

    pub fn unpause(&mut self, name: &str) -> Result<()> {
        self.set_power_state(name, RequestedState::Enabled)
    }

    pub fn suspend(&mut self, name: &str) -> Result<()> {
        self.set_power_state(name, RequestedState::Suspended)
    }

    pub fn resume(&mut self, name: &str) -> Result<()> {
        self.set_power_state(name, RequestedState::Enabled)
    }

    pub fn power_off(&mut self, name: &str) -> Result<()> {
        self.set_power_state(name, RequestedState::Disabled)
    }

    pub fn power_on(&mut self, name: &str) -> Result<()> {
        self.set_power_state(name, RequestedState::Enabled)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current state, memory, vCPUs, uptime and CPU load of a VM.
    pub fn get_info(&mut self, name: &str) -> Result<VmInfo> {
        let record = self.lookup(name)?;
        let summary = self.driver.summary_info(&record.vm, &SummaryField::ALL)?;
        let state = summary
            .enabled_state
            .map_or(record.power_state(), PowerState::from_native);
        let memory_mb = summary.memory_usage.unwrap_or(0);

        Ok(VmInfo {
            state,
            memory_mb,
            max_memory_mb: memory_mb,
            num_cpus: summary.number_of_processors.unwrap_or(0),
            uptime_ms: summary.up_time.unwrap_or(0),
            cpu_utilization: summary.processor_load.unwrap_or(0),
        })
    }

    /// Power state of the first VM with this name, if any.
    pub fn check_vm(&mut self, name: &str) -> Result<Option<PowerState>> {
        let records = self.driver.find_vms_by_name(name)?;
        Ok(records.first().map(VmRecord::power_state))
    }

    /// The single VM with this name.
    fn lookup(&mut self, name: &str) -> Result<VmRecord> {
        let mut records = self.driver.find_vms_by_name(name)?;
        match records.len() {
            0 => Err(Error::VmNotFound(name.to_string())),
            1 => Ok(records.remove(0)),
            _ => Err(Error::DuplicateName(name.to_string())),
        }
    }
}

/// Check the VM description's shape before touching the host. Returns the parsed VLAN
/// of each NIC.
fn validate(spec: &VmSpec) -> Result<Vec<Option<u16>>> {
    if spec.name.trim().is_empty() {
        return Err(Error::InvalidCommand("vm name is empty".to_string()));
    }
    if spec.cpus == 0 {
        return Err(Error::InvalidCommand(format!(
            "vm {} needs at least one vcpu",
            spec.name
        )));
    }
    if spec.memory_mb() == 0 {
        return Err(Error::InvalidCommand(format!(
            "vm {} needs at least 1 MiB of memory, got {} bytes",
            spec.name, spec.max_ram
        )));
    }
    for disk in &spec.disks {
        if disk.disk_type == DiskType::Root && disk.path.is_none() {
            return Err(Error::InvalidCommand(format!(
                "root disk {} has no path",
                disk.display_name()
            )));
        }
    }

    spec.nics
        .iter()
        .map(|nic| -> Result<Option<u16>> {
            crate::util::native_mac(&nic.mac)?;
            Ok(nic.vlan()?)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::simulated::{FaultMode, Operation};
    use crate::driver::SimulatedHost;
    use crate::error::ErrorKind;
    use crate::power;
    use std::time::Duration;
    use vmshim_protocol::{DiskSpec, NicSpec};

    fn poller() -> JobPoller {
        JobPoller::new(Duration::from_millis(1), Some(Duration::from_millis(100)))
    }

    fn spec(name: &str) -> VmSpec {
        VmSpec {
            name: name.to_string(),
            uuid: None,
            cpus: 1,
            max_ram: 512 * 1024 * 1024,
            disks: vec![DiskSpec {
                id: 1,
                disk_type: DiskType::Root,
                path: Some("C:\\vols\\root.vhd".to_string()),
                device_id: 0,
                size: None,
                name: None,
            }],
            nics: vec![NicSpec {
                mac: "02:00:00:00:00:01".to_string(),
                isolation_uri: Some("vlan://100".to_string()),
            }],
        }
    }

    #[test]
    fn test_spawn_and_destroy() {
        let mut host = SimulatedHost::new();
        VmOps::new(&mut host, poller()).spawn(&spec("vm1")).unwrap();
        assert_eq!(host.vms_named("vm1")[0].power_state(), PowerState::Running);

        VmOps::new(&mut host, poller()).destroy("vm1").unwrap();
        assert!(host.vms_named("vm1").is_empty());
    }

    #[test]
    fn test_spawn_replaces_halted_remnants() {
        let mut host = SimulatedHost::new();
        host.seed_vm("vm1", power::DISABLED);
        host.seed_vm("vm1", power::DISABLED);

        VmOps::new(&mut host, poller()).spawn(&spec("vm1")).unwrap();
        let vms = host.vms_named("vm1");
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].power_state(), PowerState::Running);
    }

    #[test]
    fn test_spawn_conflict_makes_no_mutations() {
        let mut host = SimulatedHost::new();
        host.seed_vm("vm1", power::DISABLED);
        host.seed_vm("vm1", power::PAUSED);

        let err = VmOps::new(&mut host, poller())
            .spawn(&spec("vm1"))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::VmExists {
                state: PowerState::Paused,
                ..
            }
        ));
        assert!(host.mutations().is_empty());
        assert_eq!(host.vms_named("vm1").len(), 2);
    }

    #[test]
    fn test_spawn_invalid_spec_touches_nothing() {
        let mut host = SimulatedHost::new();
        let mut bad = spec("vm1");
        bad.cpus = 0;
        let err = VmOps::new(&mut host, poller()).spawn(&bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let mut bad = spec("vm1");
        bad.nics[0].isolation_uri = Some("vlan://abc".to_string());
        let err = VmOps::new(&mut host, poller()).spawn(&bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);

        assert!(host.calls().is_empty());
    }

    #[test]
    fn test_unknown_disk_type_rolls_back() {
        let mut host = SimulatedHost::new();
        let mut s = spec("vm1");
        s.disks[0].disk_type = DiskType::DataDisk;
        let err = VmOps::new(&mut host, poller()).spawn(&s).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert!(err.to_string().contains("DATADISK"));
        assert!(host.vms_named("vm1").is_empty());
    }

    #[test]
    fn test_power_state_already_applied_is_success() {
        let mut host = SimulatedHost::new();
        host.seed_vm("vm1", power::ENABLED);
        let mut ops = VmOps::new(&mut host, poller());
        ops.power_on("vm1").unwrap();
        ops.pause("vm1").unwrap();
        ops.unpause("vm1").unwrap();
        ops.suspend("vm1").unwrap();
        ops.resume("vm1").unwrap();
        ops.reboot("vm1").unwrap();
        ops.power_off("vm1").unwrap();
        ops.power_off("vm1").unwrap();
        assert_eq!(ops.check_vm("vm1").unwrap(), Some(PowerState::Halted));
    }

    #[test]
    fn test_get_info_duplicate_and_missing() {
        let mut host = SimulatedHost::new();
        host.seed_vm("dup", power::DISABLED);
        host.seed_vm("dup", power::DISABLED);
        let mut ops = VmOps::new(&mut host, poller());

        assert_eq!(ops.get_info("dup").unwrap_err().kind(), ErrorKind::Conflict);
        assert_eq!(ops.get_info("nope").unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(ops.check_vm("nope").unwrap(), None);
    }

    #[test]
    fn test_get_info_running_vm() {
        let mut host = SimulatedHost::new();
        VmOps::new(&mut host, poller()).spawn(&spec("vm1")).unwrap();
        host.set_processor_load("vm1", 37);

        let info = VmOps::new(&mut host, poller()).get_info("vm1").unwrap();
        assert_eq!(info.state, PowerState::Running);
        assert_eq!(info.memory_mb, 512);
        assert_eq!(info.max_memory_mb, 512);
        assert_eq!(info.num_cpus, 1);
        assert_eq!(info.cpu_utilization, 37);
    }

    #[test]
    fn test_list_instances() {
        let mut host = SimulatedHost::new();
        host.seed_vm("a", power::DISABLED);
        host.seed_vm("b", power::ENABLED);
        let mut names = VmOps::new(&mut host, poller()).list_instances().unwrap();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_destroy_failure_is_reported() {
        let mut host = SimulatedHost::new();
        host.seed_vm("vm1", power::DISABLED);
        host.inject_fault(Operation::DestroyVm, 1, FaultMode::ReturnCode(32768));
        let err = VmOps::new(&mut host, poller()).destroy("vm1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "destroy vm vm1 failed: return value was 32768"
        );
    }
}

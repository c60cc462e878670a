//! Resource builder: the individual configuration steps of a new VM.
//!
//! Each step submits one or more driver calls and resolves them through the
//! job poller. Failures are reported with the step that was being attempted;
//! cleaning up a partially built VM is the caller's job.

use crate::driver::{
    fresh_identifier, props, HypervisorDriver, ResourceRef, Settings, SettingsKind, Submission,
    TemplateKind, VmRef, RETURN_OK,
};
use crate::error::{Error, Result};
use crate::job::JobPoller;
use crate::util;
use std::fmt;
use vmshim_protocol::VmSpec;

/// IDE controller that receives ROOT disks.
pub const ROOT_CONTROLLER: u32 = 0;

/// IDE controller that receives ISO media.
pub const ISO_CONTROLLER: u32 = 1;

/// Processor limit submitted with every CPU configuration.
pub const CPU_LIMIT: u64 = 100_000;

/// Kind of drive to attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveKind {
    Disk,
    Dvd,
}

impl DriveKind {
    fn drive_template(self) -> TemplateKind {
        match self {
            DriveKind::Disk => TemplateKind::DiskDrive,
            DriveKind::Dvd => TemplateKind::DvdDrive,
        }
    }

    fn media_template(self) -> TemplateKind {
        match self {
            DriveKind::Disk => TemplateKind::VirtualHardDisk,
            DriveKind::Dvd => TemplateKind::VirtualDvdDisk,
        }
    }
}

impl fmt::Display for DriveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriveKind::Disk => write!(f, "disk"),
            DriveKind::Dvd => write!(f, "dvd"),
        }
    }
}

/// Configures a VM step by step.
pub struct ResourceBuilder<'a> {
    driver: &'a mut dyn HypervisorDriver,
    poller: &'a JobPoller,
}

impl<'a> ResourceBuilder<'a> {
    pub fn new(driver: &'a mut dyn HypervisorDriver, poller: &'a JobPoller) -> Self {
        Self { driver, poller }
    }

    fn resolve(&mut self, submission: Submission, operation: impl Into<String>) -> Result<()> {
        self.poller
            .resolve(&mut *self.driver, submission)
            .map(|_| ())
            .map_err(|e| e.during(operation))
    }

    /// Define an empty VM named after the spec.
    pub fn define_vm_shell(&mut self, spec: &VmSpec) -> Result<VmRef> {
        let (submission, vm) = self.driver.define_vm(&spec.name)?;
        self.resolve(submission, format!("define vm {}", spec.name))?;

        let vm = match vm {
            Some(vm) => vm,
            None => {
                let mut found = self.driver.find_vms_by_name(&spec.name)?;
                match found.len() {
                    0 => return Err(Error::VmNotFound(spec.name.clone())),
                    1 => found.remove(0).vm,
                    _ => return Err(Error::DuplicateName(spec.name.clone())),
                }
            }
        };

        tracing::info!(vm = %spec.name, vm_ref = %vm, "created vm shell");
        Ok(vm)
    }

    /// Set memory (reservation, quantity and limit all equal) and vCPUs.
    pub fn set_memory_and_cpu(
        &mut self,
        vm: &VmRef,
        vm_name: &str,
        memory_mb: u64,
        vcpus: u32,
    ) -> Result<()> {
        let mut memory = self.driver.vm_settings(vm, SettingsKind::Memory)?;
        memory.set(props::VIRTUAL_QUANTITY, memory_mb);
        memory.set(props::RESERVATION, memory_mb);
        memory.set(props::LIMIT, memory_mb);
        let submission = self.driver.modify_resources(vm, &[memory])?;
        self.resolve(submission, format!("set memory for vm {}", vm_name))?;

        let mut processor = self.driver.vm_settings(vm, SettingsKind::Processor)?;
        processor.set(props::VIRTUAL_QUANTITY, vcpus);
        processor.set(props::RESERVATION, vcpus);
        processor.set(props::LIMIT, CPU_LIMIT);
        let submission = self.driver.modify_resources(vm, &[processor])?;
        self.resolve(submission, format!("set vcpus for vm {}", vm_name))?;

        tracing::info!(vm = %vm_name, memory_mb, vcpus, "set memory and cpu");
        Ok(())
    }

    /// Attach a drive to an IDE controller slot and, if `path` is given,
    /// insert media backed by that file. Returns the drive's reference.
    pub fn attach_drive(
        &mut self,
        vm: &VmRef,
        vm_name: &str,
        path: Option<&str>,
        controller_address: u32,
        drive_address: u32,
        kind: DriveKind,
    ) -> Result<ResourceRef> {
        let controller = self
            .driver
            .find_ide_controller(vm, controller_address)?
            .ok_or_else(|| {
                Error::not_found(
                    "controller",
                    format!("IDE {} on vm {}", controller_address, vm_name),
                )
            })?;

        let template = self.driver.default_template(kind.drive_template())?;
        let mut drive = Settings::clone_from_template(&template);
        drive.set(props::PARENT, controller.as_str());
        drive.set(props::ADDRESS, drive_address.to_string());

        let operation = format!("add {} drive to vm {}", kind, vm_name);
        let (submission, created) = self.driver.add_resource(vm, &drive)?;
        self.resolve(submission, operation.clone())?;
        let drive_ref = created
            .into_iter()
            .next()
            .ok_or_else(|| Error::driver(operation, "host returned no drive reference"))?;

        tracing::debug!(
            vm = %vm_name,
            controller = controller_address,
            address = drive_address,
            drive = %drive_ref,
            "attached {} drive",
            kind
        );

        if let Some(path) = path {
            let template = self.driver.default_template(kind.media_template())?;
            let mut media = Settings::clone_from_template(&template);
            media.set(props::PARENT, drive_ref.as_str());
            media.set(props::CONNECTION, vec![path.to_string()]);

            let (submission, _) = self.driver.add_resource(vm, &media)?;
            self.resolve(submission, format!("insert {} into vm {}", path, vm_name))?;
            tracing::info!(vm = %vm_name, path = %path, "attached {} image", kind);
        }

        Ok(drive_ref)
    }

    /// Attach a synthetic NIC on a new port of the external switch,
    /// optionally tagging the port with an access VLAN.
    pub fn attach_nic(
        &mut self,
        vm: &VmRef,
        vm_name: &str,
        mac: &str,
        vlan: Option<u16>,
    ) -> Result<ResourceRef> {
        let address = util::native_mac(mac)?;
        let network = self.driver.find_external_network()?.ok_or_else(|| {
            Error::not_found("external network", "no virtual switch bound to an uplink")
        })?;

        let port_name = uuid::Uuid::new_v4().to_string();
        let operation = format!("create switch port for vm {}", vm_name);
        let (code, port) = self
            .driver
            .create_switch_port(&network, &port_name, vm_name)?;
        if code != RETURN_OK {
            return Err(Error::driver(operation, format!("return value was {}", code)));
        }
        let port =
            port.ok_or_else(|| Error::driver(operation, "host returned no port reference"))?;

        if let Some(vlan) = vlan {
            let mut endpoint = self
                .driver
                .vlan_settings(&port)?
                .ok_or_else(|| Error::not_found("vlan endpoint", port.to_string()))?;
            endpoint.set(props::ACCESS_VLAN, u64::from(vlan));
            let submission = self.driver.modify_vlan_settings(&port, &endpoint)?;
            self.resolve(submission, format!("set vlan {} on port {}", vlan, port))?;
            tracing::debug!(vm = %vm_name, port = %port, vlan, "tagged switch port");
        }

        let template = self.driver.default_template(TemplateKind::SyntheticNic)?;
        let mut nic = Settings::clone_from_template(&template);
        nic.set(props::CONNECTION, vec![port.to_string()]);
        nic.set(props::ELEMENT_NAME, format!("{} nic", vm_name));
        nic.set(props::ADDRESS, address);
        nic.set(props::STATIC_MAC_ADDRESS, true);
        nic.set(props::VIRTUAL_SYSTEM_IDENTIFIERS, vec![fresh_identifier()]);

        let operation = format!("add nic to vm {}", vm_name);
        let (submission, created) = self.driver.add_resource(vm, &nic)?;
        self.resolve(submission, operation.clone())?;
        let nic_ref = created
            .into_iter()
            .next()
            .ok_or_else(|| Error::driver(operation, "host returned no nic reference"))?;

        tracing::info!(vm = %vm_name, mac = %mac, port = %port, "attached nic");
        Ok(nic_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::simulated::{FaultMode, Operation};
    use crate::driver::SimulatedHost;
    use crate::error::ErrorKind;
    use std::time::Duration;

    fn poller() -> JobPoller {
        JobPoller::new(Duration::from_millis(1), Some(Duration::from_secs(1)))
    }

    fn spec(name: &str) -> VmSpec {
        VmSpec {
            name: name.to_string(),
            uuid: None,
            cpus: 2,
            max_ram: 1024 * 1024 * 1024,
            disks: Vec::new(),
            nics: Vec::new(),
        }
    }

    #[test]
    fn test_memory_and_cpu_settings() {
        let mut host = SimulatedHost::new().with_async_jobs(1);
        let poller = poller();
        let mut builder = ResourceBuilder::new(&mut host, &poller);
        let vm = builder.define_vm_shell(&spec("vm1")).unwrap();
        builder.set_memory_and_cpu(&vm, "vm1", 1024, 2).unwrap();

        let sim = host.vms_named("vm1")[0];
        assert_eq!(sim.memory.get_u64(props::VIRTUAL_QUANTITY), Some(1024));
        assert_eq!(sim.memory.get_u64(props::RESERVATION), Some(1024));
        assert_eq!(sim.memory.get_u64(props::LIMIT), Some(1024));
        assert_eq!(sim.processor.get_u64(props::VIRTUAL_QUANTITY), Some(2));
        assert_eq!(sim.processor.get_u64(props::RESERVATION), Some(2));
        assert_eq!(sim.processor.get_u64(props::LIMIT), Some(CPU_LIMIT));
    }

    #[test]
    fn test_attach_drive_with_media() {
        let mut host = SimulatedHost::new();
        let poller = poller();
        let mut builder = ResourceBuilder::new(&mut host, &poller);
        let vm = builder.define_vm_shell(&spec("vm1")).unwrap();
        let drive = builder
            .attach_drive(&vm, "vm1", Some("C:\\vm1.vhd"), ROOT_CONTROLLER, 0, DriveKind::Disk)
            .unwrap();

        let sim = host.vms_named("vm1")[0];
        let drives = sim.resources_of(TemplateKind::DiskDrive.resource_subtype());
        assert_eq!(drives.len(), 1);
        assert_eq!(drives[0].path, drive.as_str());
        assert_eq!(drives[0].settings.get_str(props::ADDRESS), Some("0"));

        let media = sim.resources_of(TemplateKind::VirtualHardDisk.resource_subtype());
        assert_eq!(media.len(), 1);
        assert_eq!(media[0].settings.get_str(props::PARENT), Some(drive.as_str()));
        assert_eq!(
            media[0].settings.get_list(props::CONNECTION).unwrap(),
            &["C:\\vm1.vhd".to_string()]
        );
    }

    #[test]
    fn test_attach_empty_dvd_drive() {
        let mut host = SimulatedHost::new();
        let poller = poller();
        let mut builder = ResourceBuilder::new(&mut host, &poller);
        let vm = builder.define_vm_shell(&spec("vm1")).unwrap();
        builder
            .attach_drive(&vm, "vm1", None, ISO_CONTROLLER, 0, DriveKind::Dvd)
            .unwrap();

        let sim = host.vms_named("vm1")[0];
        assert_eq!(sim.resources_of(TemplateKind::DvdDrive.resource_subtype()).len(), 1);
        assert!(sim
            .resources_of(TemplateKind::VirtualDvdDisk.resource_subtype())
            .is_empty());
    }

    #[test]
    fn test_attach_drive_missing_controller() {
        let mut host = SimulatedHost::new();
        let poller = poller();
        let mut builder = ResourceBuilder::new(&mut host, &poller);
        let vm = builder.define_vm_shell(&spec("vm1")).unwrap();
        let err = builder
            .attach_drive(&vm, "vm1", None, 3, 0, DriveKind::Disk)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("IDE 3"));
    }

    #[test]
    fn test_attach_nic_with_vlan() {
        let mut host = SimulatedHost::new();
        let poller = poller();
        let mut builder = ResourceBuilder::new(&mut host, &poller);
        let vm = builder.define_vm_shell(&spec("vm1")).unwrap();
        builder
            .attach_nic(&vm, "vm1", "02:00:4c:4f:4f:50", Some(261))
            .unwrap();

        let sim = host.vms_named("vm1")[0];
        let nics = sim.resources_of(TemplateKind::SyntheticNic.resource_subtype());
        assert_eq!(nics.len(), 1);
        let nic = &nics[0].settings;
        assert_eq!(nic.get_str(props::ADDRESS), Some("02004c4f4f50"));
        assert_eq!(nic.get_bool(props::STATIC_MAC_ADDRESS), Some(true));
        assert_eq!(nic.get_str(props::ELEMENT_NAME), Some("vm1 nic"));

        let port = &nic.get_list(props::CONNECTION).unwrap()[0];
        let port = host.port(port).unwrap();
        assert_eq!(port.friendly_name, "vm1");
        assert_eq!(port.vlan.get_u64(props::ACCESS_VLAN), Some(261));
    }

    #[test]
    fn test_attach_nic_without_external_network() {
        let mut host = SimulatedHost::new().without_external_network();
        let poller = poller();
        let mut builder = ResourceBuilder::new(&mut host, &poller);
        let vm = builder.define_vm_shell(&spec("vm1")).unwrap();
        let err = builder
            .attach_nic(&vm, "vm1", "02:00:4c:4f:4f:50", None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_switch_port_failure_reports_code() {
        let mut host = SimulatedHost::new();
        host.inject_fault(Operation::CreateSwitchPort, 1, FaultMode::ReturnCode(32785));
        let poller = poller();
        let mut builder = ResourceBuilder::new(&mut host, &poller);
        let vm = builder.define_vm_shell(&spec("vm1")).unwrap();
        let err = builder
            .attach_nic(&vm, "vm1", "02:00:4c:4f:4f:50", None)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "create switch port for vm vm1 failed: return value was 32785"
        );
    }

    #[test]
    fn test_define_failure_names_the_step() {
        let mut host = SimulatedHost::new();
        host.inject_fault(
            Operation::DefineVm,
            1,
            FaultMode::JobFailure("no space".into()),
        );
        let poller = poller();
        let mut builder = ResourceBuilder::new(&mut host, &poller);
        let err = builder.define_vm_shell(&spec("vm1")).unwrap_err();
        assert_eq!(err.to_string(), "define vm vm1 failed: no space");
    }
}

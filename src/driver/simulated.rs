//! In-process simulated hypervisor host.
//!
//! [`SimulatedHost`] implements [`HypervisorDriver`] against an in-memory
//! model of a host: VMs with two IDE controllers each, an external virtual
//! switch, switch ports with VLAN endpoints, asynchronous jobs and a small
//! file table for virtual disks. State can be persisted as JSON so that
//! successive `vmshim exec` invocations see the same host.
//!
//! For tests the host can inject faults into the n-th call of an operation
//! and records every call it receives in a journal.

use super::settings::{props, Settings};
use super::{
    HostUsage, HypervisorDriver, JobHandle, JobState, JobStatus, NetworkRef, ResourceRef, SettingsKind,
    Submission, SummaryField, SummaryRecord, TemplateKind, VmRecord, VmRef, INVALID_PARAMETER,
    INVALID_STATE,
};
use crate::error::{Error, Result};
use crate::power::{self, PowerState, RequestedState};
use crate::util;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name used to select this backend in configuration.
pub const BACKEND_NAME: &str = "simulated";

const IDE_CONTROLLER_SUBTYPE: &str = "Microsoft Emulated IDE Controller";
const EXTERNAL_SWITCH: &str = "vswitch-external";
const RASD_CLASS: &str = "Msvm_ResourceAllocationSettingData";
const NIC_CLASS: &str = "Msvm_SyntheticEthernetPortSettingData";
const MEMORY_CLASS: &str = "Msvm_MemorySettingData";
const PROCESSOR_CLASS: &str = "Msvm_ProcessorSettingData";
const VLAN_CLASS: &str = "Msvm_VLANEndpointSettingData";

/// Return code used for generic failures.
const FAILED: u32 = 32768;
/// Return code for a file that already exists.
const FILE_EXISTS: u32 = 32779;

const DEFAULT_HOST_CPUS: u32 = 8;
const DEFAULT_HOST_MEMORY_MB: u64 = 16 * 1024;

// ============================================================================
// Journal and fault injection
// ============================================================================

/// Driver operations, as recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListVms,
    FindVms,
    DefineVm,
    VmSettings,
    ModifyResources,
    FindIdeController,
    DefaultTemplate,
    AddResource,
    FindExternalNetwork,
    CreateSwitchPort,
    VlanSettings,
    ModifyVlanSettings,
    RequestStateChange,
    DestroyVm,
    PollJob,
    SummaryInfo,
    HostUsage,
    CreateVirtualDisk,
    DeleteFile,
}

impl Operation {
    /// Whether the operation changes host state.
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Operation::DefineVm
                | Operation::ModifyResources
                | Operation::AddResource
                | Operation::CreateSwitchPort
                | Operation::ModifyVlanSettings
                | Operation::RequestStateChange
                | Operation::DestroyVm
                | Operation::CreateVirtualDisk
                | Operation::DeleteFile
        )
    }
}

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverCall {
    pub operation: Operation,
    /// VM, port, job or file path the call targeted.
    pub target: String,
    /// Operation-specific detail: resource subtype, state code, etc.
    pub detail: Option<String>,
}

impl fmt::Display for DriverCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.operation, self.target)?;
        if let Some(detail) = &self.detail {
            write!(f, " [{}]", detail)?;
        }
        Ok(())
    }
}

/// How an injected fault manifests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultMode {
    /// The call returns this code synchronously.
    ReturnCode(u32),
    /// The call starts a job that ends in the exception state.
    JobFailure(String),
    /// The call starts a job that never leaves the running state.
    JobHang,
}

/// Fault applied to the `nth` (1-based) call of `operation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub operation: Operation,
    pub nth: usize,
    pub mode: FaultMode,
}

// ============================================================================
// Host model
// ============================================================================

/// A resource attached to a simulated VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimResource {
    pub path: String,
    pub settings: Settings,
}

/// A simulated VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimVm {
    pub name: String,
    pub enabled_state: u16,
    pub memory: Settings,
    pub processor: Settings,
    pub resources: Vec<SimResource>,
    /// Processor load reported in summaries, percent.
    #[serde(default)]
    pub processor_load: u32,
    #[serde(default)]
    started_at_ms: Option<u64>,
}

impl SimVm {
    pub fn power_state(&self) -> PowerState {
        PowerState::from_native(self.enabled_state)
    }

    /// Resources whose subtype matches.
    pub fn resources_of(&self, subtype: &str) -> Vec<&SimResource> {
        self.resources
            .iter()
            .filter(|r| r.settings.resource_subtype() == Some(subtype))
            .collect()
    }
}

/// A port on the simulated external switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimPort {
    pub switch: String,
    pub name: String,
    pub friendly_name: String,
    pub vlan: Settings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum JobOutcome {
    Complete,
    Fail(String),
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SimJob {
    description: String,
    polls_remaining: u32,
    polls: u32,
    outcome: JobOutcome,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HostState {
    next_id: u64,
    #[serde(default = "default_true")]
    external_network: bool,
    vms: BTreeMap<String, SimVm>,
    ports: BTreeMap<String, SimPort>,
    jobs: BTreeMap<String, SimJob>,
    files: BTreeMap<String, u64>,
    #[serde(default = "default_host_cpus")]
    cpus: u32,
    #[serde(default = "default_host_memory_mb")]
    memory_mb: u64,
}

fn default_true() -> bool {
    true
}

fn default_host_cpus() -> u32 {
    DEFAULT_HOST_CPUS
}

fn default_host_memory_mb() -> u64 {
    DEFAULT_HOST_MEMORY_MB
}

impl HostState {
    fn fresh() -> Self {
        Self {
            external_network: true,
            cpus: DEFAULT_HOST_CPUS,
            memory_mb: DEFAULT_HOST_MEMORY_MB,
            ..Self::default()
        }
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

/// Simulated hypervisor host.
#[derive(Debug)]
pub struct SimulatedHost {
    state: HostState,
    path: Option<PathBuf>,
    job_polls: u32,
    faults: Vec<Fault>,
    counts: HashMap<Operation, usize>,
    journal: Vec<DriverCall>,
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHost {
    /// Empty host held in memory only. Mutating calls complete synchronously.
    pub fn new() -> Self {
        Self {
            state: HostState::fresh(),
            path: None,
            job_polls: 0,
            faults: Vec::new(),
            counts: HashMap::new(),
            journal: Vec::new(),
        }
    }

    /// Load host state from `path`, or start empty if it does not exist.
    /// The state is written back on [`HypervisorDriver::close`].
    pub fn open(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data).map_err(|e| {
                Error::config(
                    format!("load simulated host state from {}", path.display()),
                    e.to_string(),
                )
            })?
        } else {
            HostState::fresh()
        };

        Ok(Self {
            state,
            path: Some(path.to_path_buf()),
            ..Self::new()
        })
    }

    /// Write host state to the backing file, if any.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.state)?)?;
        std::fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), "saved simulated host state");
        Ok(())
    }

    /// Make mutating calls start jobs that complete after `polls` polls.
    pub fn with_async_jobs(mut self, polls: u32) -> Self {
        self.job_polls = polls;
        self
    }

    /// Logical processors and physical memory the host reports.
    pub fn with_capacity(mut self, cpus: u32, memory_mb: u64) -> Self {
        self.state.cpus = cpus.max(1);
        self.state.memory_mb = memory_mb;
        self
    }

    /// Remove the external switch from the host.
    pub fn without_external_network(mut self) -> Self {
        self.state.external_network = false;
        self
    }

    pub fn inject_fault(&mut self, operation: Operation, nth: usize, mode: FaultMode) {
        self.faults.push(Fault {
            operation,
            nth,
            mode,
        });
    }

    /// Create a bare VM in the given native state, bypassing the journal.
    pub fn seed_vm(&mut self, name: &str, enabled_state: u16) -> VmRef {
        let path = self.insert_vm(name);
        if let Some(vm) = self.state.vms.get_mut(&path) {
            vm.enabled_state = enabled_state;
            if enabled_state == power::ENABLED {
                vm.started_at_ms = Some(util::now_millis());
            }
        }
        VmRef::new(path)
    }

    /// Set the processor load reported for every VM with this name.
    pub fn set_processor_load(&mut self, name: &str, load: u32) {
        for vm in self.state.vms.values_mut().filter(|vm| vm.name == name) {
            vm.processor_load = load;
        }
    }

    /// Every call received so far.
    pub fn calls(&self) -> &[DriverCall] {
        &self.journal
    }

    /// Only the calls that change host state.
    pub fn mutations(&self) -> Vec<&DriverCall> {
        self.journal
            .iter()
            .filter(|c| c.operation.is_mutation())
            .collect()
    }

    /// Forget the calls recorded so far.
    pub fn clear_calls(&mut self) {
        self.journal.clear();
    }

    /// VMs with the given name.
    pub fn vms_named(&self, name: &str) -> Vec<&SimVm> {
        self.state.vms.values().filter(|vm| vm.name == name).collect()
    }

    pub fn vm_count(&self) -> usize {
        self.state.vms.len()
    }

    pub fn port(&self, path: &str) -> Option<&SimPort> {
        self.state.ports.get(path)
    }

    /// Every switch port, by path.
    pub fn ports(&self) -> impl Iterator<Item = (&String, &SimPort)> {
        self.state.ports.iter()
    }

    /// Jobs the host still tracks.
    pub fn job_count(&self) -> usize {
        self.state.jobs.len()
    }

    /// Size of a file on the host.
    pub fn file_size(&self, path: &str) -> Option<u64> {
        self.state.files.get(path).copied()
    }

    /// Place a file on the host, bypassing the journal.
    pub fn seed_file(&mut self, path: &str, size: u64) {
        self.state.files.insert(path.to_string(), size);
    }

    // ------------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------------

    fn record(&mut self, operation: Operation, target: &str, detail: Option<String>) -> usize {
        self.journal.push(DriverCall {
            operation,
            target: target.to_string(),
            detail,
        });
        let count = self.counts.entry(operation).or_insert(0);
        *count += 1;
        *count
    }

    fn fault_for(&self, operation: Operation, count: usize) -> Option<FaultMode> {
        self.faults
            .iter()
            .find(|f| f.operation == operation && f.nth == count)
            .map(|f| f.mode.clone())
    }

    /// Build the submission for a call that has been applied.
    fn complete(&mut self, description: String) -> Submission {
        if self.job_polls == 0 {
            return Submission::ok();
        }
        self.start_job(description, JobOutcome::Complete)
    }

    fn start_job(&mut self, description: String, outcome: JobOutcome) -> Submission {
        let id = self.state.next_id("job");
        self.state.jobs.insert(
            id.clone(),
            SimJob {
                description,
                polls_remaining: self.job_polls.max(1),
                polls: 0,
                outcome,
            },
        );
        Submission::started(JobHandle::new(id))
    }

    /// Submission for a faulted call. The call is not applied.
    fn faulted(&mut self, mode: FaultMode, description: String) -> Submission {
        match mode {
            FaultMode::ReturnCode(code) => Submission::code(code),
            FaultMode::JobFailure(reason) => self.start_job(description, JobOutcome::Fail(reason)),
            FaultMode::JobHang => self.start_job(description, JobOutcome::Hang),
        }
    }

    fn insert_vm(&mut self, name: &str) -> String {
        let path = self.state.next_id("vm");
        let resources = (0..2)
            .map(|address: u32| SimResource {
                path: format!("{}/ide-{}", path, address),
                settings: Settings::new(RASD_CLASS)
                    .with(props::RESOURCE_SUBTYPE, IDE_CONTROLLER_SUBTYPE)
                    .with(props::ADDRESS, address.to_string()),
            })
            .collect();

        self.state.vms.insert(
            path.clone(),
            SimVm {
                name: name.to_string(),
                enabled_state: power::DISABLED,
                memory: Settings::new(MEMORY_CLASS)
                    .with(props::INSTANCE_ID, format!("{}\\memory", path))
                    .with(props::VIRTUAL_QUANTITY, 512u64)
                    .with(props::RESERVATION, 512u64)
                    .with(props::LIMIT, 512u64),
                processor: Settings::new(PROCESSOR_CLASS)
                    .with(props::INSTANCE_ID, format!("{}\\processor", path))
                    .with(props::VIRTUAL_QUANTITY, 1u64)
                    .with(props::RESERVATION, 0u64)
                    .with(props::LIMIT, 100_000u64),
                resources,
                processor_load: 0,
                started_at_ms: None,
            },
        );
        path
    }

    fn vm(&self, vm: &VmRef) -> Result<&SimVm> {
        self.state
            .vms
            .get(vm.as_str())
            .ok_or_else(|| Error::not_found("vm", vm.to_string()))
    }

    fn vm_mut(&mut self, vm: &VmRef) -> Result<&mut SimVm> {
        self.state
            .vms
            .get_mut(vm.as_str())
            .ok_or_else(|| Error::not_found("vm", vm.to_string()))
    }

    fn record_for(path: &str, vm: &SimVm) -> VmRecord {
        VmRecord {
            vm: VmRef::new(path),
            name: vm.name.clone(),
            enabled_state: vm.enabled_state,
        }
    }

    /// Check a new resource against the VM's current topology.
    fn accepts(&self, vm: &SimVm, settings: &Settings) -> bool {
        let has_resource = |path: &str, subtype: Option<&str>| {
            vm.resources.iter().any(|r| {
                r.path == path && subtype.map_or(true, |s| r.settings.resource_subtype() == Some(s))
            })
        };

        match settings.resource_subtype() {
            Some(s)
                if s == TemplateKind::DiskDrive.resource_subtype()
                    || s == TemplateKind::DvdDrive.resource_subtype() =>
            {
                let (Some(parent), Some(address)) = (
                    settings.get_str(props::PARENT),
                    settings.get_str(props::ADDRESS),
                ) else {
                    return false;
                };
                let slot_taken = vm.resources.iter().any(|r| {
                    r.settings.get_str(props::PARENT) == Some(parent)
                        && r.settings.get_str(props::ADDRESS) == Some(address)
                });
                has_resource(parent, Some(IDE_CONTROLLER_SUBTYPE)) && !slot_taken
            }
            Some(s)
                if s == TemplateKind::VirtualHardDisk.resource_subtype()
                    || s == TemplateKind::VirtualDvdDisk.resource_subtype() =>
            {
                let connected = settings
                    .get_list(props::CONNECTION)
                    .map_or(false, |c| !c.is_empty());
                settings
                    .get_str(props::PARENT)
                    .map_or(false, |parent| has_resource(parent, None))
                    && connected
            }
            Some(s) if s == TemplateKind::SyntheticNic.resource_subtype() => {
                let port_exists = settings
                    .get_list(props::CONNECTION)
                    .and_then(|c| c.first())
                    .map_or(false, |port| self.state.ports.contains_key(port));
                port_exists && settings.get_str(props::ADDRESS).is_some()
            }
            _ => false,
        }
    }

    fn summary_for(vm: &SimVm, fields: &[SummaryField]) -> SummaryRecord {
        let running = vm.power_state() == PowerState::Running;
        let mut record = SummaryRecord::default();
        for field in fields {
            match field {
                SummaryField::NumberOfProcessors => {
                    record.number_of_processors = vm
                        .processor
                        .get_u64(props::VIRTUAL_QUANTITY)
                        .and_then(|v| u32::try_from(v).ok());
                }
                SummaryField::EnabledState => record.enabled_state = Some(vm.enabled_state),
                SummaryField::ProcessorLoad => {
                    record.processor_load = Some(if running { vm.processor_load } else { 0 });
                }
                SummaryField::MemoryUsage => {
                    record.memory_usage = Some(if running {
                        vm.memory.get_u64(props::VIRTUAL_QUANTITY).unwrap_or(0)
                    } else {
                        0
                    });
                }
                SummaryField::UpTime => {
                    record.up_time = Some(match (running, vm.started_at_ms) {
                        (true, Some(started)) => util::now_millis().saturating_sub(started),
                        _ => 0,
                    });
                }
            }
        }
        record
    }
}

impl HypervisorDriver for SimulatedHost {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn list_vms(&mut self) -> Result<Vec<VmRecord>> {
        self.record(Operation::ListVms, "*", None);
        Ok(self
            .state
            .vms
            .iter()
            .map(|(path, vm)| Self::record_for(path, vm))
            .collect())
    }

    fn find_vms_by_name(&mut self, name: &str) -> Result<Vec<VmRecord>> {
        self.record(Operation::FindVms, name, None);
        Ok(self
            .state
            .vms
            .iter()
            .filter(|(_, vm)| vm.name == name)
            .map(|(path, vm)| Self::record_for(path, vm))
            .collect())
    }

    fn define_vm(&mut self, name: &str) -> Result<(Submission, Option<VmRef>)> {
        let n = self.record(Operation::DefineVm, name, None);
        let description = format!("Defining virtual machine {}", name);
        if let Some(mode) = self.fault_for(Operation::DefineVm, n) {
            return Ok((self.faulted(mode, description), None));
        }
        let path = self.insert_vm(name);
        Ok((self.complete(description), Some(VmRef::new(path))))
    }

    fn vm_settings(&mut self, vm: &VmRef, kind: SettingsKind) -> Result<Settings> {
        self.record(Operation::VmSettings, vm.as_str(), Some(format!("{:?}", kind)));
        let sim = self.vm(vm)?;
        Ok(match kind {
            SettingsKind::Memory => sim.memory.clone(),
            SettingsKind::Processor => sim.processor.clone(),
        })
    }

    fn modify_resources(&mut self, vm: &VmRef, settings: &[Settings]) -> Result<Submission> {
        let classes: Vec<&str> = settings.iter().map(|s| s.class.as_str()).collect();
        let n = self.record(
            Operation::ModifyResources,
            vm.as_str(),
            Some(classes.join(",")),
        );
        let description = format!("Modifying resources of {}", vm);
        if let Some(mode) = self.fault_for(Operation::ModifyResources, n) {
            return Ok(self.faulted(mode, description));
        }

        let sim = self.vm_mut(vm)?;
        for s in settings {
            match s.class.as_str() {
                MEMORY_CLASS => sim.memory = s.clone(),
                PROCESSOR_CLASS => sim.processor = s.clone(),
                _ => return Ok(Submission::code(INVALID_PARAMETER)),
            }
        }
        Ok(self.complete(description))
    }

    fn find_ide_controller(&mut self, vm: &VmRef, address: u32) -> Result<Option<ResourceRef>> {
        self.record(
            Operation::FindIdeController,
            vm.as_str(),
            Some(address.to_string()),
        );
        let address = address.to_string();
        let sim = self.vm(vm)?;
        Ok(sim
            .resources_of(IDE_CONTROLLER_SUBTYPE)
            .into_iter()
            .find(|r| r.settings.get_str(props::ADDRESS) == Some(address.as_str()))
            .map(|r| ResourceRef::new(r.path.clone())))
    }

    fn default_template(&mut self, kind: TemplateKind) -> Result<Settings> {
        self.record(
            Operation::DefaultTemplate,
            kind.resource_subtype(),
            None,
        );
        let class = match kind {
            TemplateKind::SyntheticNic => NIC_CLASS,
            _ => RASD_CLASS,
        };
        let mut template = Settings::new(class)
            .with(props::RESOURCE_SUBTYPE, kind.resource_subtype())
            .with(
                props::INSTANCE_ID,
                format!("Microsoft:Definition\\{}\\Default", kind.resource_subtype()),
            );
        if kind == TemplateKind::SyntheticNic {
            template.set(props::ELEMENT_NAME, "Network Adapter");
            template.set(
                props::VIRTUAL_SYSTEM_IDENTIFIERS,
                vec!["{00000000-0000-0000-0000-000000000000}".to_string()],
            );
            template.set(props::STATIC_MAC_ADDRESS, false);
        }
        Ok(template)
    }

    fn add_resource(
        &mut self,
        vm: &VmRef,
        settings: &Settings,
    ) -> Result<(Submission, Vec<ResourceRef>)> {
        let subtype = settings.resource_subtype().map(str::to_string);
        let n = self.record(Operation::AddResource, vm.as_str(), subtype.clone());
        let description = format!(
            "Adding {} to {}",
            subtype.as_deref().unwrap_or("resource"),
            vm
        );
        if let Some(mode) = self.fault_for(Operation::AddResource, n) {
            return Ok((self.faulted(mode, description), Vec::new()));
        }

        if !self.accepts(self.vm(vm)?, settings) {
            return Ok((Submission::code(INVALID_PARAMETER), Vec::new()));
        }

        let id = self.state.next_id("res");
        let path = format!("{}/{}", vm, id);
        self.vm_mut(vm)?.resources.push(SimResource {
            path: path.clone(),
            settings: settings.clone(),
        });
        Ok((self.complete(description), vec![ResourceRef::new(path)]))
    }

    fn find_external_network(&mut self) -> Result<Option<NetworkRef>> {
        self.record(Operation::FindExternalNetwork, "*", None);
        Ok(self
            .state
            .external_network
            .then(|| NetworkRef::new(EXTERNAL_SWITCH)))
    }

    fn create_switch_port(
        &mut self,
        network: &NetworkRef,
        name: &str,
        friendly_name: &str,
    ) -> Result<(u32, Option<ResourceRef>)> {
        let n = self.record(
            Operation::CreateSwitchPort,
            network.as_str(),
            Some(friendly_name.to_string()),
        );
        if let Some(mode) = self.fault_for(Operation::CreateSwitchPort, n) {
            let code = match mode {
                FaultMode::ReturnCode(code) => code,
                _ => FAILED,
            };
            return Ok((code, None));
        }
        if !self.state.external_network || network.as_str() != EXTERNAL_SWITCH {
            return Err(Error::not_found("network", network.to_string()));
        }

        let path = self.state.next_id("port");
        self.state.ports.insert(
            path.clone(),
            SimPort {
                switch: network.to_string(),
                name: name.to_string(),
                friendly_name: friendly_name.to_string(),
                vlan: Settings::new(VLAN_CLASS)
                    .with(props::INSTANCE_ID, format!("{}\\vlan", path)),
            },
        );
        Ok((0, Some(ResourceRef::new(path))))
    }

    fn vlan_settings(&mut self, port: &ResourceRef) -> Result<Option<Settings>> {
        self.record(Operation::VlanSettings, port.as_str(), None);
        Ok(self.state.ports.get(port.as_str()).map(|p| p.vlan.clone()))
    }

    fn modify_vlan_settings(
        &mut self,
        port: &ResourceRef,
        settings: &Settings,
    ) -> Result<Submission> {
        let n = self.record(
            Operation::ModifyVlanSettings,
            port.as_str(),
            settings.get_u64(props::ACCESS_VLAN).map(|v| v.to_string()),
        );
        let description = format!("Modifying VLAN settings of {}", port);
        if let Some(mode) = self.fault_for(Operation::ModifyVlanSettings, n) {
            return Ok(self.faulted(mode, description));
        }
        match self.state.ports.get_mut(port.as_str()) {
            Some(p) => p.vlan = settings.clone(),
            None => return Err(Error::not_found("switch port", port.to_string())),
        }
        Ok(self.complete(description))
    }

    fn request_state_change(&mut self, vm: &VmRef, code: u16) -> Result<Submission> {
        let n = self.record(
            Operation::RequestStateChange,
            vm.as_str(),
            Some(code.to_string()),
        );
        let description = format!("Changing state of {} to {}", vm, code);
        if let Some(mode) = self.fault_for(Operation::RequestStateChange, n) {
            return Ok(self.faulted(mode, description));
        }

        let Some(request) = RequestedState::from_code(code) else {
            return Ok(Submission::code(INVALID_PARAMETER));
        };
        let sim = self.vm_mut(vm)?;
        let current = sim.power_state();
        let applies = match request {
            RequestedState::Reboot | RequestedState::Reset => current == PowerState::Running,
            other => current != other.target(),
        };
        if !applies {
            return Ok(Submission::code(INVALID_STATE));
        }

        let target = request.target();
        if let Some(native) = target.native_code() {
            sim.enabled_state = native;
        }
        sim.started_at_ms = match target {
            PowerState::Running if current != PowerState::Paused => Some(util::now_millis()),
            PowerState::Running | PowerState::Paused => sim.started_at_ms,
            _ => None,
        };
        Ok(self.complete(description))
    }

    fn destroy_vm(&mut self, vm: &VmRef) -> Result<Submission> {
        let n = self.record(Operation::DestroyVm, vm.as_str(), None);
        let description = format!("Destroying {}", vm);
        if let Some(mode) = self.fault_for(Operation::DestroyVm, n) {
            return Ok(self.faulted(mode, description));
        }
        if self.state.vms.remove(vm.as_str()).is_none() {
            return Err(Error::not_found("vm", vm.to_string()));
        }
        Ok(self.complete(description))
    }

    fn poll_job(&mut self, job: &JobHandle) -> Result<Option<JobStatus>> {
        self.record(Operation::PollJob, job.as_str(), None);
        let Some(sim) = self.state.jobs.get_mut(job.as_str()) else {
            return Ok(None);
        };

        sim.polls += 1;
        sim.polls_remaining = sim.polls_remaining.saturating_sub(1);
        let elapsed = Duration::from_millis(u64::from(sim.polls) * 10);

        let (state, error_summary) = match (&sim.outcome, sim.polls_remaining) {
            (JobOutcome::Hang, _) | (_, 1..) => (JobState::Pending(JobState::RUNNING), None),
            (JobOutcome::Complete, 0) => (JobState::Completed, None),
            (JobOutcome::Fail(reason), 0) => {
                (JobState::Failed(JobState::EXCEPTION), Some(reason.clone()))
            }
        };
        let status = JobStatus {
            state,
            description: sim.description.clone(),
            elapsed,
            error_summary,
        };

        // Terminal jobs are reported once, then forgotten.
        if !matches!(status.state, JobState::Pending(_)) {
            self.state.jobs.remove(job.as_str());
        }
        Ok(Some(status))
    }

    fn summary_info(&mut self, vm: &VmRef, fields: &[SummaryField]) -> Result<SummaryRecord> {
        let codes: Vec<String> = fields.iter().map(|f| f.code().to_string()).collect();
        self.record(Operation::SummaryInfo, vm.as_str(), Some(codes.join(",")));
        let sim = self.vm(vm)?;
        Ok(Self::summary_for(sim, fields))
    }

    fn host_usage(&mut self) -> Result<HostUsage> {
        self.record(Operation::HostUsage, "host", None);
        let running: Vec<&SimVm> = self
            .state
            .vms
            .values()
            .filter(|vm| vm.power_state() == PowerState::Running)
            .collect();

        let busy: f64 = running
            .iter()
            .map(|vm| {
                let vcpus = vm.processor.get_u64(props::VIRTUAL_QUANTITY).unwrap_or(1);
                f64::from(vm.processor_load) * vcpus as f64
            })
            .sum();
        let cpu_utilization = (busy / f64::from(self.state.cpus.max(1))).min(100.0);

        let used_mb: u64 = running
            .iter()
            .map(|vm| vm.memory.get_u64(props::VIRTUAL_QUANTITY).unwrap_or(0))
            .sum();
        let total_memory_kb = self.state.memory_mb * 1024;

        Ok(HostUsage {
            cpu_utilization,
            total_memory_kb,
            free_memory_kb: total_memory_kb.saturating_sub(used_mb * 1024),
        })
    }

    fn create_virtual_disk(&mut self, path: &str, size: u64) -> Result<Submission> {
        let n = self.record(
            Operation::CreateVirtualDisk,
            path,
            Some(size.to_string()),
        );
        let description = format!("Creating virtual disk {}", path);
        if let Some(mode) = self.fault_for(Operation::CreateVirtualDisk, n) {
            return Ok(self.faulted(mode, description));
        }
        if self.state.files.contains_key(path) {
            return Ok(Submission::code(FILE_EXISTS));
        }
        self.state.files.insert(path.to_string(), size);
        Ok(self.complete(description))
    }

    fn delete_file(&mut self, path: &str) -> Result<()> {
        let n = self.record(Operation::DeleteFile, path, None);
        if let Some(mode) = self.fault_for(Operation::DeleteFile, n) {
            return Err(Error::driver(
                format!("delete {}", path),
                format!("injected fault: {:?}", mode),
            ));
        }
        match self.state.files.remove(path) {
            Some(_) => Ok(()),
            None => Err(Error::not_found("file", path)),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.save()
    }
}

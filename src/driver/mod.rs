//! Hypervisor driver capability.
//!
//! [`HypervisorDriver`] is the narrow interface the rest of vmshim uses to
//! reach the host's virtualization management service. A driver is opened
//! once per command and closed when the command finishes; nothing is shared
//! between commands.
//!
//! Mutating calls return a [`Submission`]: either an immediate return code
//! or a handle to an asynchronous job that the caller resolves with
//! [`JobPoller`](crate::job::JobPoller).

mod settings;
pub mod simulated;

pub use settings::{fresh_identifier, props, Property, Settings};
pub use simulated::SimulatedHost;

use crate::config::ShimConfig;
use crate::error::{Error, Result};
use crate::power::PowerState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Return code: call completed synchronously.
pub const RETURN_OK: u32 = 0;
/// Return code: call started an asynchronous job.
pub const JOB_STARTED: u32 = 4096;
/// Return code: the request does not apply to the VM's current state.
pub const INVALID_STATE: u32 = 32775;
/// Return code: a parameter was rejected.
pub const INVALID_PARAMETER: u32 = 32773;

macro_rules! reference_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(path: impl Into<String>) -> Self {
                Self(path.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

reference_type!(
    /// Opaque reference to a VM on the host.
    VmRef
);
reference_type!(
    /// Opaque reference to a resource (drive, media, NIC, switch port).
    ResourceRef
);
reference_type!(
    /// Opaque reference to a virtual switch.
    NetworkRef
);
reference_type!(
    /// Opaque reference to an asynchronous job.
    JobHandle
);

/// A VM as returned by name lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRecord {
    pub vm: VmRef,
    pub name: String,
    /// Native `EnabledState` code.
    pub enabled_state: u16,
}

impl VmRecord {
    pub fn power_state(&self) -> PowerState {
        PowerState::from_native(self.enabled_state)
    }
}

/// Outcome of submitting a mutating call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub return_value: u32,
    /// Present when `return_value` is [`JOB_STARTED`].
    pub job: Option<JobHandle>,
}

impl Submission {
    /// Synchronous success.
    pub fn ok() -> Self {
        Self {
            return_value: RETURN_OK,
            job: None,
        }
    }

    /// Synchronous result with the given return code.
    pub fn code(return_value: u32) -> Self {
        Self {
            return_value,
            job: None,
        }
    }

    /// Asynchronous job started.
    pub fn started(job: JobHandle) -> Self {
        Self {
            return_value: JOB_STARTED,
            job: Some(job),
        }
    }

    pub fn is_async(&self) -> bool {
        self.return_value == JOB_STARTED
    }
}

/// Native job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// New, starting or running.
    Pending(u16),
    Completed,
    /// Any other terminal state (terminated, killed, exception, ...).
    Failed(u16),
}

impl JobState {
    pub const NEW: u16 = 2;
    pub const STARTING: u16 = 3;
    pub const RUNNING: u16 = 4;
    pub const COMPLETED: u16 = 7;
    pub const EXCEPTION: u16 = 10;

    pub fn from_native(code: u16) -> Self {
        match code {
            Self::NEW | Self::STARTING | Self::RUNNING => JobState::Pending(code),
            Self::COMPLETED => JobState::Completed,
            other => JobState::Failed(other),
        }
    }
}

/// Snapshot of a job returned by [`HypervisorDriver::poll_job`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub state: JobState,
    pub description: String,
    pub elapsed: Duration,
    /// Set when the job failed.
    pub error_summary: Option<String>,
}

/// Which of a VM's settings objects to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsKind {
    Memory,
    Processor,
}

/// Default settings templates the host provides for new resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateKind {
    DiskDrive,
    DvdDrive,
    VirtualHardDisk,
    VirtualDvdDisk,
    SyntheticNic,
}

impl TemplateKind {
    /// Resource subtype string the host uses for this template.
    pub fn resource_subtype(self) -> &'static str {
        match self {
            TemplateKind::DiskDrive => "Microsoft Synthetic Disk Drive",
            TemplateKind::DvdDrive => "Microsoft Synthetic DVD Drive",
            TemplateKind::VirtualHardDisk => "Microsoft Virtual Hard Disk",
            TemplateKind::VirtualDvdDisk => "Microsoft Virtual CD/DVD Disk",
            TemplateKind::SyntheticNic => "Microsoft Synthetic Ethernet Port",
        }
    }
}

/// Summary information fields, by native identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SummaryField {
    NumberOfProcessors,
    EnabledState,
    ProcessorLoad,
    MemoryUsage,
    UpTime,
}

impl SummaryField {
    pub const ALL: [SummaryField; 5] = [
        SummaryField::NumberOfProcessors,
        SummaryField::EnabledState,
        SummaryField::ProcessorLoad,
        SummaryField::MemoryUsage,
        SummaryField::UpTime,
    ];

    pub fn code(self) -> u32 {
        match self {
            SummaryField::NumberOfProcessors => 4,
            SummaryField::EnabledState => 100,
            SummaryField::ProcessorLoad => 101,
            SummaryField::MemoryUsage => 103,
            SummaryField::UpTime => 105,
        }
    }
}

/// Summary information for one VM. Fields not requested are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryRecord {
    pub enabled_state: Option<u16>,
    /// MiB.
    pub memory_usage: Option<u64>,
    pub number_of_processors: Option<u32>,
    /// Milliseconds.
    pub up_time: Option<u64>,
    /// Percent.
    pub processor_load: Option<u32>,
}

/// Host-wide resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostUsage {
    /// Percent, averaged over all logical processors.
    pub cpu_utilization: f64,
    pub total_memory_kb: u64,
    pub free_memory_kb: u64,
}

/// Capability interface onto the host's virtualization management service.
pub trait HypervisorDriver {
    /// Backend name (e.g. "simulated").
    fn name(&self) -> &'static str;

    /// All VMs on the host.
    fn list_vms(&mut self) -> Result<Vec<VmRecord>>;

    /// All VMs whose name matches exactly. Names are not unique.
    fn find_vms_by_name(&mut self, name: &str) -> Result<Vec<VmRecord>>;

    /// Define an empty VM. Returns the new VM's reference when the host
    /// reports it.
    fn define_vm(&mut self, name: &str) -> Result<(Submission, Option<VmRef>)>;

    /// Fetch the VM's current memory or processor settings.
    fn vm_settings(&mut self, vm: &VmRef, kind: SettingsKind) -> Result<Settings>;

    fn modify_resources(&mut self, vm: &VmRef, settings: &[Settings]) -> Result<Submission>;

    /// Find the IDE controller at `address`.
    fn find_ide_controller(&mut self, vm: &VmRef, address: u32) -> Result<Option<ResourceRef>>;

    fn default_template(&mut self, kind: TemplateKind) -> Result<Settings>;

    /// Add a resource to a VM, returning references to what was created.
    fn add_resource(
        &mut self,
        vm: &VmRef,
        settings: &Settings,
    ) -> Result<(Submission, Vec<ResourceRef>)>;

    /// The virtual switch bound to the host's physical uplink.
    fn find_external_network(&mut self) -> Result<Option<NetworkRef>>;

    /// Create a port on a virtual switch. Returns the raw return code.
    fn create_switch_port(
        &mut self,
        network: &NetworkRef,
        name: &str,
        friendly_name: &str,
    ) -> Result<(u32, Option<ResourceRef>)>;

    /// VLAN endpoint settings of a switch port.
    fn vlan_settings(&mut self, port: &ResourceRef) -> Result<Option<Settings>>;

    fn modify_vlan_settings(&mut self, port: &ResourceRef, settings: &Settings)
        -> Result<Submission>;

    /// Request a power state change using a native request code.
    fn request_state_change(&mut self, vm: &VmRef, code: u16) -> Result<Submission>;

    /// Destroy a VM definition. Backing files are not touched.
    fn destroy_vm(&mut self, vm: &VmRef) -> Result<Submission>;

    /// Current status of a job, or `None` if the host does not know it.
    fn poll_job(&mut self, job: &JobHandle) -> Result<Option<JobStatus>>;

    fn summary_info(&mut self, vm: &VmRef, fields: &[SummaryField]) -> Result<SummaryRecord>;

    /// Processor and memory usage of the host itself.
    fn host_usage(&mut self) -> Result<HostUsage>;

    /// Create a dynamically expanding virtual disk file.
    fn create_virtual_disk(&mut self, path: &str, size: u64) -> Result<Submission>;

    fn delete_file(&mut self, path: &str) -> Result<()>;

    /// End the session.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Open the driver backend selected by `config`.
pub fn open(config: &ShimConfig) -> Result<Box<dyn HypervisorDriver>> {
    match config.driver.as_str() {
        simulated::BACKEND_NAME => {
            let path = config.state_file()?;
            tracing::debug!(path = %path.display(), "opening simulated host");
            Ok(Box::new(SimulatedHost::open(&path)?))
        }
        other => Err(Error::HypervisorUnavailable(format!(
            "no driver backend named '{}'",
            other
        ))),
    }
}

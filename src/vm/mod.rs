//! VM provisioning and lifecycle.
//!
//! [`ResourceBuilder`] performs the individual configuration steps against a
//! driver; [`VmOps`] sequences them into spawn, destroy and power operations.

mod builder;
mod lifecycle;

pub use builder::{DriveKind, ResourceBuilder, ISO_CONTROLLER, ROOT_CONTROLLER, CPU_LIMIT};
pub use lifecycle::VmOps;

use crate::power::PowerState;
use serde::Serialize;

/// Current information about one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmInfo {
    pub state: PowerState,
    /// MiB in use.
    pub memory_mb: u64,
    /// Same as `memory_mb`; the host reports no separate ceiling.
    pub max_memory_mb: u64,
    pub num_cpus: u32,
    /// Milliseconds since the VM was started.
    pub uptime_ms: u64,
    /// Percent.
    pub cpu_utilization: u32,
}

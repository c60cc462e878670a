//! vmshim - host agent shim for a hypervisor host.
//!
//! vmshim receives named commands from a cloud orchestrator, carries them
//! out through a [`HypervisorDriver`] and replies with an
//! [`Answer`](vmshim_protocol::Answer). The main pieces are:
//!
//! - [`dispatch`]: command routing and answer encoding
//! - [`vm`]: the VM provisioning state machine and power control
//! - [`job`]: resolution of asynchronous hypervisor jobs
//! - [`power`]: native power-state code mapping
//! - [`storage`]: volume creation and deletion
//! - [`driver`]: the driver capability and the simulated host backend

pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod job;
pub mod power;
pub mod storage;
pub mod util;
pub mod vm;

pub use config::ShimConfig;
pub use dispatch::Dispatcher;
pub use driver::HypervisorDriver;
pub use error::{Error, ErrorKind, Result};
pub use job::JobPoller;
pub use power::{PowerState, RequestedState};
pub use vm::{VmInfo, VmOps};
pub use vmshim_protocol as protocol;

/// vmshim version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

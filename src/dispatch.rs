//! Command dispatcher.
//!
//! Routes each decoded [`Command`] to the matching operation and encodes the
//! outcome as an [`Answer`]. Every failure, including an unknown command
//! name or a malformed payload, becomes a `result: "false"` answer carrying
//! the error message; nothing escapes unencoded.

use crate::driver::HypervisorDriver;
use crate::error::{ErrorKind, Result};
use crate::job::JobPoller;
use crate::storage;
use crate::vm::VmOps;
use serde_json::{json, Map, Value};
use vmshim_protocol::{
    Answer, CheckNetworkCommand, CheckVirtualMachineCommand, Command, CreateCommand,
    DestroyCommand, GetHostStatsCommand, GetVmStatsCommand, HostStatsEntry, RebootCommand,
    StartCommand, StopCommand, VmStatsEntry,
};

/// Executes commands against one driver session.
pub struct Dispatcher<'d> {
    driver: &'d mut dyn HypervisorDriver,
    poller: JobPoller,
    ready_details: Option<String>,
}

impl<'d> Dispatcher<'d> {
    pub fn new(driver: &'d mut dyn HypervisorDriver, poller: JobPoller) -> Self {
        Self {
            driver,
            poller,
            ready_details: None,
        }
    }

    /// Details attached to `ReadyCommand` answers.
    pub fn with_ready_details(mut self, details: Option<String>) -> Self {
        self.ready_details = details;
        self
    }

    fn ops(&mut self) -> VmOps<'_> {
        VmOps::new(&mut *self.driver, self.poller)
    }

    /// Decode and execute a named command.
    pub fn dispatch(&mut self, name: &str, payload: Value) -> Answer {
        match Command::decode(name, payload) {
            Ok(command) => self.execute(command),
            Err(e) => {
                tracing::warn!(command = %name, error = %e, "rejected command");
                Answer::failure(e.to_string())
            }
        }
    }

    /// Execute a decoded command.
    pub fn execute(&mut self, command: Command) -> Answer {
        let name = command.name();
        tracing::debug!(command = name, driver = self.driver.name(), "executing command");

        let result = match command {
            Command::Start(cmd) => self.start(cmd),
            Command::Stop(cmd) => self.stop(cmd),
            Command::CreateVolume(cmd) => self.create_volume(cmd),
            Command::DestroyVolume(cmd) => self.destroy_volume(cmd),
            Command::GetVmStats(cmd) => self.vm_stats(cmd),
            Command::GetHostStats(cmd) => self.host_stats(cmd),
            Command::CheckVirtualMachine(cmd) => self.check_vm(cmd),
            Command::Reboot(cmd) => self.reboot(cmd),
            Command::CheckNetwork(cmd) => Ok(self.check_network(cmd)),
            Command::Ready(_) => Ok(self.ready()),
        };

        match result {
            Ok(answer) => answer,
            Err(e) => {
                tracing::error!(command = name, error = %e, "command failed");
                Answer::failure(e.to_string())
            }
        }
    }

    fn start(&mut self, cmd: StartCommand) -> Result<Answer> {
        self.ops().spawn(&cmd.vm)?;
        Ok(Answer::success().with_field("vm", serde_json::to_value(&cmd.vm)?))
    }

    fn stop(&mut self, cmd: StopCommand) -> Result<Answer> {
        self.ops().destroy(&cmd.vm_name)?;
        Ok(Answer::success()
            .with_details("success")
            .with_field("wait", json!(0)))
    }

    fn create_volume(&mut self, cmd: CreateCommand) -> Result<Answer> {
        let volume = storage::create_volume(&mut *self.driver, &self.poller, &cmd)?;
        Ok(Answer::success().with_field("volume", serde_json::to_value(&volume)?))
    }

    fn destroy_volume(&mut self, cmd: DestroyCommand) -> Result<Answer> {
        storage::destroy_volume(&mut *self.driver, &cmd.volume)?;
        Ok(Answer::success().with_details("success"))
    }

    /// Stats for every named VM the host knows. Unknown VMs are skipped.
    fn vm_stats(&mut self, cmd: GetVmStatsCommand) -> Result<Answer> {
        let mut stats = Map::new();
        for name in &cmd.vm_names {
            let info = match self.ops().get_info(name) {
                Ok(info) => info,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    tracing::debug!(vm = %name, "skipping stats for unknown vm");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(vm = %name, error = %e, "skipping stats for vm");
                    continue;
                }
            };
            let entry = VmStatsEntry {
                cpu_utilization: f64::from(info.cpu_utilization),
                network_read_kbs: 0.0,
                network_write_kbs: 0.0,
                num_cpus: info.num_cpus,
                entity_type: "vm".to_string(),
            };
            stats.insert(name.clone(), serde_json::to_value(entry)?);
        }
        Ok(Answer::success().with_field("vmStatsMap", Value::Object(stats)))
    }

    fn host_stats(&mut self, cmd: GetHostStatsCommand) -> Result<Answer> {
        let usage = self.driver.host_usage()?;
        let entry = HostStatsEntry {
            host_id: cmd.host_id,
            entity_type: "host".to_string(),
            cpu_utilization: usage.cpu_utilization,
            network_read_kbs: 0.0,
            network_write_kbs: 0.0,
            total_memory_kbs: usage.total_memory_kb as f64,
            free_memory_kbs: usage.free_memory_kb as f64,
        };
        Ok(Answer::success().with_field("hostStats", serde_json::to_value(entry)?))
    }

    /// Unknown VMs are a failed answer with a null state.
    fn check_vm(&mut self, cmd: CheckVirtualMachineCommand) -> Result<Answer> {
        let state = self.ops().check_vm(&cmd.vm_name)?;
        let answer = match state {
            Some(state) => Answer::success().with_field("state", serde_json::to_value(state)?),
            None => Answer::failure(format!(
                "CheckVirtualMachineCommand requested unknown VM {}",
                cmd.vm_name
            ))
            .with_field("state", Value::Null),
        };
        Ok(answer)
    }

    fn reboot(&mut self, cmd: RebootCommand) -> Result<Answer> {
        self.ops().reboot(&cmd.vm_name)?;
        Ok(Answer::success())
    }

    // TODO: look up each named network on the host once the driver can
    // enumerate switches by name.
    fn check_network(&self, cmd: CheckNetworkCommand) -> Answer {
        tracing::debug!(
            networks = cmd.physical_network_info_list.len(),
            "accepting network setup without verification"
        );
        Answer::success()
    }

    fn ready(&self) -> Answer {
        let answer = Answer::success()
            .with_field("protocolVersion", json!(vmshim_protocol::PROTOCOL_VERSION));
        match &self.ready_details {
            Some(details) => answer.with_details(details.clone()),
            None => answer,
        }
    }
}

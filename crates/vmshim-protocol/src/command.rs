//! Commands accepted by vmshim.

use crate::vm::VmSpec;
use crate::volume::{DiskCharacteristics, StoragePool, Volume};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Create and power on a VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartCommand {
    pub vm: VmSpec,
}

/// Stop and destroy a VM. Its disks are left alone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StopCommand {
    pub vm_name: String,
}

/// Create a data or ISO volume in a storage pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateCommand {
    pub vol_id: u64,
    pub disk_characteristics: DiskCharacteristics,
    pub pool: StoragePool,
}

/// Delete a volume's backing file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DestroyCommand {
    pub volume: Volume,
}

/// Collect statistics for a set of VMs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GetVmStatsCommand {
    pub vm_names: Vec<String>,
}

/// Collect statistics for the host itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GetHostStatsCommand {
    pub host_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
}

/// Report the power state of one VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CheckVirtualMachineCommand {
    pub vm_name: String,
}

/// Reboot a VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RebootCommand {
    pub vm_name: String,
}

/// Names of the physical networks one zone expects on a host.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalNetworkInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_network_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_network_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_network_name: Option<String>,
}

/// Verify the host's physical network setup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CheckNetworkCommand {
    #[serde(default)]
    pub physical_network_info_list: Vec<PhysicalNetworkInfo>,
}

/// Liveness probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadyCommand {}

/// Every command vmshim understands.
///
/// Envelope fields such as `contextMap` and `wait` are ignored when the
/// payload is decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start(StartCommand),
    Stop(StopCommand),
    CreateVolume(CreateCommand),
    DestroyVolume(DestroyCommand),
    GetVmStats(GetVmStatsCommand),
    GetHostStats(GetHostStatsCommand),
    CheckVirtualMachine(CheckVirtualMachineCommand),
    Reboot(RebootCommand),
    CheckNetwork(CheckNetworkCommand),
    Ready(ReadyCommand),
}

/// Errors from [`Command::decode`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid payload for {command}: {source}")]
    InvalidPayload {
        command: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl Command {
    /// Wire names of all supported commands.
    pub const NAMES: &'static [&'static str] = &[
        "StartCommand",
        "StopCommand",
        "CreateCommand",
        "DestroyCommand",
        "GetVmStatsCommand",
        "GetHostStatsCommand",
        "CheckVirtualMachineCommand",
        "RebootCommand",
        "CheckNetworkCommand",
        "ReadyCommand",
    ];

    /// Decode a named command from its JSON payload.
    ///
    /// A `null` payload is treated as an empty object.
    pub fn decode(name: &str, payload: Value) -> Result<Self, DecodeError> {
        let payload = match payload {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };

        let command = match name {
            "StartCommand" => Command::Start(parse("StartCommand", payload)?),
            "StopCommand" => Command::Stop(parse("StopCommand", payload)?),
            "CreateCommand" => Command::CreateVolume(parse("CreateCommand", payload)?),
            "DestroyCommand" => Command::DestroyVolume(parse("DestroyCommand", payload)?),
            "GetVmStatsCommand" => Command::GetVmStats(parse("GetVmStatsCommand", payload)?),
            "GetHostStatsCommand" => Command::GetHostStats(parse("GetHostStatsCommand", payload)?),
            "CheckVirtualMachineCommand" => {
                Command::CheckVirtualMachine(parse("CheckVirtualMachineCommand", payload)?)
            }
            "RebootCommand" => Command::Reboot(parse("RebootCommand", payload)?),
            "CheckNetworkCommand" => Command::CheckNetwork(parse("CheckNetworkCommand", payload)?),
            "ReadyCommand" => Command::Ready(parse("ReadyCommand", payload)?),
            other => return Err(DecodeError::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }

    /// Wire name of this command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Start(_) => "StartCommand",
            Command::Stop(_) => "StopCommand",
            Command::CreateVolume(_) => "CreateCommand",
            Command::DestroyVolume(_) => "DestroyCommand",
            Command::GetVmStats(_) => "GetVmStatsCommand",
            Command::GetHostStats(_) => "GetHostStatsCommand",
            Command::CheckVirtualMachine(_) => "CheckVirtualMachineCommand",
            Command::Reboot(_) => "RebootCommand",
            Command::CheckNetwork(_) => "CheckNetworkCommand",
            Command::Ready(_) => "ReadyCommand",
        }
    }
}

fn parse<T: DeserializeOwned>(command: &'static str, payload: Value) -> Result<T, DecodeError> {
    serde_json::from_value(payload).map_err(|source| DecodeError::InvalidPayload { command, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_ignores_envelope_fields() {
        let payload = json!({"vmName": "vm1", "contextMap": {}, "wait": 0});
        let cmd = Command::decode("StopCommand", payload).unwrap();
        assert_eq!(
            cmd,
            Command::Stop(StopCommand {
                vm_name: "vm1".to_string()
            })
        );
        assert_eq!(cmd.name(), "StopCommand");
    }

    #[test]
    fn test_decode_unknown_command() {
        let err = Command::decode("MigrateCommand", json!({})).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownCommand(ref n) if n == "MigrateCommand"));
    }

    #[test]
    fn test_decode_invalid_payload() {
        let err = Command::decode("StartCommand", json!({"vm": {"name": "x"}})).unwrap_err();
        assert!(err.to_string().starts_with("invalid payload for StartCommand"));
    }

    #[test]
    fn test_decode_host_stats_sample() {
        let payload = json!({
            "hostGuid": "B4AE5970-FCBF-4780-9F8A-2D2E04FECC34-HypervResource",
            "hostName": "CC-SVR11",
            "hostId": 5,
            "contextMap": {},
            "wait": 0
        });
        let cmd = Command::decode("GetHostStatsCommand", payload).unwrap();
        match cmd {
            Command::GetHostStats(ref c) => {
                assert_eq!(c.host_id, 5);
                assert_eq!(c.host_name.as_deref(), Some("CC-SVR11"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_check_network_defaults_to_empty_list() {
        let cmd = Command::decode("CheckNetworkCommand", Value::Null).unwrap();
        assert_eq!(cmd, Command::CheckNetwork(CheckNetworkCommand::default()));
    }

    #[test]
    fn test_ready_accepts_null_payload() {
        let cmd = Command::decode("ReadyCommand", Value::Null).unwrap();
        assert_eq!(cmd, Command::Ready(ReadyCommand {}));
    }

    #[test]
    fn test_names_round_trip() {
        for name in Command::NAMES {
            // Only the name dispatch is checked here; payloads are covered above.
            let err = Command::decode(name, json!([])).err();
            if let Some(DecodeError::UnknownCommand(n)) = err {
                panic!("{} not recognized", n);
            }
        }
    }
}

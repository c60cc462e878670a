//! VM provisioning records carried by `StartCommand`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bytes in one MiB.
pub const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Isolation URI scheme that carries a VLAN id.
const VLAN_SCHEME: &str = "vlan://";

/// Highest usable 802.1Q VLAN id.
const MAX_VLAN_ID: u16 = 4094;

/// Everything needed to provision one VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VmSpec {
    /// VM name; also the lookup key on the host.
    pub name: String,

    /// Orchestrator-side identifier, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    /// Number of virtual CPUs.
    pub cpus: u32,

    /// Memory size in bytes.
    pub max_ram: u64,

    /// Disks to attach, in order.
    #[serde(default)]
    pub disks: Vec<DiskSpec>,

    /// Network interfaces to attach, in order.
    #[serde(default)]
    pub nics: Vec<NicSpec>,
}

impl VmSpec {
    /// Memory size in whole MiB.
    pub fn memory_mb(&self) -> u64 {
        self.max_ram / BYTES_PER_MIB
    }
}

/// A disk attached at spawn time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiskSpec {
    #[serde(default)]
    pub id: u64,

    #[serde(rename = "type")]
    pub disk_type: DiskType,

    /// Backing file. An ISO disk without a path gets an empty DVD drive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Drive address on the controller chosen for this disk type.
    #[serde(default)]
    pub device_id: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl DiskSpec {
    /// Name used in log lines and error messages.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("disk-{}", self.id),
        }
    }
}

/// Disk role as named by the orchestrator.
///
/// Unknown names are kept verbatim so they can be reported back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DiskType {
    Root,
    Iso,
    DataDisk,
    Other(String),
}

impl DiskType {
    pub fn as_str(&self) -> &str {
        match self {
            DiskType::Root => "ROOT",
            DiskType::Iso => "ISO",
            DiskType::DataDisk => "DATADISK",
            DiskType::Other(s) => s,
        }
    }
}

impl From<String> for DiskType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ROOT" => DiskType::Root,
            "ISO" => DiskType::Iso,
            "DATADISK" => DiskType::DataDisk,
            _ => DiskType::Other(s),
        }
    }
}

impl From<DiskType> for String {
    fn from(t: DiskType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A network interface attached at spawn time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NicSpec {
    /// MAC address, colon separated.
    pub mac: String,

    /// Isolation URI, e.g. `vlan://261`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_uri: Option<String>,
}

/// The isolation URI names a VLAN that cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid vlan id in isolation uri '{0}'")]
pub struct InvalidVlan(pub String);

impl NicSpec {
    /// VLAN tag for this NIC's switch port.
    ///
    /// Anything other than a `vlan://<id>` URI means an untagged port, as
    /// does the `vlan://untagged` form.
    pub fn vlan(&self) -> Result<Option<u16>, InvalidVlan> {
        let Some(uri) = self.isolation_uri.as_deref() else {
            return Ok(None);
        };
        let Some(id) = uri.strip_prefix(VLAN_SCHEME) else {
            return Ok(None);
        };
        if id.eq_ignore_ascii_case("untagged") {
            return Ok(None);
        }

        match id.parse::<u16>() {
            Ok(vlan) if (1..=MAX_VLAN_ID).contains(&vlan) => Ok(Some(vlan)),
            _ => Err(InvalidVlan(uri.to_string())),
        }
    }
}

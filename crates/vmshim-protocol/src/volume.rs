//! Volume records for `CreateCommand` / `DestroyCommand`.

use serde::{Deserialize, Serialize};

/// Requested characteristics of a new volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskCharacteristics {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub volume_type: String,
}

/// Storage pool a volume is created in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoragePool {
    /// Directory backing the pool on this host.
    pub path: String,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub pool_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

/// A materialized volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub id: u64,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub volume_type: String,
    /// Backing file path.
    pub path: String,
    pub mount_point: String,
}

//! Answer envelope returned for every command.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Reply to a command.
///
/// `result` is encoded as the string `"true"` or `"false"` on the wire.
/// Command-specific fields are flattened next to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Answer {
    #[serde(serialize_with = "result_to_str", deserialize_with = "result_from_any")]
    pub result: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Answer {
    /// Successful answer with no details.
    pub fn success() -> Self {
        Self {
            result: true,
            details: None,
            fields: Map::new(),
        }
    }

    /// Failed answer carrying a human-readable reason.
    pub fn failure(details: impl Into<String>) -> Self {
        Self {
            result: false,
            details: Some(details.into()),
            fields: Map::new(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Add a command-specific field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

fn result_to_str<S: Serializer>(result: &bool, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(if *result { "true" } else { "false" })
}

fn result_from_any<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Bool(bool),
        Str(String),
    }

    match Repr::deserialize(d)? {
        Repr::Bool(b) => Ok(b),
        Repr::Str(s) => match s.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "invalid result value: {}",
                other
            ))),
        },
    }
}

/// Per-VM statistics reported by `GetVmStatsCommand`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmStatsEntry {
    #[serde(rename = "cpuUtilization")]
    pub cpu_utilization: f64,
    #[serde(rename = "networkReadKBs")]
    pub network_read_kbs: f64,
    #[serde(rename = "networkWriteKBs")]
    pub network_write_kbs: f64,
    #[serde(rename = "numCPUs")]
    pub num_cpus: u32,
    #[serde(rename = "entityType")]
    pub entity_type: String,
}

/// Host-wide statistics reported by `GetHostStatsCommand`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostStatsEntry {
    #[serde(rename = "hostId")]
    pub host_id: u64,
    #[serde(rename = "entityType")]
    pub entity_type: String,
    #[serde(rename = "cpuUtilization")]
    pub cpu_utilization: f64,
    #[serde(rename = "networkReadKBs")]
    pub network_read_kbs: f64,
    #[serde(rename = "networkWriteKBs")]
    pub network_write_kbs: f64,
    #[serde(rename = "totalMemoryKBs")]
    pub total_memory_kbs: f64,
    #[serde(rename = "freeMemoryKBs")]
    pub free_memory_kbs: f64,
}

//! Resource settings property bag.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Property names used on settings objects.
pub mod props {
    pub const ADDRESS: &str = "Address";
    pub const CONNECTION: &str = "Connection";
    pub const ELEMENT_NAME: &str = "ElementName";
    pub const INSTANCE_ID: &str = "InstanceID";
    pub const LIMIT: &str = "Limit";
    pub const PARENT: &str = "Parent";
    pub const RESERVATION: &str = "Reservation";
    pub const RESOURCE_SUBTYPE: &str = "ResourceSubType";
    pub const STATIC_MAC_ADDRESS: &str = "StaticMacAddress";
    pub const VIRTUAL_QUANTITY: &str = "VirtualQuantity";
    pub const VIRTUAL_SYSTEM_IDENTIFIERS: &str = "VirtualSystemIdentifiers";
    pub const ACCESS_VLAN: &str = "AccessVLAN";
}

/// A single property value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Property {
    Bool(bool),
    Int(u64),
    Str(String),
    List(Vec<String>),
}

impl From<bool> for Property {
    fn from(v: bool) -> Self {
        Property::Bool(v)
    }
}

impl From<u64> for Property {
    fn from(v: u64) -> Self {
        Property::Int(v)
    }
}

impl From<u32> for Property {
    fn from(v: u32) -> Self {
        Property::Int(u64::from(v))
    }
}

impl From<String> for Property {
    fn from(v: String) -> Self {
        Property::Str(v)
    }
}

impl From<&str> for Property {
    fn from(v: &str) -> Self {
        Property::Str(v.to_string())
    }
}

impl From<Vec<String>> for Property {
    fn from(v: Vec<String>) -> Self {
        Property::List(v)
    }
}

/// Settings object for a VM resource: a class name plus named properties.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Settings {
    pub class: String,
    #[serde(default)]
    properties: BTreeMap<String, Property>,
}

impl Settings {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Builder-style [`Settings::set`].
    pub fn with(mut self, key: &str, value: impl Into<Property>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Property>) {
        self.properties.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Property> {
        self.properties.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.properties.get(key) {
            Some(Property::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.properties.get(key) {
            Some(Property::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.properties.get(key) {
            Some(Property::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_list(&self, key: &str) -> Option<&[String]> {
        match self.properties.get(key) {
            Some(Property::List(v)) => Some(v),
            _ => None,
        }
    }

    pub fn properties(&self) -> impl Iterator<Item = (&str, &Property)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Resource subtype, if set.
    pub fn resource_subtype(&self) -> Option<&str> {
        self.get_str(props::RESOURCE_SUBTYPE)
    }

    /// Clone a host template into a new resource description.
    ///
    /// Every property is copied except the system identifier list, which is
    /// always replaced with a freshly generated identifier.
    pub fn clone_from_template(template: &Settings) -> Settings {
        let mut settings = Settings::new(template.class.clone());
        for (key, value) in template.properties() {
            if key == props::VIRTUAL_SYSTEM_IDENTIFIERS {
                continue;
            }
            settings.set(key, value.clone());
        }
        settings.set(props::VIRTUAL_SYSTEM_IDENTIFIERS, vec![fresh_identifier()]);
        settings
    }
}

/// A new brace-wrapped GUID, e.g. `{6f1c...}`.
pub fn fresh_identifier() -> String {
    format!("{{{}}}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_regenerates_identifiers() {
        let template = Settings::new("Msvm_SyntheticEthernetPortSettingData")
            .with(props::RESOURCE_SUBTYPE, "Microsoft Synthetic Ethernet Port")
            .with(props::ELEMENT_NAME, "Network Adapter")
            .with(
                props::VIRTUAL_SYSTEM_IDENTIFIERS,
                vec!["{00000000-0000-0000-0000-000000000000}".to_string()],
            );

        let a = Settings::clone_from_template(&template);
        let b = Settings::clone_from_template(&template);

        assert_eq!(a.class, template.class);
        assert_eq!(a.get_str(props::ELEMENT_NAME), Some("Network Adapter"));
        assert_eq!(
            a.resource_subtype(),
            Some("Microsoft Synthetic Ethernet Port")
        );

        let ida = a.get_list(props::VIRTUAL_SYSTEM_IDENTIFIERS).unwrap();
        let idb = b.get_list(props::VIRTUAL_SYSTEM_IDENTIFIERS).unwrap();
        assert_eq!(ida.len(), 1);
        assert_ne!(ida, idb);
        assert_ne!(ida[0], "{00000000-0000-0000-0000-000000000000}");
        assert!(ida[0].starts_with('{') && ida[0].ends_with('}'));
    }

    #[test]
    fn test_typed_getters() {
        let s = Settings::new("Msvm_MemorySettingData")
            .with(props::VIRTUAL_QUANTITY, 512u64)
            .with(props::STATIC_MAC_ADDRESS, true)
            .with(props::ADDRESS, "0");

        assert_eq!(s.get_u64(props::VIRTUAL_QUANTITY), Some(512));
        assert_eq!(s.get_bool(props::STATIC_MAC_ADDRESS), Some(true));
        assert_eq!(s.get_str(props::ADDRESS), Some("0"));
        assert_eq!(s.get_str(props::VIRTUAL_QUANTITY), None);
        assert!(s.get(props::PARENT).is_none());
    }

    #[test]
    fn test_settings_serde() {
        let s = Settings::new("Msvm_ProcessorSettingData")
            .with(props::LIMIT, 100000u64)
            .with(props::CONNECTION, vec!["a.vhd".to_string()]);
        let json = serde_json::to_string(&s).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}

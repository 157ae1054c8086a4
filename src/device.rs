//! Devices under test and the chip that carries them.
//!
//! The engine treats a device as opaque beyond its `id`, its `type` and the
//! JSON serialization written into each record. Additional device properties
//! (coordinates, ports, design parameters) travel in `properties` untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A device under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Identifier, unique on its chip
    pub id: String,
    /// Device type, e.g. "grating" or "ring"
    #[serde(rename = "type")]
    pub device_type: String,
    /// Free-form device description
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl Device {
    pub fn new(id: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            device_type: device_type.into(),
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    /// Serialization written into the `device` section of a record.
    pub fn as_dict(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".into(), Value::String(self.id.clone()));
        map.insert("type".into(), Value::String(self.device_type.clone()));
        for (k, v) in &self.properties {
            map.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Value::Object(map)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.device_type)
    }
}

/// The chip that carries the devices, handed to the stage mover.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chip {
    pub name: String,
    pub description_path: String,
}

impl Chip {
    pub fn new(name: impl Into<String>, description_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description_path: description_path.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_dict_keeps_identity_first() {
        let dev = Device::new("D1", "grating").with_property("left x [um]", 120.5);
        let dict = dev.as_dict();
        let keys: Vec<&str> = dict.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys, ["id", "type", "left x [um]"]);
        assert_eq!(dict["type"], "grating");
    }

    #[test]
    fn test_deserialize_with_extra_properties() {
        let dev: Device =
            serde_json::from_str(r#"{"id": "7", "type": "ring", "radius": 10}"#).unwrap();
        assert_eq!(dev.device_type, "ring");
        assert_eq!(dev.properties["radius"], 10);
        assert_eq!(dev.to_string(), "7 (ring)");
    }
}

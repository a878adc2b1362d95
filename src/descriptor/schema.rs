//! Session descriptor data model.
//!
//! A session descriptor is the consolidated YAML document describing a
//! recording session's devices, sync method and behavioral tasks. Each
//! device computer writes a partial stub with the same schema; stubs are
//! merged into the canonical file by the descriptor store.

use std::collections::BTreeMap;

use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::{rlog_warn, Result};

/// Current descriptor specification version.
pub const SPEC_VERSION: &str = "1.0.0";

/// Canonical descriptor file name under a session folder.
pub const DESCRIPTION_FILE: &str = "_experiment.description.yaml";

/// Prefix used to locate descriptor files in a session folder.
pub const DESCRIPTION_PREFIX: &str = "_experiment.description";

/// Settings for one device (camera, probe, microphone, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Settings for the session's sync method.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquisition_software: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Settings for one behavioral task protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_label: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_number"
    )]
    pub protocol_number: Option<u32>,
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "de_string_or_seq"
    )]
    pub extractors: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One entry in the descriptor's task list.
///
/// Serializes as a single-key mapping `protocol -> settings`, which is the
/// on-disk form. The list order is positionally significant.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEntry {
    pub protocol: String,
    pub settings: TaskSettings,
}

impl TaskEntry {
    pub fn new(protocol: &str, settings: TaskSettings) -> Self {
        Self {
            protocol: protocol.to_string(),
            settings,
        }
    }
}

impl Serialize for TaskEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.protocol, &self.settings)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for TaskEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let map = BTreeMap::<String, Option<TaskSettings>>::deserialize(deserializer)?;
        let mut iter = map.into_iter();
        let (protocol, settings) = iter
            .next()
            .ok_or_else(|| serde::de::Error::custom("empty task entry"))?;
        if iter.next().is_some() {
            return Err(serde::de::Error::custom(
                "task entry must contain exactly one protocol",
            ));
        }
        Ok(Self {
            protocol,
            settings: settings.unwrap_or_default(),
        })
    }
}

/// The consolidated session descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    #[serde(default = "default_version")]
    pub version: String,
    /// device kind -> device name -> settings
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub devices: BTreeMap<String, BTreeMap<String, DeviceSettings>>,
    /// sync method name -> settings; at most one entry per session
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sync: BTreeMap<String, SyncSettings>,
    /// ordered behavioral task protocols
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub procedures: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub projects: Vec<String>,
}

fn default_version() -> String {
    SPEC_VERSION.to_string()
}

impl SessionDescriptor {
    pub fn new() -> Self {
        Self {
            version: SPEC_VERSION.to_string(),
            ..Default::default()
        }
    }

    /// Check whether the descriptor carries any content besides the version.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
            && self.sync.is_empty()
            && self.tasks.is_empty()
            && self.procedures.is_empty()
            && self.projects.is_empty()
    }

    /// Deserialize from a YAML value, upgrading older schema versions first.
    pub fn from_value(mut value: Value) -> Result<Self> {
        patch_document(&mut value);
        Ok(serde_yaml::from_value(value)?)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_yaml::to_value(self)?)
    }
}

/// Parse a loose version string into a comparable semver version.
///
/// Older files carry bare strings like "0" or "0.1"; missing components
/// default to zero.
fn parse_version(s: &str) -> semver::Version {
    let mut parts = s.split('.').map(|p| p.trim().parse::<u64>().unwrap_or(0));
    semver::Version::new(
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

/// Upgrade older descriptor documents in memory to the current spec version.
///
/// The file itself is never rewritten on read, and a descriptor is never
/// downgraded on write.
pub fn patch_document(value: &mut Value) {
    let Some(map) = value.as_mapping_mut() else {
        return;
    };
    let version_key = Value::from("version");
    let current = map
        .get(&version_key)
        .and_then(Value::as_str)
        .unwrap_or("0")
        .to_string();
    if current == SPEC_VERSION {
        return;
    }
    let v = parse_version(&current);
    let spec = parse_version(SPEC_VERSION);
    if v > spec {
        rlog_warn!(
            "Descriptor file generated by more recent code (version {})",
            current
        );
    } else if v <= parse_version("0.1.0") {
        // Versions up to 0.1.0 stored tasks as a mapping; convert to an
        // ordered list of single-key maps.
        let tasks_key = Value::from("tasks");
        if let Some(Value::Mapping(tasks)) = map.get(&tasks_key).cloned() {
            let list: Vec<Value> = tasks
                .into_iter()
                .map(|(k, v)| {
                    let mut single = serde_yaml::Mapping::new();
                    single.insert(k, v);
                    Value::Mapping(single)
                })
                .collect();
            map.insert(tasks_key, Value::Sequence(list));
        }
    }
    map.insert(version_key, Value::from(SPEC_VERSION));
}

fn de_opt_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<u32>, D::Error> {
    // Older files wrote protocol numbers as strings.
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|n| Some(n as u32))
            .ok_or_else(|| serde::de::Error::custom("protocol_number must be non-negative")),
        Some(Value::String(s)) => s
            .parse::<u32>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom("invalid protocol_number string")),
        Some(other) => Err(serde::de::Error::custom(format!(
            "invalid protocol_number: {:?}",
            other
        ))),
    }
}

fn de_string_or_seq<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<String>, D::Error> {
    // A single extractor may be written as a bare string.
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s]),
        Some(Value::Sequence(seq)) => seq
            .into_iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| serde::de::Error::custom("extractor names must be strings"))
            })
            .collect(),
        Some(other) => Err(serde::de::Error::custom(format!(
            "invalid extractors field: {:?}",
            other
        ))),
    }
}

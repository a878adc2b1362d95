//! Read-only accessors over a [`SessionDescriptor`].
//!
//! These answer the questions the graph builder and acquisition tooling
//! keep asking: which sync device, which collections, which task
//! protocols, which cameras. All are pure functions of the descriptor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_yaml::Value;

use crate::descriptor::schema::{SessionDescriptor, SyncSettings};

/// Names of the configured cameras, in stable (sorted) order.
pub fn cameras(descriptor: &SessionDescriptor) -> Vec<&str> {
    descriptor
        .devices
        .get("cameras")
        .map(|cams| cams.keys().map(String::as_str).collect())
        .unwrap_or_default()
}

/// The sync method name (e.g. "nidq", "bpod"), if one is configured.
pub fn sync_label(descriptor: &SessionDescriptor) -> Option<&str> {
    descriptor.sync.keys().next().map(String::as_str)
}

/// The sync method and its settings.
pub fn sync(descriptor: &SessionDescriptor) -> Option<(&str, &SyncSettings)> {
    descriptor
        .sync
        .iter()
        .next()
        .map(|(k, v)| (k.as_str(), v))
}

/// Collection holding the sync device's raw data.
pub fn sync_collection(descriptor: &SessionDescriptor) -> Option<&str> {
    sync(descriptor).and_then(|(_, s)| s.collection.as_deref())
}

/// File extension of the sync recording (e.g. "bin", "npy").
pub fn sync_extension(descriptor: &SessionDescriptor) -> Option<&str> {
    sync(descriptor).and_then(|(_, s)| s.extension.as_deref())
}

/// Acquisition-software namespace of the sync device, when one applies.
pub fn sync_namespace(descriptor: &SessionDescriptor) -> Option<&str> {
    sync(descriptor).and_then(|(_, s)| s.acquisition_software.as_deref())
}

/// All task protocol names in acquisition order.
pub fn task_protocols(descriptor: &SessionDescriptor) -> Vec<&str> {
    descriptor
        .tasks
        .iter()
        .map(|t| t.protocol.as_str())
        .collect()
}

/// Collection for the first task matching `protocol`.
pub fn task_collection<'a>(
    descriptor: &'a SessionDescriptor,
    protocol: &str,
) -> Option<&'a str> {
    descriptor
        .tasks
        .iter()
        .find(|t| t.protocol == protocol)
        .and_then(|t| t.settings.collection.as_deref())
}

/// Inverse lookup: the protocol acquired into `collection`.
pub fn task_protocol<'a>(
    descriptor: &'a SessionDescriptor,
    collection: &str,
) -> Option<&'a str> {
    descriptor
        .tasks
        .iter()
        .find(|t| t.settings.collection.as_deref() == Some(collection))
        .map(|t| t.protocol.as_str())
}

/// The declared protocol number of the first task matching `protocol`.
pub fn task_protocol_number(
    descriptor: &SessionDescriptor,
    protocol: &str,
) -> Option<u32> {
    descriptor
        .tasks
        .iter()
        .find(|t| t.protocol == protocol)
        .and_then(|t| t.settings.protocol_number)
}

/// Every collection in the descriptor, keyed by the device, sync method
/// or task protocol that owns it. Walks the full document so
/// device-specific nesting is covered without enumerating device kinds;
/// the owner is the mapping key whose settings carry the `collection`
/// field.
pub fn collections(descriptor: &SessionDescriptor) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Ok(value) = descriptor.to_value() {
        harvest_collections(&value, &mut out);
    }
    out
}

fn harvest_collections(value: &Value, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Mapping(map) => {
            for (key, val) in map {
                if let (Some(owner), Value::Mapping(settings)) = (key.as_str(), val) {
                    if let Some(collection) =
                        settings.get("collection").and_then(Value::as_str)
                    {
                        out.insert(owner.to_string(), collection.to_string());
                    }
                }
                harvest_collections(val, out);
            }
        }
        Value::Sequence(seq) => {
            for val in seq {
                harvest_collections(val, out);
            }
        }
        _ => {}
    }
}

/// Whether the named camera's recording is already compressed on disk.
pub fn video_compressed(descriptor: &SessionDescriptor, camera: &str) -> bool {
    descriptor
        .devices
        .get("cameras")
        .and_then(|cams| cams.get(camera))
        .and_then(|cam| cam.compressed)
        .unwrap_or(false)
}

/// Path of a device stub descriptor under the session's `_devices` folder.
pub fn stub_path(session_path: &Path, device_id: &str) -> PathBuf {
    session_path
        .join("_devices")
        .join(format!("{device_id}.yaml"))
}

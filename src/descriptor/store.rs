//! Reading, writing and merging session descriptors.
//!
//! Each device computer writes a partial stub descriptor; the store merges
//! stubs into the canonical `_experiment.description.yaml` under the
//! session folder, guarded by the lock-file protocol in [`crate::descriptor::lock`].

use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::Value;

use crate::config::LockConfig;
use crate::descriptor::lock;
use crate::descriptor::schema::{
    SessionDescriptor, DESCRIPTION_FILE, DESCRIPTION_PREFIX,
};
use crate::{rlog_debug, rlog_warn, Error, Result};

/// Locate the descriptor file for a session folder or file path.
///
/// Directories are searched for a `_experiment.description*` file; file
/// paths are used directly when they exist.
pub fn locate(path: &Path) -> Option<PathBuf> {
    if path.is_dir() {
        let entries = fs::read_dir(path).ok()?;
        let mut found: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(DESCRIPTION_PREFIX))
            })
            .collect();
        found.sort();
        found.into_iter().next()
    } else if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

/// Load a descriptor from a session folder or descriptor file path.
///
/// Returns `Ok(None)` if no descriptor file exists. An empty or
/// unparseable file yields an empty descriptor (logged), mirroring how a
/// partially written stub must not poison aggregation. Older schema
/// versions are upgraded in memory without rewriting the file.
pub fn read(path: &Path) -> Result<Option<SessionDescriptor>> {
    let Some(file) = locate(path) else {
        rlog_debug!("descriptor not found: {}", path.display());
        return Ok(None);
    };
    let contents = fs::read_to_string(&file)?;
    match serde_yaml::from_str::<Value>(&contents) {
        Ok(Value::Null) => Ok(Some(SessionDescriptor::new())),
        Ok(value) => Ok(Some(SessionDescriptor::from_value(value)?)),
        Err(e) => {
            rlog_warn!("unparseable descriptor {}: {}", file.display(), e);
            Ok(Some(SessionDescriptor::new()))
        }
    }
}

/// Serialize a descriptor, creating parent directories as needed.
///
/// The write is atomic: content goes to a sibling temp file which is then
/// renamed over the target.
pub fn write(path: &Path, descriptor: &SessionDescriptor) -> Result<()> {
    let target = if path.is_dir() || path.extension().is_none() {
        path.join(DESCRIPTION_FILE)
    } else {
        path.to_path_buf()
    };
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = target.with_extension("yaml.tmp");
    fs::write(&tmp, serde_yaml::to_string(descriptor)?)?;
    fs::rename(&tmp, &target)?;
    rlog_debug!("descriptor written to {}", target.display());
    Ok(())
}

/// Deep-merge `incoming` into `base`.
///
/// Rules per field:
/// - `sync` present in both must be identical, otherwise this is a fatal
///   configuration error (a session has exactly one sync device).
/// - `tasks` are concatenated preserving order (positionally significant).
/// - `procedures`/`projects` are unioned, deduplicated, base order first.
/// - `devices` merge key-wise; an incoming device name wins over base.
/// - scalar fields (version) take the incoming value.
pub fn merge(
    base: &SessionDescriptor,
    incoming: &SessionDescriptor,
) -> Result<SessionDescriptor> {
    let mut out = base.clone();

    for (method, settings) in &incoming.sync {
        match out.sync.get(method) {
            Some(existing) if existing != settings => {
                return Err(Error::Config("multiple sync devices".to_string()));
            }
            _ => {}
        }
        if !out.sync.is_empty() && !out.sync.contains_key(method) {
            return Err(Error::Config("multiple sync devices".to_string()));
        }
        out.sync.insert(method.clone(), settings.clone());
    }

    out.tasks.extend(incoming.tasks.iter().cloned());

    union_into(&mut out.procedures, &incoming.procedures);
    union_into(&mut out.projects, &incoming.projects);

    for (kind, devices) in &incoming.devices {
        let slot = out.devices.entry(kind.clone()).or_default();
        for (name, settings) in devices {
            slot.insert(name.clone(), settings.clone());
        }
    }

    out.version = incoming.version.clone();
    Ok(out)
}

fn union_into(base: &mut Vec<String>, incoming: &[String]) {
    for item in incoming {
        if !base.contains(item) {
            base.push(item.clone());
        }
    }
}

/// Merge a device stub into the shared target descriptor under the lock
/// protocol.
///
/// Returns the aggregated descriptor, or `None` when the stub was empty or
/// unreadable (logged and ignored, target untouched). A merge conflict
/// aborts before the target is written; the previous contents survive and
/// the lock is released. When `unlink` is set the consumed stub is
/// deleted, and its `_devices` folder removed once emptied.
pub fn aggregate_device(
    stub_path: &Path,
    target_path: &Path,
    unlink: bool,
    lock_config: &LockConfig,
) -> Result<Option<SessionDescriptor>> {
    let stub = match read(stub_path)? {
        Some(stub) if !stub.is_empty() => stub,
        _ => {
            rlog_warn!("empty device file \"{}\"", stub_path.display());
            return Ok(None);
        }
    };

    let mut guard = lock::acquire(
        target_path,
        lock_config,
        stub_path.to_str(),
    )?;

    let result = (|| -> Result<SessionDescriptor> {
        let base = read(target_path)?.unwrap_or_default();
        let merged = merge(&base, &stub)?;
        write(target_path, &merged)?;
        Ok(merged)
    })();

    guard.release()?;
    let merged = result?;

    if unlink {
        fs::remove_file(stub_path)?;
        if let Some(stub_folder) = stub_path.parent().filter(|p| {
            p.file_name().and_then(|n| n.to_str()) == Some("_devices")
        }) {
            let empty = fs::read_dir(stub_folder)
                .map(|mut d| d.next().is_none())
                .unwrap_or(false);
            if empty {
                let _ = fs::remove_dir(stub_folder);
            }
        }
    }

    Ok(Some(merged))
}

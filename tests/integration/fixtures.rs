//! Test fixtures for integration tests.
//!
//! Provides helpers for building session folders on disk with
//! descriptors, device stubs and fake raw data files.

use std::path::PathBuf;

use tempfile::TempDir;

use rigpipe::descriptor::{store, SessionDescriptor};

/// A temporary session folder laid out like a real acquisition.
pub struct TestSession {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestSession {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("subject/2024-03-01/001");
        std::fs::create_dir_all(&path).expect("Failed to create session folder");
        Self { temp_dir, path }
    }

    /// Write the session's main descriptor from YAML.
    pub fn write_descriptor(&self, yaml: &str) {
        let descriptor: SessionDescriptor =
            serde_yaml::from_str(yaml).expect("Invalid fixture YAML");
        store::write(&self.path, &descriptor).expect("Failed to write descriptor");
    }

    /// Write a device stub under `_devices/`.
    pub fn write_stub(&self, device_id: &str, yaml: &str) -> PathBuf {
        let descriptor: SessionDescriptor =
            serde_yaml::from_str(yaml).expect("Invalid fixture YAML");
        let stub = self.path.join("_devices").join(format!("{device_id}.yaml"));
        store::write(&stub, &descriptor).expect("Failed to write stub");
        stub
    }

    /// Create a non-empty raw data file in a collection.
    pub fn write_raw_file(&self, collection: &str, name: &str) {
        let dir = self.path.join(collection);
        std::fs::create_dir_all(&dir).expect("Failed to create collection");
        std::fs::write(dir.join(name), "raw").expect("Failed to write raw file");
    }

    pub fn descriptor_path(&self) -> PathBuf {
        self.path.join(rigpipe::descriptor::DESCRIPTION_FILE)
    }
}

/// A training rig descriptor: bpod sync, one camera, one task protocol.
pub const TRAINING_YAML: &str = r#"
version: 1.0.0
devices:
  cameras:
    left:
      collection: raw_video_data
      sync_label: audio
  microphone:
    microphone:
      collection: raw_behavior_data
sync:
  bpod:
    collection: raw_behavior_data
tasks:
  - trainingChoiceWorld:
      collection: raw_behavior_data
      sync_label: bpod
procedures:
  - Behavior training/tasks
"#;

/// The behaviour-rig half of an ephys session, as its stub.
pub const BEHAVIOUR_STUB_YAML: &str = r#"
version: 1.0.0
devices:
  microphone:
    microphone:
      collection: raw_behavior_data
tasks:
  - ephysChoiceWorld:
      collection: raw_behavior_data
      sync_label: bpod
procedures:
  - Ephys recording with acute probe(s)
"#;

/// The ephys-rig half of an ephys session, as its stub.
pub const EPHYS_STUB_YAML: &str = r#"
version: 1.0.0
devices:
  neuropixel:
    probe00:
      collection: raw_ephys_data/probe00
      sync_label: imec_sync
sync:
  nidq:
    collection: raw_ephys_data
    extension: bin
    acquisition_software: spikeglx
projects:
  - brainwide_map
"#;

//! Task kind registry: symbolic names to node constructors.
//!
//! The graph builder never hardcodes how a task node is assembled; it
//! asks the registry by name. Extractor names from a descriptor resolve
//! in three steps: exact match, then the name suffixed with the
//! capitalized sync label (so `TrialsChoiceWorld` on a bpod rig finds
//! `TrialsChoiceWorldBpod`), then any plugged-in external registries.
//! An unresolvable name is a configuration error raised before anything
//! runs.

use std::collections::HashMap;
use std::sync::Arc;

use crate::pipeline::node::{FileSignature, TaskNode};
use crate::{Error, Result};

/// Arguments shared by every node constructor.
#[derive(Debug, Clone, Default)]
pub struct TaskArgs {
    /// Final node name, unique in the graph (e.g. `EphysPulses_probe00`).
    pub name: String,
    /// Collection the task reads from or writes to.
    pub collection: Option<String>,
    /// Collection of the session's sync recording, when one exists.
    pub sync_collection: Option<String>,
}

impl TaskArgs {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn in_collection(name: &str, collection: &str) -> Self {
        Self {
            name: name.to_string(),
            collection: Some(collection.to_string()),
            ..Default::default()
        }
    }
}

pub type TaskCtor = Arc<dyn Fn(&TaskArgs) -> TaskNode + Send + Sync>;

/// Plug-in point for task kinds defined outside this crate.
pub trait ExternalRegistry: Send + Sync {
    fn resolve(&self, kind: &str) -> Option<TaskCtor>;
}

pub struct TaskRegistry {
    ctors: HashMap<String, TaskCtor>,
    external: Vec<Box<dyn ExternalRegistry>>,
}

impl TaskRegistry {
    pub fn empty() -> Self {
        Self {
            ctors: HashMap::new(),
            external: Vec::new(),
        }
    }

    /// Registry pre-populated with the built-in task kinds.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        register_builtins(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, kind: &str, ctor: F)
    where
        F: Fn(&TaskArgs) -> TaskNode + Send + Sync + 'static,
    {
        self.ctors.insert(kind.to_string(), Arc::new(ctor));
    }

    pub fn add_external(&mut self, external: Box<dyn ExternalRegistry>) {
        self.external.push(external);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.ctors.contains_key(kind)
    }

    /// Look up a kind without the sync-suffix fallback.
    pub fn get(&self, kind: &str) -> Option<TaskCtor> {
        self.ctors.get(kind).cloned()
    }

    /// Resolve an extractor name against the sync label of the session.
    pub fn resolve(&self, kind: &str, sync: Option<&str>) -> Result<TaskCtor> {
        if let Some(ctor) = self.ctors.get(kind) {
            return Ok(ctor.clone());
        }
        if let Some(sync) = sync {
            let suffixed = format!("{}{}", kind, capitalize(sync));
            if let Some(ctor) = self.ctors.get(&suffixed) {
                return Ok(ctor.clone());
            }
        }
        for external in &self.external {
            if let Some(ctor) = external.resolve(kind) {
                return Ok(ctor);
            }
        }
        Err(Error::Config(format!("unknown task kind: {}", kind)))
    }

    /// Build a node for `kind` with the sync-suffix fallback applied.
    pub fn build(&self, kind: &str, sync: Option<&str>, args: &TaskArgs) -> Result<TaskNode> {
        Ok(self.resolve(kind, sync)?(args))
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("kinds", &self.ctors.len())
            .field("external", &self.external.len())
            .finish()
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// A constructor producing a bare node with no file signatures.
fn plain(args: &TaskArgs) -> TaskNode {
    TaskNode::new(&args.name)
}

/// A constructor whose node requires outputs matching `patterns` in the
/// args' collection (falling back to the session root).
fn with_outputs(patterns: &'static [&'static str]) -> impl Fn(&TaskArgs) -> TaskNode {
    move |args: &TaskArgs| {
        let collection = args.collection.clone().unwrap_or_default();
        TaskNode::new(&args.name).with_outputs(
            patterns
                .iter()
                .map(|p| FileSignature::required(p, &collection))
                .collect(),
        )
    }
}

fn register_builtins(registry: &mut TaskRegistry) {
    // Registration anchors carry no file contract of their own.
    for kind in [
        "SessionRegisterRaw",
        "SyncRegisterRaw",
        "TrialRegisterRaw",
        "EphysRegisterRaw",
        "VideoRegisterRaw",
        "WidefieldRegisterRaw",
        "PhotometryRegisterRaw",
        "MesoscopeRegisterSnapshots",
    ] {
        registry.register(kind, plain);
    }

    registry.register("SyncMtscomp", with_outputs(&["*.cbin"]));
    registry.register("SyncPulses", with_outputs(&["_*_sync.times*.npy"]));
    // Pulse times land next to the sync recording when the session has a
    // dedicated sync collection.
    registry.register("EphysPulses", |args: &TaskArgs| {
        let collection = args
            .sync_collection
            .clone()
            .or_else(|| args.collection.clone())
            .unwrap_or_default();
        TaskNode::new(&args.name).with_outputs(vec![FileSignature::required(
            "_*_sync.times*.npy",
            &collection,
        )])
    });

    for kind in ["EphysCompressNP1", "EphysCompressNP21", "EphysCompressNP24"] {
        registry.register(kind, with_outputs(&["*.cbin"]));
    }
    registry.register("SpikeSorting", with_outputs(&["spike_sorting_*.log"]));
    registry.register("EphysRawQC", plain);
    registry.register("EphysCellQC", plain);

    registry.register("VideoCompress", with_outputs(&["_*_*Camera.raw.mp4"]));
    registry.register("VideoConvert", with_outputs(&["_*_*Camera.raw.mp4"]));
    for kind in ["VideoSyncQcBpod", "VideoSyncQcNidq", "VideoSyncQcCamlog"] {
        registry.register(kind, plain);
    }
    registry.register("PoseEstimation", plain);
    registry.register("PosePostProcessing", plain);

    registry.register("AudioSync", plain);
    registry.register("AudioCompress", with_outputs(&["_*_audioData.raw.flac"]));

    // Behavior extractors, per sync flavor.
    registry.register("HabituationTrialsBpod", with_outputs(&["_*_trials.table.pqt"]));
    registry.register("ChoiceWorldTrialsBpod", with_outputs(&["_*_trials.table.pqt"]));
    registry.register("ChoiceWorldTrialsNidq", with_outputs(&["_*_trials.table.pqt"]));
    registry.register("HabituationRegisterRaw", plain);
    registry.register("PassiveRegisterRaw", plain);
    registry.register("PassiveTaskBpod", plain);
    registry.register("PassiveTaskNidq", plain);
    registry.register("TrainingStatus", plain);

    registry.register("WidefieldCompress", with_outputs(&["*.mov"]));
    registry.register("WidefieldPreprocess", plain);
    registry.register("WidefieldSync", plain);
    registry.register("WidefieldFOV", plain);

    registry.register("MesoscopePreprocess", plain);
    registry.register("MesoscopeFOV", plain);
    registry.register("MesoscopeSync", plain);
    registry.register("MesoscopeCompress", plain);

    registry.register("FibrePhotometryPreprocess", plain);
}

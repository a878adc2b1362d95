//! Build a task graph from a session descriptor.
//!
//! The descriptor says what was acquired; this module turns that into a
//! frozen dependency graph. Construction is table-driven for the sync
//! device and per-device-kind for everything else, so the shape of a
//! pipeline is decided entirely up front and misconfiguration surfaces
//! before any task runs.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::descriptor::query;
use crate::descriptor::schema::SessionDescriptor;
use crate::pipeline::graph::TaskGraph;
use crate::pipeline::registry::{TaskArgs, TaskRegistry};
use crate::{rlog_warn, Error, Result};

/// Root task registering the session folder itself. Always present.
pub const ROOT_TASK: &str = "SessionRegisterRaw";

/// How the sync device maps onto graph structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncPlan {
    /// Dedicated DAQ recording: register the raw sync files, then extract
    /// pulse trains.
    RegisterAndPulses,
    /// Register only; pulse extraction happens elsewhere.
    RegisterOnly,
    /// Compress the recording in place of registration, then extract pulses.
    CompressAndPulses,
    /// No sync tasks at all (the task software is its own clock).
    NoTasks,
}

/// One row of the sync dispatch table. `None` fields match anything.
struct SyncMatcher {
    method: Option<&'static str>,
    collection: Option<&'static str>,
    namespace: Option<&'static str>,
}

impl SyncMatcher {
    fn matches(&self, method: &str, collection: Option<&str>, namespace: Option<&str>) -> bool {
        self.method.map_or(true, |m| m == method)
            && self.collection.map_or(true, |c| Some(c) == collection)
            && self.namespace.map_or(true, |n| Some(n) == namespace)
    }
}

/// Ordered dispatch table; the first matching row wins.
const SYNC_DISPATCH: &[(SyncMatcher, SyncPlan)] = &[
    (
        SyncMatcher {
            method: Some("nidq"),
            collection: Some("raw_ephys_data"),
            namespace: None,
        },
        SyncPlan::RegisterAndPulses,
    ),
    (
        SyncMatcher {
            method: None,
            collection: None,
            namespace: Some("timeline"),
        },
        SyncPlan::RegisterOnly,
    ),
    (
        SyncMatcher {
            method: Some("nidq"),
            collection: None,
            namespace: None,
        },
        SyncPlan::CompressAndPulses,
    ),
    (
        SyncMatcher {
            method: Some("tdms"),
            collection: None,
            namespace: None,
        },
        SyncPlan::RegisterOnly,
    ),
    (
        SyncMatcher {
            method: Some("bpod"),
            collection: None,
            namespace: None,
        },
        SyncPlan::NoTasks,
    ),
];

/// Neuropixel probe hardware generation, decided from the recording
/// metadata. Determines the compression task and per-shank fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeGeneration {
    /// 3A probe; the sync signal is recorded on the probe itself.
    Np3A,
    Np1,
    Np21,
    Np24 { shanks: u32 },
}

/// Classify a probe from a key=value metadata file in its collection.
///
/// Looks for the first `*.meta` file and reads `imDatPrb_type` (an
/// `imProbeOpt` key marks a 3A probe, `nShanks` sizes the 2.4 fan-out).
/// Anything unreadable or unrecognized falls back to the NP1 baseline.
pub fn probe_generation(session_path: &Path, collection: &str) -> ProbeGeneration {
    let Some(meta) = find_meta_file(&session_path.join(collection)) else {
        return ProbeGeneration::Np1;
    };
    if meta_value(&meta, "imProbeOpt").is_some() {
        return ProbeGeneration::Np3A;
    }
    let probe_type = meta_value(&meta, "imDatPrb_type")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);
    match probe_type {
        21 => ProbeGeneration::Np21,
        24 => {
            let shanks = meta_value(&meta, "nShanks")
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(1);
            // A single-shank 2.4 behaves like a 2.1 for pipeline purposes.
            if shanks > 1 {
                ProbeGeneration::Np24 { shanks }
            } else {
                ProbeGeneration::Np21
            }
        }
        _ => ProbeGeneration::Np1,
    }
}

fn find_meta_file(dir: &Path) -> Option<String> {
    let entries = fs::read_dir(dir).ok()?;
    let mut metas: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("meta"))
        .collect();
    metas.sort();
    fs::read_to_string(metas.first()?).ok()
}

fn meta_value<'a>(contents: &'a str, key: &str) -> Option<&'a str> {
    contents.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k.trim() == key).then(|| v.trim())
    })
}

fn task_data_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^raw_task_data_(\d{2})$").unwrap())
}

/// Build the full task graph for a session from its descriptor.
pub fn build_pipeline(
    session_path: &Path,
    descriptor: &SessionDescriptor,
    registry: &TaskRegistry,
) -> Result<TaskGraph> {
    let mut graph = TaskGraph::new();
    graph.add_task(registry.build(ROOT_TASK, None, &TaskArgs::named(ROOT_TASK))?)?;

    let sync = query::sync_label(descriptor);
    let sync_tasks = add_sync_tasks(&mut graph, descriptor, registry)?;

    add_behavior_tasks(&mut graph, descriptor, registry, sync, &sync_tasks)?;
    add_probe_tasks(&mut graph, session_path, descriptor, registry, &sync_tasks)?;
    add_camera_tasks(&mut graph, descriptor, registry, sync, &sync_tasks)?;
    add_microphone_tasks(&mut graph, descriptor, registry, sync)?;
    add_widefield_tasks(&mut graph, descriptor, registry, &sync_tasks)?;
    add_mesoscope_tasks(&mut graph, descriptor, registry)?;
    add_photometry_tasks(&mut graph, descriptor, registry, &sync_tasks)?;

    graph.assign_levels()?;
    Ok(graph)
}

/// Emit the sync subgraph per the dispatch table. Returns the names of
/// the pulse task(s) downstream consumers must depend on.
fn add_sync_tasks(
    graph: &mut TaskGraph,
    descriptor: &SessionDescriptor,
    registry: &TaskRegistry,
) -> Result<Vec<String>> {
    let Some((method, settings)) = query::sync(descriptor) else {
        return Ok(Vec::new());
    };
    let collection = settings.collection.as_deref();
    let namespace = settings.acquisition_software.as_deref();

    let plan = SYNC_DISPATCH
        .iter()
        .find(|(matcher, _)| matcher.matches(method, collection, namespace))
        .map(|(_, plan)| *plan)
        .ok_or_else(|| Error::Config(format!("unsupported sync device: {}", method)))?;

    let collection = collection.unwrap_or_default();
    let mut pulse_tasks = Vec::new();
    match plan {
        SyncPlan::RegisterAndPulses | SyncPlan::CompressAndPulses => {
            let register_kind = if plan == SyncPlan::RegisterAndPulses {
                "SyncRegisterRaw"
            } else {
                "SyncMtscomp"
            };
            graph.add_task(registry.build(
                register_kind,
                None,
                &TaskArgs::in_collection("SyncRegisterRaw", collection),
            )?)?;
            let pulses = format!("SyncPulses_{}", method);
            graph.add_task(registry.build(
                "SyncPulses",
                None,
                &TaskArgs::in_collection(&pulses, collection),
            )?)?;
            graph.add_parent("SyncRegisterRaw", &pulses)?;
            pulse_tasks.push(pulses);
        }
        SyncPlan::RegisterOnly => {
            graph.add_task(registry.build(
                "SyncRegisterRaw",
                None,
                &TaskArgs::in_collection("SyncRegisterRaw", collection),
            )?)?;
        }
        SyncPlan::NoTasks => {}
    }
    Ok(pulse_tasks)
}

fn add_behavior_tasks(
    graph: &mut TaskGraph,
    descriptor: &SessionDescriptor,
    registry: &TaskRegistry,
    sync: Option<&str>,
    sync_tasks: &[String],
) -> Result<()> {
    for (i, entry) in descriptor.tasks.iter().enumerate() {
        let protocol = &entry.protocol;
        let collection = entry
            .settings
            .collection
            .clone()
            .unwrap_or_else(|| format!("raw_task_data_{:02}", i));

        // Protocol list order is authoritative; numbered collections must
        // agree with it.
        if let Some(caps) = task_data_re().captures(&collection) {
            let number: usize = caps[1].parse().unwrap_or(0);
            if number != i {
                rlog_warn!(
                    "number in collection {} does not match task order {}",
                    collection,
                    i
                );
            }
        }

        if entry.settings.extractors.is_empty() {
            add_legacy_behavior(graph, registry, sync, sync_tasks, protocol, &collection, i)?;
        } else {
            add_extractor_chain(
                graph,
                registry,
                sync,
                sync_tasks,
                &entry.settings.extractors,
                &collection,
                i,
            )?;
        }
    }
    Ok(())
}

/// An explicitly declared extractor chain: each link is parented on the
/// previous one, and the second link additionally on the sync tasks.
fn add_extractor_chain(
    graph: &mut TaskGraph,
    registry: &TaskRegistry,
    sync: Option<&str>,
    sync_tasks: &[String],
    extractors: &[String],
    collection: &str,
    index: usize,
) -> Result<()> {
    let mut previous: Option<String> = None;
    for (j, extractor) in extractors.iter().enumerate() {
        // An extractor hardwired to one sync flavor cannot run under
        // another.
        for sync_option in ["nidq", "bpod"] {
            if extractor.to_lowercase().contains(sync_option) && sync != Some(sync_option) {
                return Err(Error::Config(format!(
                    "extractor {} and sync {} do not match",
                    extractor,
                    sync.unwrap_or("none")
                )));
            }
        }
        let name = format!("{}_{:02}", extractor, index);
        graph.add_task(registry.build(
            extractor,
            sync,
            &TaskArgs::in_collection(&name, collection),
        )?)?;
        if let Some(prev) = &previous {
            graph.add_parent(prev, &name)?;
        }
        // The second link is conventionally the trials extractor, which
        // needs the sync pulses.
        if j == 1 {
            for sync_task in sync_tasks {
                graph.add_parent(sync_task, &name)?;
            }
        }
        previous = Some(name);
    }
    Ok(())
}

/// Sessions predating explicit extractor lists: choose registration and
/// trials kinds from the protocol name and sync method.
fn add_legacy_behavior(
    graph: &mut TaskGraph,
    registry: &TaskRegistry,
    sync: Option<&str>,
    sync_tasks: &[String],
    protocol: &str,
    collection: &str,
    index: usize,
) -> Result<()> {
    let (register_kind, trials_kind, compute_status) = if protocol.contains("habituation") {
        ("HabituationRegisterRaw", "HabituationTrialsBpod", false)
    } else if protocol.contains("passiveChoiceWorld") {
        ("PassiveRegisterRaw", "PassiveTask", false)
    } else if sync == Some("bpod") {
        ("TrialRegisterRaw", "ChoiceWorldTrialsBpod", true)
    } else if sync == Some("nidq") {
        ("TrialRegisterRaw", "ChoiceWorldTrialsNidq", true)
    } else {
        return Err(Error::Config(format!(
            "no behavior pipeline for protocol {} with sync {}",
            protocol,
            sync.unwrap_or("none")
        )));
    };

    let register = format!("RegisterRaw_{}_{:02}", protocol, index);
    graph.add_task(registry.build(
        register_kind,
        sync,
        &TaskArgs::in_collection(&register, collection),
    )?)?;

    let trials = format!("Trials_{}_{:02}", protocol, index);
    graph.add_task(registry.build(
        trials_kind,
        sync,
        &TaskArgs::in_collection(&trials, collection),
    )?)?;
    graph.add_parent(&register, &trials)?;
    for sync_task in sync_tasks {
        graph.add_parent(sync_task, &trials)?;
    }

    if compute_status {
        let status = format!("TrainingStatus_{}_{:02}", protocol, index);
        graph.add_task(registry.build(
            "TrainingStatus",
            sync,
            &TaskArgs::in_collection(&status, collection),
        )?)?;
        graph.add_parent(&trials, &status)?;
    }
    Ok(())
}

fn add_probe_tasks(
    graph: &mut TaskGraph,
    session_path: &Path,
    descriptor: &SessionDescriptor,
    registry: &TaskRegistry,
    sync_tasks: &[String],
) -> Result<()> {
    let Some(probes) = descriptor.devices.get("neuropixel") else {
        return Ok(());
    };
    graph.add_task(registry.build(
        "EphysRegisterRaw",
        None,
        &TaskArgs::named("EphysRegisterRaw"),
    )?)?;

    // (probe name, compression task) pairs; NP2.4 fans out per shank.
    let mut all_probes: Vec<(String, String)> = Vec::new();
    let mut generations: Vec<ProbeGeneration> = Vec::new();
    for (pname, info) in probes {
        let collection = info.collection.clone().unwrap_or_default();
        let generation = probe_generation(session_path, &collection);
        generations.push(generation);
        let compress_kind = match generation {
            ProbeGeneration::Np3A | ProbeGeneration::Np1 => "EphysCompressNP1",
            ProbeGeneration::Np21 => "EphysCompressNP21",
            ProbeGeneration::Np24 { .. } => "EphysCompressNP24",
        };
        let compress = format!("{}_{}", compress_kind, pname);
        graph.add_task(registry.build(
            compress_kind,
            None,
            &TaskArgs::in_collection(&compress, &collection),
        )?)?;

        match generation {
            ProbeGeneration::Np24 { shanks } => {
                for shank in 0..shanks {
                    let letter = (b'a' + shank as u8) as char;
                    all_probes.push((format!("{}{}", pname, letter), compress.clone()));
                }
            }
            _ => all_probes.push((pname.clone(), compress.clone())),
        }
    }

    // 3A rigs record the sync on every probe, so a single pulse
    // extraction serves the whole recording.
    let shared_pulses = !all_probes.is_empty()
        && generations.iter().all(|g| *g == ProbeGeneration::Np3A);
    if shared_pulses {
        let pulse_args = TaskArgs {
            name: "EphysPulses".to_string(),
            collection: query::sync_collection(descriptor).map(str::to_string),
            sync_collection: query::sync_collection(descriptor).map(str::to_string),
        };
        graph.add_task(registry.build("EphysPulses", None, &pulse_args)?)?;
        for (_, compress) in &all_probes {
            graph.add_parent(compress, "EphysPulses")?;
        }
        for sync_task in sync_tasks {
            graph.add_parent(sync_task, "EphysPulses")?;
        }
    }

    for (pname, compress) in &all_probes {
        // Shank names embed the parent probe's collection.
        let base = pname.get(..7).unwrap_or(pname);
        let collection = probes
            .iter()
            .find(|(name, _)| name.as_str() == base)
            .and_then(|(_, info)| info.collection.clone())
            .unwrap_or_default();

        let pulses = if shared_pulses {
            "EphysPulses".to_string()
        } else {
            let pulses = format!("EphysPulses_{}", pname);
            let pulse_args = TaskArgs {
                name: pulses.clone(),
                collection: Some(collection.clone()),
                sync_collection: query::sync_collection(descriptor).map(str::to_string),
            };
            graph.add_task(registry.build("EphysPulses", None, &pulse_args)?)?;
            graph.add_parent(compress, &pulses)?;
            for sync_task in sync_tasks {
                graph.add_parent(sync_task, &pulses)?;
            }
            pulses
        };

        let sorting = format!("SpikeSorting_{}", pname);
        graph.add_task(registry.build(
            "SpikeSorting",
            None,
            &TaskArgs::in_collection(&sorting, &collection),
        )?)?;
        graph.add_parent(&pulses, &sorting)?;

        let raw_qc = format!("EphysRawQC_{}", pname);
        graph.add_task(registry.build(
            "EphysRawQC",
            None,
            &TaskArgs::in_collection(&raw_qc, &collection),
        )?)?;
        graph.add_parent(compress, &raw_qc)?;

        let cell_qc = format!("EphysCellQC_{}", pname);
        graph.add_task(registry.build(
            "EphysCellQC",
            None,
            &TaskArgs::in_collection(&cell_qc, &collection),
        )?)?;
        graph.add_parent(&sorting, &cell_qc)?;
    }
    Ok(())
}

fn add_camera_tasks(
    graph: &mut TaskGraph,
    descriptor: &SessionDescriptor,
    registry: &TaskRegistry,
    sync: Option<&str>,
    sync_tasks: &[String],
) -> Result<()> {
    let cameras = query::cameras(descriptor);
    if cameras.is_empty() {
        return Ok(());
    }
    let collection = "raw_video_data";
    let precompressed = cameras
        .iter()
        .any(|cam| query::video_compressed(descriptor, cam));

    let sync_qc = format!("VideoSyncQC_{}", sync.unwrap_or("none"));
    let pose_parent;
    if precompressed {
        graph.add_task(registry.build(
            "VideoConvert",
            None,
            &TaskArgs::in_collection("VideoConvert", collection),
        )?)?;
        graph.add_task(registry.build(
            "VideoSyncQcCamlog",
            None,
            &TaskArgs::in_collection(&sync_qc, collection),
        )?)?;
        pose_parent = "VideoConvert".to_string();
    } else {
        graph.add_task(registry.build(
            "VideoRegisterRaw",
            None,
            &TaskArgs::in_collection("VideoRegisterRaw", collection),
        )?)?;
        graph.add_task(registry.build(
            "VideoCompress",
            None,
            &TaskArgs::in_collection("VideoCompress", collection),
        )?)?;
        pose_parent = "VideoCompress".to_string();
        match sync {
            Some("bpod") => {
                graph.add_task(registry.build(
                    "VideoSyncQcBpod",
                    None,
                    &TaskArgs::in_collection(&sync_qc, collection),
                )?)?;
                graph.add_parent("VideoCompress", &sync_qc)?;
            }
            Some("nidq") => {
                graph.add_task(registry.build(
                    "VideoSyncQcNidq",
                    None,
                    &TaskArgs::in_collection(&sync_qc, collection),
                )?)?;
                graph.add_parent("VideoCompress", &sync_qc)?;
                for sync_task in sync_tasks {
                    graph.add_parent(sync_task, &sync_qc)?;
                }
            }
            _ => {}
        }
    }

    if sync != Some("bpod") {
        graph.add_task(registry.build(
            "PoseEstimation",
            None,
            &TaskArgs::in_collection("PoseEstimation", collection),
        )?)?;
        graph.add_parent(&pose_parent, "PoseEstimation")?;

        graph.add_task(registry.build(
            "PosePostProcessing",
            None,
            &TaskArgs::in_collection("PosePostProcessing", collection),
        )?)?;
        graph.add_parent("PoseEstimation", "PosePostProcessing")?;
        if graph.contains(&sync_qc) {
            graph.add_parent(&sync_qc, "PosePostProcessing")?;
        }
    }
    Ok(())
}

fn add_microphone_tasks(
    graph: &mut TaskGraph,
    descriptor: &SessionDescriptor,
    registry: &TaskRegistry,
    sync: Option<&str>,
) -> Result<()> {
    let Some(mics) = descriptor.devices.get("microphone") else {
        return Ok(());
    };
    let Some((_, settings)) = mics.iter().next() else {
        return Ok(());
    };
    let collection = settings.collection.clone().unwrap_or_default();
    match sync {
        Some("bpod") => {
            graph.add_task(registry.build(
                "AudioSync",
                None,
                &TaskArgs::in_collection("AudioSync", &collection),
            )?)?;
        }
        Some("nidq") => {
            graph.add_task(registry.build(
                "AudioCompress",
                None,
                &TaskArgs::in_collection("AudioCompress", &collection),
            )?)?;
        }
        _ => {}
    }
    Ok(())
}

fn add_widefield_tasks(
    graph: &mut TaskGraph,
    descriptor: &SessionDescriptor,
    registry: &TaskRegistry,
    sync_tasks: &[String],
) -> Result<()> {
    let Some(widefield) = descriptor.devices.get("widefield") else {
        return Ok(());
    };
    let Some((_, settings)) = widefield.iter().next() else {
        return Ok(());
    };
    let collection = settings.collection.clone().unwrap_or_default();
    let args = |name: &str| TaskArgs::in_collection(name, &collection);

    graph.add_task(registry.build("WidefieldRegisterRaw", None, &args("WidefieldRegisterRaw"))?)?;
    graph.add_task(registry.build("WidefieldCompress", None, &args("WidefieldCompress"))?)?;
    graph.add_parent("WidefieldRegisterRaw", "WidefieldCompress")?;
    graph.add_task(registry.build("WidefieldPreprocess", None, &args("WidefieldPreprocess"))?)?;
    graph.add_parent("WidefieldCompress", "WidefieldPreprocess")?;
    graph.add_task(registry.build("WidefieldSync", None, &args("WidefieldSync"))?)?;
    graph.add_parent("WidefieldRegisterRaw", "WidefieldSync")?;
    graph.add_parent("WidefieldCompress", "WidefieldSync")?;
    for sync_task in sync_tasks {
        graph.add_parent(sync_task, "WidefieldSync")?;
    }
    graph.add_task(registry.build("WidefieldFOV", None, &args("WidefieldFOV"))?)?;
    graph.add_parent("WidefieldPreprocess", "WidefieldFOV")?;
    Ok(())
}

fn add_mesoscope_tasks(
    graph: &mut TaskGraph,
    descriptor: &SessionDescriptor,
    registry: &TaskRegistry,
) -> Result<()> {
    let Some(mesoscope) = descriptor.devices.get("mesoscope") else {
        return Ok(());
    };
    let Some((_, settings)) = mesoscope.iter().next() else {
        return Ok(());
    };
    let collection = settings.collection.clone().unwrap_or_default();
    let args = |name: &str| TaskArgs::in_collection(name, &collection);

    graph.add_task(registry.build(
        "MesoscopeRegisterSnapshots",
        None,
        &args("MesoscopeRegisterSnapshots"),
    )?)?;
    graph.add_task(registry.build("MesoscopePreprocess", None, &args("MesoscopePreprocess"))?)?;
    graph.add_task(registry.build("MesoscopeFOV", None, &args("MesoscopeFOV"))?)?;
    graph.add_parent("MesoscopePreprocess", "MesoscopeFOV")?;
    graph.add_task(registry.build("MesoscopeSync", None, &args("MesoscopeSync"))?)?;
    graph.add_task(registry.build("MesoscopeCompress", None, &args("MesoscopeCompress"))?)?;
    graph.add_parent("MesoscopePreprocess", "MesoscopeCompress")?;
    Ok(())
}

fn add_photometry_tasks(
    graph: &mut TaskGraph,
    descriptor: &SessionDescriptor,
    registry: &TaskRegistry,
    sync_tasks: &[String],
) -> Result<()> {
    let Some(photometry) = descriptor.devices.get("photometry") else {
        return Ok(());
    };
    let Some((_, settings)) = photometry.iter().next() else {
        return Ok(());
    };
    let collection = settings.collection.clone().unwrap_or_default();

    graph.add_task(registry.build(
        "PhotometryRegisterRaw",
        None,
        &TaskArgs::in_collection("PhotometryRegisterRaw", &collection),
    )?)?;
    graph.add_task(registry.build(
        "FibrePhotometryPreprocess",
        None,
        &TaskArgs::in_collection("FibrePhotometryPreprocess", &collection),
    )?)?;
    graph.add_parent("PhotometryRegisterRaw", "FibrePhotometryPreprocess")?;
    for sync_task in sync_tasks {
        graph.add_parent(sync_task, "FibrePhotometryPreprocess")?;
    }
    Ok(())
}

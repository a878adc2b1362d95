//! Descriptor to graph to engine, end to end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rigpipe::descriptor::store;
use rigpipe::pipeline::{
    build_pipeline, Engine, SkipReason, TaskArgs, TaskContext, TaskNode, TaskRegistry, TaskStep,
    TaskStatus,
};
use rigpipe::Result;

use crate::fixtures::{TestSession, TRAINING_YAML};

struct CountingStep {
    runs: Arc<AtomicUsize>,
}

impl TaskStep for CountingStep {
    fn run(&self, _ctx: &TaskContext) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// The built-in kinds a training session resolves, wrapped so every
/// executed step bumps one shared counter. Graph shape is unchanged.
fn counting_registry(runs: &Arc<AtomicUsize>) -> TaskRegistry {
    let builtins = TaskRegistry::with_builtins();
    let mut registry = TaskRegistry::empty();
    for kind in [
        "SessionRegisterRaw",
        "TrialRegisterRaw",
        "ChoiceWorldTrialsBpod",
        "TrainingStatus",
        "VideoRegisterRaw",
        "VideoCompress",
        "VideoSyncQcBpod",
        "AudioSync",
    ] {
        let inner = builtins.get(kind).expect("builtin kind");
        let runs = runs.clone();
        registry.register(kind, move |args: &TaskArgs| {
            let node: TaskNode = inner(args);
            node.with_step(Arc::new(CountingStep { runs: runs.clone() }))
        });
    }
    registry
}

#[test]
fn training_session_plan_has_expected_shape() {
    let session = TestSession::new();
    session.write_descriptor(TRAINING_YAML);

    let descriptor = store::read(&session.path).unwrap().unwrap();
    let graph =
        build_pipeline(&session.path, &descriptor, &TaskRegistry::with_builtins()).unwrap();

    for name in [
        "SessionRegisterRaw",
        "RegisterRaw_trainingChoiceWorld_00",
        "Trials_trainingChoiceWorld_00",
        "TrainingStatus_trainingChoiceWorld_00",
        "VideoRegisterRaw",
        "VideoCompress",
        "VideoSyncQC_bpod",
        "AudioSync",
    ] {
        assert!(graph.contains(name), "missing task {}", name);
    }
    // Bpod sessions have no sync or pose tasks.
    assert!(!graph.contains("SyncRegisterRaw"));
    assert!(!graph.contains("PoseEstimation"));

    let order = graph.topological_order().unwrap();
    let pos = |name: &str| order.iter().position(|t| t.name == name).unwrap();
    assert!(pos("Trials_trainingChoiceWorld_00") < pos("TrainingStatus_trainingChoiceWorld_00"));
    assert!(pos("VideoCompress") < pos("VideoSyncQC_bpod"));
}

#[tokio::test]
async fn training_session_runs_to_completion() {
    let session = TestSession::new();
    session.write_descriptor(TRAINING_YAML);
    // Trials and compression declare required outputs the counting steps
    // never write; pre-existing files turn them into cache hits instead.
    session.write_raw_file("raw_behavior_data", "_rig_trials.table.pqt");
    session.write_raw_file("raw_video_data", "_rig_leftCamera.raw.mp4");

    let runs = Arc::new(AtomicUsize::new(0));
    let descriptor = store::read(&session.path).unwrap().unwrap();
    let graph = build_pipeline(&session.path, &descriptor, &counting_registry(&runs)).unwrap();
    let task_count = graph.task_count();

    let mut engine = Engine::new(graph, &session.path).with_workers(4);
    let summary = engine.run().await.unwrap();

    assert!(summary.is_success(), "failures: {:?}", summary.failed);
    // Tasks whose outputs pre-exist are skipped, the rest complete.
    assert_eq!(
        summary.complete.len() + summary.skipped.len(),
        task_count
    );
    assert_eq!(runs.load(Ordering::SeqCst), summary.complete.len());

    // Run record was written.
    let record = session.path.join("_pipeline/last_run.json");
    assert!(record.exists());
    let records: Vec<rigpipe::pipeline::TaskRecord> =
        serde_json::from_str(&std::fs::read_to_string(&record).unwrap()).unwrap();
    assert_eq!(records.len(), task_count);
    assert!(records
        .iter()
        .all(|r| matches!(r.status, TaskStatus::Complete | TaskStatus::Skipped { .. })));
}

#[tokio::test]
async fn second_run_is_all_cache_hits() {
    let session = TestSession::new();
    session.write_descriptor(TRAINING_YAML);
    session.write_raw_file("raw_behavior_data", "_rig_trials.table.pqt");
    session.write_raw_file("raw_video_data", "_rig_leftCamera.raw.mp4");

    let runs = Arc::new(AtomicUsize::new(0));
    let descriptor = store::read(&session.path).unwrap().unwrap();

    let graph = build_pipeline(&session.path, &descriptor, &counting_registry(&runs)).unwrap();
    let mut engine = Engine::new(graph, &session.path).with_workers(2);
    engine.run().await.unwrap();
    let first_run_count = runs.load(Ordering::SeqCst);
    assert!(first_run_count > 0);

    let graph = build_pipeline(&session.path, &descriptor, &counting_registry(&runs)).unwrap();
    let mut engine = Engine::new(graph, &session.path).with_workers(2);
    let summary = engine.run().await.unwrap();

    assert!(summary.complete.is_empty());
    assert!(summary
        .skipped
        .iter()
        .all(|(_, reason)| *reason == SkipReason::OutputsExist));
    assert_eq!(runs.load(Ordering::SeqCst), first_run_count);
}

#[tokio::test]
async fn failing_registration_skips_downstream_trials() {
    struct FailingStep;
    impl TaskStep for FailingStep {
        fn run(&self, ctx: &TaskContext) -> Result<()> {
            Err(rigpipe::Error::TaskExecution {
                task: ctx.task_name.clone(),
                reason: "raw data incomplete".to_string(),
            })
        }
    }

    let session = TestSession::new();
    session.write_descriptor(TRAINING_YAML);
    // Satisfy VideoCompress so the behavior branch is the only failure.
    session.write_raw_file("raw_video_data", "_rig_leftCamera.raw.mp4");

    let mut registry = TaskRegistry::with_builtins();
    registry.register("TrialRegisterRaw", |args: &TaskArgs| {
        TaskNode::new(&args.name).with_step(Arc::new(FailingStep))
    });

    let descriptor = store::read(&session.path).unwrap().unwrap();
    let graph = build_pipeline(&session.path, &descriptor, &registry).unwrap();
    let mut engine = Engine::new(graph, &session.path);
    let summary = engine.run().await.unwrap();

    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, "RegisterRaw_trainingChoiceWorld_00");
    let skipped: Vec<&str> = summary
        .skipped
        .iter()
        .filter(|(_, r)| *r == SkipReason::ParentFailed)
        .map(|(n, _)| n.as_str())
        .collect();
    assert!(skipped.contains(&"Trials_trainingChoiceWorld_00"));
    assert!(skipped.contains(&"TrainingStatus_trainingChoiceWorld_00"));
    // Unrelated branches still complete.
    assert!(summary.complete.contains(&"VideoRegisterRaw".to_string()));
}

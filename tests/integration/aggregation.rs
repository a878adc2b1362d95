//! Multi-writer descriptor aggregation.

use std::sync::Arc;
use std::thread;

use rigpipe::config::LockConfig;
use rigpipe::descriptor::{lock, query, store};
use rigpipe::Error;

use crate::fixtures::{TestSession, BEHAVIOUR_STUB_YAML, EPHYS_STUB_YAML};

fn fast_lock() -> LockConfig {
    LockConfig {
        staleness_secs: 60,
        retry_interval_secs: 0,
        max_retries: 50,
    }
}

#[test]
fn two_device_stubs_merge_into_one_descriptor() {
    let session = TestSession::new();
    let behaviour = session.write_stub("2024-03-01_1_subject@behaviour", BEHAVIOUR_STUB_YAML);
    let ephys = session.write_stub("2024-03-01_1_subject@ephys", EPHYS_STUB_YAML);
    let target = session.descriptor_path();

    store::aggregate_device(&behaviour, &target, false, &fast_lock())
        .unwrap()
        .unwrap();
    let merged = store::aggregate_device(&ephys, &target, false, &fast_lock())
        .unwrap()
        .unwrap();

    assert_eq!(query::sync_label(&merged), Some("nidq"));
    assert!(merged.devices.contains_key("microphone"));
    assert!(merged.devices.contains_key("neuropixel"));
    assert_eq!(query::task_protocols(&merged), vec!["ephysChoiceWorld"]);
    assert_eq!(merged.projects, vec!["brainwide_map"]);

    // The merged file on disk round-trips.
    let reread = store::read(&session.path).unwrap().unwrap();
    assert_eq!(reread, merged);
}

#[test]
fn concurrent_writers_both_land() {
    let session = TestSession::new();
    let behaviour = session.write_stub("behaviour", BEHAVIOUR_STUB_YAML);
    let ephys = session.write_stub("ephys", EPHYS_STUB_YAML);
    let target = Arc::new(session.descriptor_path());

    let handles: Vec<_> = [behaviour, ephys]
        .into_iter()
        .map(|stub| {
            let target = target.clone();
            thread::spawn(move || {
                store::aggregate_device(&stub, &target, false, &fast_lock()).unwrap()
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let merged = store::read(&session.path).unwrap().unwrap();
    assert!(merged.devices.contains_key("microphone"));
    assert!(merged.devices.contains_key("neuropixel"));
    assert_eq!(merged.sync.len(), 1);
    assert!(!lock::lock_path(&target).exists());
}

#[test]
fn conflicting_sync_aborts_without_corrupting_target() {
    let session = TestSession::new();
    let ephys = session.write_stub("ephys", EPHYS_STUB_YAML);
    let timeline = session.write_stub(
        "timeline",
        "sync:\n  nidq:\n    collection: raw_sync_data\n    acquisition_software: timeline\n",
    );
    let target = session.descriptor_path();

    store::aggregate_device(&ephys, &target, false, &fast_lock()).unwrap();
    let before = std::fs::read_to_string(&target).unwrap();

    let result = store::aggregate_device(&timeline, &target, false, &fast_lock());
    assert!(matches!(result, Err(Error::Config(_))));
    assert_eq!(std::fs::read_to_string(&target).unwrap(), before);
    assert!(!lock::lock_path(&target).exists());
}

#[test]
fn unlink_consumes_stub_and_folder() {
    let session = TestSession::new();
    let behaviour = session.write_stub("behaviour", BEHAVIOUR_STUB_YAML);
    let ephys = session.write_stub("ephys", EPHYS_STUB_YAML);
    let target = session.descriptor_path();

    store::aggregate_device(&behaviour, &target, true, &fast_lock()).unwrap();
    assert!(!behaviour.exists());
    // Folder still holds the other stub.
    assert!(session.path.join("_devices").exists());

    store::aggregate_device(&ephys, &target, true, &fast_lock()).unwrap();
    assert!(!session.path.join("_devices").exists());
}

#[test]
fn stale_lock_does_not_block_aggregation() {
    let session = TestSession::new();
    let behaviour = session.write_stub("behaviour", BEHAVIOUR_STUB_YAML);
    let target = session.descriptor_path();

    // A lock left behind by a crashed writer an hour ago.
    let stale = lock::lock_path(&target);
    std::fs::write(
        &stale,
        format!(
            "acquired_at: {}\npid: 4242\n",
            (chrono::Utc::now() - chrono::Duration::hours(1)).to_rfc3339()
        ),
    )
    .unwrap();

    let config = LockConfig {
        staleness_secs: 30,
        retry_interval_secs: 0,
        max_retries: 2,
    };
    let merged = store::aggregate_device(&behaviour, &target, false, &config).unwrap();
    assert!(merged.is_some());
    assert!(!stale.exists());
}

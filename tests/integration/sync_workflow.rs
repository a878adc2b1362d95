//! Clock synchronization applied to extracted pulse trains.

use rigpipe::sync::clock::{sync_timestamps, sync_timestamps_with};
use rigpipe::sync::drift::{estimate_drift, DriftParams};

/// A pulse train as a device with the given offset and drift would
/// record it.
fn record_pulses(n: usize, interval: f64, offset: f64, drift_ppm: f64) -> Vec<f64> {
    (0..n)
        .map(|i| (i as f64 * interval) * (1.0 + drift_ppm * 1e-6) + offset)
        .collect()
}

#[test]
fn bpod_events_land_on_daq_clock() {
    // The DAQ records the bpod's sync pulses 12.5 s into its own
    // recording, with the bpod clock running 30 ppm slow.
    let bpod = record_pulses(600, 0.5, 0.0, 0.0);
    let daq: Vec<f64> = bpod
        .iter()
        .map(|&t| (t + 12.5) * (1.0 + 30e-6))
        .collect();

    let mapping = sync_timestamps(&bpod, &daq).unwrap();
    assert!((mapping.drift_ppm() - 30.0).abs() < 1.0);
    mapping.check_monotonic(&bpod).unwrap();

    // Trial events recorded on the bpod clock map onto the DAQ clock to
    // sub-millisecond accuracy.
    let trial_starts = [1.2, 33.7, 120.05, 250.4];
    for (&event, mapped) in trial_starts.iter().zip(mapping.map_all(&trial_starts)) {
        let expected = (event + 12.5) * (1.0 + 30e-6);
        assert!((mapped - expected).abs() < 1e-3);
    }
}

#[test]
fn truncated_recording_synced_within_tolerance() {
    // The DAQ was stopped early and missed the last two pulses.
    let bpod = record_pulses(400, 0.5, 0.0, 0.0);
    let daq = record_pulses(398, 0.5, 4.0, 0.0);

    assert!(sync_timestamps(&bpod, &daq).is_err());
    let mapping = sync_timestamps_with(&bpod, &daq, 2).unwrap();
    assert_eq!(mapping.matched.len(), 398);
    assert!((mapping.intercept - 4.0).abs() < 1e-6);
}

#[test]
fn glitched_pulses_do_not_ruin_the_fit() {
    let bpod = record_pulses(300, 0.5, 0.0, 0.0);
    let mut daq = record_pulses(300, 0.5, 2.0, 20.0);
    // A few edges detected late by the thresholding.
    daq[25] += 0.2;
    daq[150] += 0.35;
    daq[299] += 0.1;

    let mapping = sync_timestamps(&bpod, &daq).unwrap();
    assert!((mapping.drift_ppm() - 20.0).abs() < 5.0);
    mapping.check_monotonic(&bpod).unwrap();
}

#[test]
fn drift_estimated_from_clock_mapped_spikes() {
    let params = DriftParams::default();

    // Five units firing steadily; the probe settles 8 um after 80 s.
    let mut times = Vec::new();
    let mut amps = Vec::new();
    let mut depths = Vec::new();
    let mut t = 0.0;
    while t < 120.0 {
        for (u, depth) in [40.0, 100.0, 160.0, 220.0, 280.0].iter().enumerate() {
            times.push(t + u as f64 * 0.01);
            amps.push(150e-6);
            depths.push(depth + if t >= 80.0 { 8.0 } else { 0.0 });
        }
        t += 0.05;
    }

    // Spike times come off the probe's clock; map them onto the session
    // clock before estimating drift.
    let probe_pulses = record_pulses(120, 1.0, 0.0, 40.0);
    let session_pulses = record_pulses(120, 1.0, 0.0, 0.0);
    let mapping = sync_timestamps(&probe_pulses, &session_pulses).unwrap();
    let mapped_times = mapping.map_all(&times);

    let estimate = estimate_drift(&mapped_times, &amps, &depths, &params).unwrap();
    assert_eq!(estimate.drift_um.len(), estimate.time_s.len());

    let mean = |xs: &[f64]| xs.iter().sum::<f64>() / xs.len() as f64;
    let early = &estimate.drift_um[10..60];
    let late = &estimate.drift_um[100..];
    assert!(mean(early).abs() <= params.depth_bin_um);
    assert!((mean(late) - 8.0).abs() <= params.depth_bin_um);
}

//! End-to-end captures against the threaded software co-processor.

mod common;

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use common::{assert_contiguous, config, sim_rig, sim_rig_with, words, UNIT};
use samplewell::sim::ControlCall;
use samplewell::{CaptureError, CaptureState, CoprocessorUnit, StopOutcome};
use wellconf::TriggerSetting;

#[test]
fn test_oneshot_capture_reads_whole_ring() {
    let (device, sim) = sim_rig(TriggerSetting::Oneshot, 4, Duration::from_millis(2));
    let mut reader = device.open().unwrap();

    let mut stream = Vec::new();
    let mut buf = vec![0u8; 1000];
    loop {
        let n = reader.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        stream.extend_from_slice(&buf[..n]);
    }

    assert_eq!(stream.len(), 4 * UNIT);
    assert_contiguous(&words(&stream));
    assert_eq!(device.state(), CaptureState::Initialized);
    assert!(device.last_error().is_none());
    assert_eq!(sim.stats().buffers_filled.load(Ordering::Relaxed), 4);
    assert_eq!(sim.stats().captures.load(Ordering::Relaxed), 1);
}

#[test]
fn test_continuous_capture_stops_gracefully() {
    let (device, sim) = sim_rig(TriggerSetting::Continuous, 4, Duration::from_millis(5));
    let mut reader = device.open().unwrap();

    let mut buf = vec![0u8; UNIT];
    for _ in 0..6 {
        assert_eq!(reader.read(&mut buf).unwrap(), UNIT);
    }
    assert_eq!(device.state(), CaptureState::Running);

    assert_eq!(reader.stop().unwrap(), StopOutcome::Graceful);
    assert_eq!(device.state(), CaptureState::Initialized);
    assert_eq!(sim.stats().stops_honoured.load(Ordering::Relaxed), 1);
    // at most the transfer in flight when the flag went up
    let bridge = device.interrupts();
    assert!(bridge.stats().buffers_after_stop.load(Ordering::Relaxed) <= 1);

    // nothing arrives once the completion has been seen
    let filled = sim.stats().buffers_filled.load(Ordering::Relaxed);
    thread::sleep(Duration::from_millis(30));
    assert_eq!(sim.stats().buffers_filled.load(Ordering::Relaxed), filled);
}

#[test]
fn test_repeated_sessions() {
    let (device, sim) = sim_rig(TriggerSetting::Continuous, 2, Duration::from_millis(2));
    for round in 1..=3u64 {
        device.start().unwrap();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(device.stop().unwrap(), StopOutcome::Graceful);
        assert_eq!(device.state(), CaptureState::Initialized);
        assert_eq!(sim.stats().captures.load(Ordering::Relaxed), round);
        let bridge = device.interrupts();
        assert!(bridge.stats().buffers_after_stop.load(Ordering::Relaxed) <= round);
    }
    assert_eq!(device.stop().unwrap(), StopOutcome::Idle);
}

#[test]
fn test_wedged_coprocessor_is_power_cycled() {
    let mut config = config(TriggerSetting::Continuous);
    config.timing.stop_timeout_ms = 100;
    let (device, sim) = sim_rig_with(config, 2, Duration::from_millis(1));
    let control = sim.control();
    control.wedge();

    device.start().unwrap();
    thread::sleep(Duration::from_millis(10));
    assert_eq!(device.stop().unwrap(), StopOutcome::Recovered);
    assert_eq!(device.state(), CaptureState::Initialized);
    assert!(!control.is_wedged());
    assert_eq!(
        control.calls(),
        vec![
            ControlCall::Halt(CoprocessorUnit::Sampler),
            ControlCall::Halt(CoprocessorUnit::Coordinator),
            ControlCall::Boot(CoprocessorUnit::Coordinator),
            ControlCall::Boot(CoprocessorUnit::Sampler),
        ]
    );

    // restarted firmware takes a new session
    device.start().unwrap();
    thread::sleep(Duration::from_millis(5));
    assert_eq!(device.stop().unwrap(), StopOutcome::Graceful);
}

#[test]
fn test_failed_power_cycle_leaves_error() {
    let mut config = config(TriggerSetting::Continuous);
    config.timing.stop_timeout_ms = 50;
    let (device, sim) = sim_rig_with(config, 2, Duration::from_millis(1));
    let control = sim.control();
    control.wedge();
    control.fail_boot(true);

    device.start().unwrap();
    assert!(matches!(device.stop(), Err(CaptureError::HardwareWedged(_))));
    assert_eq!(device.state(), CaptureState::Error);
    assert!(matches!(device.start(), Err(CaptureError::Faulted { .. })));
}

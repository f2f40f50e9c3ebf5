//! Shared rigs for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use samplewell::sim::{FirmwareProfile, InlineFirmware, SimCoprocessor};
use samplewell::{HostDma, LogicDevice, ManualClock, MonotonicClock, WellConfig};
use wellconf::TriggerSetting;

pub const UNIT: usize = 4096;

pub fn config(trigger: TriggerSetting) -> WellConfig {
    let mut config = WellConfig::default();
    config.device.buffer_unit_size = UNIT as u32;
    config.device.trigger = trigger;
    config.timing.wait_slice_ms = 1;
    config
}

/// Device over firmware that answers synchronously; buffers arrive when the test says so.
pub fn inline_rig(trigger: TriggerSetting, buffers: usize) -> (Arc<LogicDevice>, Arc<InlineFirmware>) {
    let fw = Arc::new(InlineFirmware::new(FirmwareProfile::default()));
    let bus = HostDma::new();
    let device = LogicDevice::builder()
        .region(fw.clone())
        .dma(Arc::new(bus.clone()))
        .clock(Arc::new(ManualClock::new()))
        .config(config(trigger))
        .build()
        .unwrap();
    fw.connect(device.interrupts(), bus);
    device.boot().unwrap();
    device.set_buffer_size(buffers * UNIT).unwrap();
    (device, fw)
}

/// Device over the threaded co-processor, on the real clock.
pub fn sim_rig(
    trigger: TriggerSetting,
    buffers: usize,
    period: Duration,
) -> (Arc<LogicDevice>, SimCoprocessor) {
    let mut config = config(trigger);
    config.timing.stop_timeout_ms = 5_000;
    sim_rig_with(config, buffers, period)
}

pub fn sim_rig_with(
    mut config: WellConfig,
    buffers: usize,
    period: Duration,
) -> (Arc<LogicDevice>, SimCoprocessor) {
    let sim = SimCoprocessor::spawn(FirmwareProfile::default(), period).unwrap();
    config.timing.command_timeout_ms = 2_000;
    config.timing.command_spin_limit = u64::MAX;

    let device = LogicDevice::builder()
        .region(sim.region())
        .dma(Arc::new(sim.bus()))
        .control(sim.control())
        .clock(Arc::new(MonotonicClock::new()))
        .config(config)
        .build()
        .unwrap();
    sim.connect(device.interrupts());
    device.boot().unwrap();
    device.set_buffer_size(buffers * UNIT).unwrap();
    (device, sim)
}

pub fn words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Samples are a running counter; every consecutive word steps by one.
pub fn assert_contiguous(words: &[u32]) {
    for pair in words.windows(2) {
        assert_eq!(pair[1], pair[0].wrapping_add(1), "gap in sample counter");
    }
}

//! Device and driver integration tests through the engine
//!
//! Enumeration, reconfiguration with rollback, device switching, latency
//! reporting, backend availability.

use crate::helpers::tolerances::*;
use crate::helpers::*;
use rondo::prelude::*;
use rondo::driver::{SampleFormat, WaveFormat};
use rondo::{DeviceManager, VirtualDeviceSpec, VirtualHost};
use std::time::Duration;

/// Default device plus a second interface that only runs at 44.1/48 kHz.
fn two_device_host() -> (VirtualHost, u32) {
    let host = VirtualHost::with_default_device();
    let usb = host.add_device(
        VirtualDeviceSpec::named("USB Interface").with_sample_rates(&[44_100, 48_000]),
    );
    (host, usb)
}

#[test]
fn test_device_queries() {
    let (host, usb) = two_device_host();
    let engine = test_builder(&host).build().unwrap();

    let devices = engine.devices().unwrap();
    assert_eq!(devices.len(), 2);
    assert!(devices.iter().any(|d| d.name == "USB Interface"));

    let default = engine.default_output_device().unwrap();
    assert_eq!(default.id, 0);
    assert!(default.is_default_output);

    assert!(engine.validate_device_config(usb, 44_100));
    assert!(!engine.validate_device_config(usb, 96_000));
    assert!(!engine.validate_device_config(42, 48_000));

    let available = engine.available_driver_types();
    assert!(available.contains(&DriverType::Exclusive));
    assert!(available.contains(&DriverType::Shared));
    assert!(engine.is_driver_type_available(DriverType::Virtual));
}

#[test]
fn test_sample_rate_change() {
    let (fixture, _) = playing_tone(0.3);
    let engine = &fixture.engine;

    engine.set_sample_rate(96_000).unwrap();
    assert_eq!(engine.sample_rate(), 96_000);
    assert_eq!(engine.stream_config().sample_rate, 96_000);
    assert!(engine.is_running());

    std::thread::sleep(Duration::from_millis(30));
    let left = channel(&fixture.record(Duration::from_millis(100)), 0, 2);
    let freq = zero_crossing_frequency(&left, 96_000);
    assert!((freq - 440.0).abs() < 5.0, "tone at {freq} Hz after rate change");
}

/// A failed change leaves the stream exactly as it was.
#[test]
fn test_failed_reconfigure_rolls_back() {
    let (fixture, _) = playing_tone(0.3);
    let engine = &fixture.engine;
    let before = (engine.sample_rate(), engine.buffer_size(), engine.is_running());

    // Neither the device nor the shared mixer runs at 22.05 kHz
    assert!(engine.set_sample_rate(22_050).is_err());
    assert_eq!(
        (engine.sample_rate(), engine.buffer_size(), engine.is_running()),
        before
    );
    assert!(engine.latched_error().is_some());
    assert_eq!(engine.stream_config().sample_rate, before.0);

    engine.clear_latched_error();
    assert!(engine.set_sample_rate(22_050).is_err());
    assert_eq!(
        (engine.sample_rate(), engine.buffer_size(), engine.is_running()),
        before,
        "second failure rolls back the same way"
    );
    assert_has_audio(&fixture.record(Duration::from_millis(60)), 0.05);
}

#[test]
fn test_unadvertised_rate_rejected_before_reopen() {
    let (fixture, _) = playing_tone(0.3);
    let engine = &fixture.engine;
    assert!(!engine.validate_device_config(0, 22_050));

    assert!(engine.set_sample_rate(22_050).is_err());
    let (kind, _) = engine.latched_error().unwrap();
    assert_eq!(kind, DriverErrorKind::SampleRateMismatch);
    assert_eq!(engine.sample_rate(), TEST_SAMPLE_RATE);
    assert_eq!(engine.stream_config().sample_rate, TEST_SAMPLE_RATE);
    assert!(engine.is_running());
}

/// The device lists 96 kHz but only exclusive mode can run it. With the
/// device held elsewhere the reopen lands on the shared mixer at 48 kHz,
/// which counts as a failed change.
#[test]
fn test_rate_the_stream_cannot_reach_rolls_back() {
    init_tracing();
    let host = VirtualHost::with_default_device();
    host.hold_exclusive(0, true);
    let engine = test_builder(&host).build().unwrap();
    engine
        .add_track(Track::new("Tone").with_source(SineSource::new(440.0, 0.3)))
        .unwrap();
    engine.start().unwrap();
    assert_eq!(engine.active_driver_type(), Some(DriverType::Shared));
    assert!(engine.validate_device_config(0, 96_000));

    assert!(engine.set_sample_rate(96_000).is_err());
    let (kind, _) = engine.latched_error().unwrap();
    assert_eq!(kind, DriverErrorKind::SampleRateMismatch);
    assert_eq!(engine.sample_rate(), TEST_SAMPLE_RATE);
    assert_eq!(engine.stream_config().sample_rate, TEST_SAMPLE_RATE);
    assert_eq!(engine.active_driver_type(), Some(DriverType::Shared));
    assert!(engine.is_running());

    // Released, the same request goes through
    host.hold_exclusive(0, false);
    engine.clear_latched_error();
    engine.set_sample_rate(96_000).unwrap();
    assert_eq!(engine.sample_rate(), 96_000);
    assert_eq!(engine.stream_config().sample_rate, 96_000);
}

#[test]
fn test_buffer_size_bounds() {
    let fixture = test_engine();
    let engine = &fixture.engine;

    assert!(engine.set_buffer_size(32).is_err());
    assert!(engine.set_buffer_size(16_384).is_err());
    assert_eq!(engine.buffer_size(), TEST_BUFFER_SIZE);

    engine.set_buffer_size(64).unwrap();
    assert_eq!(engine.buffer_size(), 64);
    engine.set_buffer_size(8_192).unwrap();
    assert_eq!(engine.buffer_size(), 8_192);
}

#[test]
fn test_switch_device() {
    let (host, usb) = two_device_host();
    let engine = test_builder(&host).build().unwrap();
    engine
        .add_track(Track::new("Tone").with_source(SineSource::new(440.0, 0.5)))
        .unwrap();
    engine.start().unwrap();
    engine.play();

    engine.switch_device(usb).unwrap();
    assert_eq!(engine.stream_config().device_id, Some(usb));
    assert!(engine.is_running());
    host.clear_captured(0);
    std::thread::sleep(Duration::from_millis(100));
    assert_has_audio(&host.captured_output(usb), 0.05);
    assert!(host.captured_output(0).is_empty(), "old device is idle");

    // Unknown device: stays on the interface
    assert!(engine.switch_device(9).is_err());
    assert_eq!(engine.stream_config().device_id, Some(usb));
    assert!(engine.is_running());
}

#[test]
fn test_switch_to_device_without_the_rate_rolls_back() {
    let host = VirtualHost::with_default_device();
    let narrow = host.add_device(
        VirtualDeviceSpec::named("Narrow")
            .with_sample_rates(&[44_100])
            .with_mix_format(WaveFormat::new(44_100, 2, SampleFormat::F32)),
    );
    let engine = test_builder(&host).build().unwrap();
    engine.start().unwrap();

    assert!(engine.switch_device(narrow).is_err());
    assert_eq!(engine.stream_config().device_id, None);
    assert_eq!(engine.sample_rate(), TEST_SAMPLE_RATE);
    assert!(engine.is_running());
}

#[test]
fn test_reconfigure_before_open_only_updates_config() {
    let fixture = test_engine();
    let engine = &fixture.engine;
    engine.close();
    assert!(!engine.is_open());

    engine.set_buffer_size(256).unwrap();
    assert!(!engine.is_open());
    assert_eq!(engine.stream_config().buffer_size, 256);

    engine.start().unwrap();
    assert_eq!(engine.buffer_size(), 256);
}

#[test]
fn test_latency_reported_and_pushed_to_tracks() {
    let fixture = test_engine();
    let engine = &fixture.engine;
    let track = engine.add_track(Track::new("Rec")).unwrap();

    let period_ms = 1000.0 * f64::from(TEST_BUFFER_SIZE) / f64::from(TEST_SAMPLE_RATE);
    let info = engine.latency_info().unwrap();
    assert!((info.buffer_period_ms - period_ms).abs() < 1e-9);
    assert!((info.estimated_rtl_ms - 3.0 * period_ms).abs() < 1e-9);
    assert!((engine.stream_latency() - period_ms / 1000.0).abs() < 1e-9);

    let (input_ms, output_ms) = engine.latency_compensation();
    let params = engine.track_params(track).unwrap();
    assert!(
        (params.latency_compensation_ms() - (input_ms + output_ms) as f32).abs() < DSP_EPSILON
    );

    // Halving the buffer halves the compensation
    engine.set_buffer_size(TEST_BUFFER_SIZE / 2).unwrap();
    let (input_ms, output_ms) = engine.latency_compensation();
    assert!((output_ms - period_ms / 2.0).abs() < 1e-9);
    assert!(
        (params.latency_compensation_ms() - (input_ms + output_ms) as f32).abs() < DSP_EPSILON
    );
}

#[test]
fn test_reported_device_latency_wins() {
    let host = VirtualHost::new();
    host.add_device(VirtualDeviceSpec::named("Studio").with_reported_latency_ms(3.5));
    let engine = test_builder(&host).build().unwrap();

    let info = engine.latency_info().unwrap();
    assert!((info.output_latency_ms - 3.5).abs() < 1e-9);
    assert!(info.estimated_rtl_ms <= 3.0 * info.buffer_period_ms);
}

#[test]
fn test_unavailable_host_fails_to_build() {
    let host = VirtualHost::with_default_device();
    host.set_available(false);
    let result = test_builder(&host).build();
    assert!(matches!(result, Err(Error::Driver(_))));

    let result = RondoEngine::builder().device_manager(DeviceManager::new()).build();
    assert!(result.is_err());
}

#[test]
fn test_auto_scaling_idle_without_underruns() {
    let fixture = test_engine_with(|b| {
        b.auto_buffer_scaling(true, 0)
            .auto_scaling_interval(Duration::from_millis(50))
    });
    let engine = &fixture.engine;
    engine.start().unwrap();
    std::thread::sleep(Duration::from_millis(200));

    assert!(!engine.check_and_auto_scale_buffer().unwrap());
    assert_eq!(engine.buffer_size(), TEST_BUFFER_SIZE);
}

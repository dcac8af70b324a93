//! End-to-end scenarios on the virtual device, in real time with shortened
//! durations: sine tone, command-driven fades, live buffer change, fallback,
//! device removal, command queue overflow.

use crate::helpers::tolerances::*;
use crate::helpers::*;
use parking_lot::Mutex;
use rondo::prelude::*;
use rondo::{CallbackControl, DeviceManager, DriverState, SharedCallback, VirtualHost};
use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A raw callback writing a 440 Hz tone at 0.3 into both channels.
#[test]
fn test_sine_tone() {
    init_tracing();
    let host = VirtualHost::with_default_device();
    let mut manager = DeviceManager::with_virtual_host(host.clone());
    manager.initialize().unwrap();

    let sample_rate = f64::from(TEST_SAMPLE_RATE);
    let callback = SharedCallback::from_fn(move |out: &mut [f32], _, frames, stream_time| {
        for (i, frame) in out.chunks_exact_mut(2).take(frames as usize).enumerate() {
            let t = stream_time + i as f64 / sample_rate;
            let s = ((TAU * 440.0 * t).sin() * 0.3) as f32;
            frame[0] = s;
            frame[1] = s;
        }
        CallbackControl::Continue
    });
    manager
        .open_stream(&StreamConfig::default(), callback)
        .unwrap();
    assert!(manager.stream_latency() * 1000.0 <= 20.0);

    manager.start_stream().unwrap();
    std::thread::sleep(Duration::from_secs(3));
    let captured = host.captured_output(0);
    let stats = manager.statistics();
    manager.stop_stream().unwrap();

    let left = channel(&captured, 0, 2);
    assert!(left.len() >= TEST_SAMPLE_RATE as usize * 27 / 10);
    assert!((peak(&left) - 0.3).abs() < 0.01);
    let freq = zero_crossing_frequency(&left, TEST_SAMPLE_RATE);
    assert!((freq - 440.0).abs() < 2.0, "tone at {freq} Hz");
    assert!(max_step(&left) < MAX_TONE_STEP);
    assert_eq!(stats.underrun_count, 0);
}

/// Volume commands fade the tone out and back in without zipper noise.
#[test]
fn test_command_driven_gain() {
    let (fixture, _) = playing_tone(0.6);
    let engine = &fixture.engine;
    std::thread::sleep(Duration::from_millis(100));

    // The fade starts within two periods of the clear and settles in 60 ms
    let settled = TEST_SAMPLE_RATE as usize * 90 / 1000;

    fixture.clear_captured();
    assert!(engine.push_command(AudioCommand::set_track_volume(0, 0.0)));
    std::thread::sleep(Duration::from_millis(200));
    let fade_out = channel(&fixture.captured(), 0, 2);
    assert!(fade_out.len() > settled);
    assert!(peak(&fade_out[..settled / 4]) > 0.1, "tone audible as the fade starts");
    assert!(peak(&fade_out[settled..]) < 0.3 * 0.01);
    assert!(max_step(&fade_out) < MAX_TONE_STEP);

    fixture.clear_captured();
    assert!(engine.push_command(AudioCommand::set_track_volume(0, 1.0)));
    std::thread::sleep(Duration::from_millis(200));
    let fade_in = channel(&fixture.captured(), 0, 2);
    assert!(fade_in.len() > settled);
    assert!(peak(&fade_in[settled..]) > 0.29);
    assert!(max_step(&fade_in) < MAX_TONE_STEP);
}

#[test]
fn test_buffer_size_change_while_playing() {
    let (fixture, _) = playing_tone(0.6);
    let engine = &fixture.engine;
    std::thread::sleep(Duration::from_millis(200));

    fixture.clear_captured();
    engine.set_buffer_size(128).unwrap();
    assert_eq!(engine.buffer_size(), 128);
    assert!(engine.is_running());
    std::thread::sleep(Duration::from_millis(200));

    let left = channel(&fixture.captured(), 0, 2);
    assert_has_audio(&left, 0.1);
    let gap = longest_silence(&left);
    assert!(
        gap < TEST_SAMPLE_RATE as usize / 10,
        "gap of {gap} frames during the change"
    );
    assert!(engine.is_playing());
    assert_eq!(engine.statistics().underrun_count, 0);

    let latency = engine.latency_info().unwrap();
    assert_eq!(latency.actual_buffer_frames, 128);
}

#[test]
fn test_exclusive_to_shared_fallback() {
    init_tracing();
    let host = VirtualHost::with_default_device();
    host.hold_exclusive(0, true);

    let changes: Arc<Mutex<Vec<(DriverType, DriverType, String)>>> = Arc::default();
    let sink = Arc::clone(&changes);
    let engine = test_builder(&host)
        .preferred_mode(DriverMode::Exclusive)
        .on_driver_mode_change(move |preferred, actual, reason| {
            sink.lock().push((preferred, actual, reason.to_string()));
        })
        .build()
        .unwrap();

    assert_eq!(engine.active_driver_type(), Some(DriverType::Shared));
    assert!(engine.is_using_fallback_driver());
    let reason = engine.fallback_reason().unwrap();
    assert!(!reason.is_empty());

    let changes = changes.lock();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].0, DriverType::Exclusive);
    assert_eq!(changes[0].1, DriverType::Shared);
    assert_eq!(changes[0].2, reason);

    // The shared stream plays normally
    engine
        .add_track(Track::new("Tone").with_source(SineSource::new(440.0, 0.5)))
        .unwrap();
    engine.start().unwrap();
    engine.play();
    std::thread::sleep(Duration::from_millis(100));
    assert_has_audio(&host.captured_output(0), 0.05);
}

#[test]
fn test_device_removal_surfaces_error() {
    let (fixture, _) = playing_tone(0.3);
    let engine = &fixture.engine;

    let errors: Arc<Mutex<Vec<(DriverErrorKind, Instant)>>> = Arc::default();
    let sink = Arc::clone(&errors);
    engine.set_stream_error_callback(move |kind, _message| {
        sink.lock().push((kind, Instant::now()));
    });
    std::thread::sleep(Duration::from_millis(50));

    let removed_at = Instant::now();
    fixture.host.remove_device(fixture.device);
    assert!(wait_until(Duration::from_secs(1), || !errors.lock().is_empty()));

    let (kind, at) = errors.lock()[0];
    assert_eq!(kind, DriverErrorKind::DeviceNotFound);
    assert!(at.duration_since(removed_at) < Duration::from_secs(1));
    assert_eq!(engine.state(), DriverState::Error);
    assert!(!engine.is_running());

    // The audio thread is gone and the error was reported once
    let periods = engine.rendered_periods();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(engine.rendered_periods(), periods);
    assert_eq!(errors.lock().len(), 1);
    assert_eq!(
        engine.latched_error().map(|(kind, _)| kind),
        Some(DriverErrorKind::DeviceNotFound)
    );

    // Plug back in and recover
    fixture.host.restore_device(fixture.device);
    engine.clear_latched_error();
    engine.close();
    engine.start().unwrap();
    assert!(engine.is_running());
    assert!(engine.latched_error().is_none());
}

#[test]
fn test_queue_overflow_is_harmless() {
    let capacity = 256;
    let fixture = test_engine_with(|b| b.command_queue_capacity(capacity));
    let engine = &fixture.engine;
    let track = engine
        .add_track(Track::new("Tone").with_source(SineSource::new(440.0, 0.5)))
        .unwrap();
    engine.start().unwrap();
    engine.play();
    assert!(wait_until(Duration::from_secs(1), || engine.is_playing()));
    assert_eq!(engine.command_queue_capacity(), capacity);

    let mut accepted = 0;
    for i in 0..2 * capacity {
        let gain = 0.5 + 0.5 * (i % 2) as f32;
        if engine.set_track_volume(track, gain) {
            accepted += 1;
        }
    }
    let rejected = 2 * capacity - accepted;

    assert!(accepted >= capacity, "{accepted} accepted");
    assert!(rejected > 0);
    assert_eq!(engine.dropped_commands(), rejected as u64);
    assert!(engine.max_command_depth() as usize >= capacity / 2);

    assert!(wait_until(Duration::from_secs(1), || {
        engine.pending_commands() == 0
    }));
    std::thread::sleep(Duration::from_millis(100));
    assert_has_audio(&fixture.record(Duration::from_millis(100)), 0.05);
    assert_eq!(engine.statistics().underrun_count, 0);
    assert!(engine.is_running());
    assert_eq!(engine.state(), DriverState::StreamRunning);
}

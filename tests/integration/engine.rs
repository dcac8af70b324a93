//! Engine lifecycle integration tests
//!
//! Build, start/stop, track edits while running, suspend/resume, teardown.

use crate::helpers::tolerances::*;
use crate::helpers::*;
use rondo::prelude::*;
use rondo::{DriverState, VirtualDeviceSpec, VirtualHost};
use std::time::Duration;

/// Build negotiates the stream but leaves the audio thread idle.
#[test]
fn test_build_opens_without_starting() {
    let fixture = test_engine();
    let engine = &fixture.engine;

    assert!(engine.is_open());
    assert!(!engine.is_running());
    assert_eq!(engine.state(), DriverState::StreamOpen);
    assert_eq!(engine.sample_rate(), TEST_SAMPLE_RATE);
    assert_eq!(engine.buffer_size(), TEST_BUFFER_SIZE);
    assert_eq!(engine.active_driver_type(), Some(DriverType::Exclusive));
    assert!(!engine.is_using_fallback_driver());
    assert_eq!(engine.rendered_periods(), 0);
}

#[test]
fn test_start_stop_cycle() {
    let fixture = test_engine();
    let engine = &fixture.engine;

    for _ in 0..3 {
        engine.start().unwrap();
        assert!(engine.is_running());
        let before = engine.rendered_periods();
        assert!(wait_until(Duration::from_secs(1), || {
            engine.rendered_periods() > before + 2
        }));

        engine.stop().unwrap();
        assert!(!engine.is_running());
        assert_eq!(engine.state(), DriverState::StreamOpen);
    }
}

/// After stop the thread is gone and the device was left with silence.
#[test]
fn test_stop_is_clean() {
    let (fixture, _) = playing_tone(0.5);
    std::thread::sleep(Duration::from_millis(100));
    fixture.clear_captured();
    std::thread::sleep(Duration::from_millis(50));

    fixture.engine.stop().unwrap();
    let periods = fixture.engine.rendered_periods();
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(
        fixture.engine.rendered_periods(),
        periods,
        "callback invoked after stop"
    );

    let captured = fixture.captured();
    let tail_len = TEST_BUFFER_SIZE as usize * 2;
    assert!(captured.len() > tail_len);
    assert_has_audio(&captured[..captured.len() - tail_len], 0.05);
    assert_silence(&captured[captured.len() - tail_len..], FLOAT_EPSILON);
}

#[test]
fn test_add_and_remove_tracks_while_running() {
    let fixture = test_engine();
    let engine = &fixture.engine;
    engine.start().unwrap();
    engine.play();

    let a = engine.add_track(Track::new("A").with_source(DcSource(0.2))).unwrap();
    let b = engine.add_track(Track::new("B").with_source(DcSource(0.2))).unwrap();
    let c = engine.add_track(Track::new("C")).unwrap();

    assert!(engine.is_running(), "structural edit restarts the stream");
    assert_eq!(engine.track_ids(), vec![a, b, c]);
    assert_eq!(engine.track_index(c), Some(2));

    let removed = engine.remove_track(b).unwrap();
    assert_eq!(removed.map(|t| t.name().to_string()), Some("B".to_string()));
    assert_eq!(engine.track_index(c), Some(1));
    assert_eq!(engine.track_count(), 2);
    assert!(engine.remove_track(b).unwrap().is_none());
    assert!(engine.is_running());

    // Commands for a removed track are refused on the control side
    assert!(!engine.set_track_volume(b, 0.5));
    assert!(engine.set_track_volume(c, 0.5));
}

/// Commands queued before a structural edit land on the tracks they named.
#[test]
fn test_pending_commands_survive_structural_edit() {
    let fixture = test_engine();
    let engine = &fixture.engine;
    let a = engine.add_track(Track::new("A")).unwrap();
    let b = engine.add_track(Track::new("B")).unwrap();

    // Not running: nothing drains the queue until the edit flushes it
    assert!(engine.set_track_mute(b, true));
    engine.remove_track(a).unwrap();

    let params = engine.track_params(b).unwrap();
    assert!(params.is_muted());
}

#[test]
fn test_track_params_reflect_commands() {
    let (fixture, track) = playing_tone(0.3);
    let engine = &fixture.engine;
    let params = engine.track_params(track).unwrap();

    assert!(engine.set_track_pan(track, -0.25));
    assert!(engine.set_track_solo(track, true));
    assert!(wait_until(Duration::from_secs(1), || params.is_soloed()));
    assert!((params.pan() + 0.25).abs() < FLOAT_EPSILON);
}

/// Shared params are read-only for solo; the engine command keeps
/// solo-mute on the other tracks in step.
#[test]
fn test_solo_command_updates_solo_mute() {
    let (fixture, track) = playing_tone(0.3);
    let engine = &fixture.engine;
    let other = engine.add_track(Track::new("Other")).unwrap();
    let other_params = engine.track_params(other).unwrap();
    assert!(!other_params.is_solo_muted());

    assert!(engine.set_track_solo(track, true));
    assert!(wait_until(Duration::from_secs(1), || other_params.is_solo_muted()));
    assert!(!engine.track_params(track).unwrap().is_solo_muted());

    assert!(engine.set_track_solo(track, false));
    assert!(wait_until(Duration::from_secs(1), || !other_params.is_solo_muted()));
}

#[test]
fn test_suspend_and_resume_round_trip() {
    let (fixture, _) = playing_tone(0.3);
    let engine = &fixture.engine;

    engine.suspend_audio().unwrap();
    engine.suspend_audio().unwrap();
    assert!(engine.is_suspended());
    assert!(!engine.is_open());
    assert!(!fixture.host.is_exclusive_in_use(fixture.device));

    engine.resume_audio().unwrap();
    engine.resume_audio().unwrap();
    assert!(!engine.is_suspended());
    assert!(engine.is_running());
    assert_eq!(engine.buffer_size(), TEST_BUFFER_SIZE);
    assert!(engine.is_playing(), "transport survives a suspend");
}

#[test]
fn test_focus_changes_only_matter_when_configured() {
    let fixture = test_engine();
    fixture.engine.start().unwrap();
    fixture.engine.set_app_focused(false).unwrap();
    assert!(!fixture.engine.is_suspended());

    let fixture = test_engine_with(|b| b.release_in_background(true));
    fixture.engine.start().unwrap();
    fixture.engine.set_app_focused(false).unwrap();
    assert!(fixture.engine.is_suspended());
    fixture.engine.set_app_focused(true).unwrap();
    assert!(fixture.engine.is_running());
}

#[test]
fn test_drop_releases_device() {
    let host = VirtualHost::new();
    let device = host.add_device(VirtualDeviceSpec::named("Interface"));
    {
        let engine = test_builder(&host).build().unwrap();
        engine.start().unwrap();
        assert!(host.is_exclusive_in_use(device));
    }
    assert!(!host.is_exclusive_in_use(device));

    // A second engine can take the device straight away
    let engine = test_builder(&host).build().unwrap();
    assert_eq!(engine.active_driver_type(), Some(DriverType::Exclusive));
}

#[test]
fn test_config_round_trips_through_json() {
    let config = EngineConfig {
        sample_rate: 44_100,
        buffer_size: 256,
        preferred_mode: DriverMode::Shared,
        auto_buffer_scaling: true,
        ..EngineConfig::default()
    };
    let json = serde_json::to_string(&config).unwrap();
    let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, config);

    // 44.1 kHz is not the shared mix rate, so the exclusive counterpart opens
    let fixture = test_engine_with(|b| b.config(parsed));
    assert_eq!(fixture.engine.config().preferred_mode, DriverMode::Shared);
    assert_eq!(fixture.engine.sample_rate(), 44_100);
    assert_eq!(fixture.engine.active_driver_type(), Some(DriverType::Exclusive));
    assert!(fixture.engine.fallback_reason().is_some());
}

#[test]
#[cfg(feature = "parallel")]
fn test_parallel_toggle_while_running() {
    let (fixture, _) = playing_tone(0.3);
    let engine = &fixture.engine;
    for i in 0..4 {
        engine
            .add_track(Track::new(format!("Extra {i}")).with_source(SineSource::new(220.0, 0.1)))
            .unwrap();
    }

    engine.set_parallel_processing(true).unwrap();
    assert!(engine.is_parallel_processing());
    assert!(engine.is_running());
    assert_has_audio(&fixture.record(Duration::from_millis(100)), 0.05);

    engine.set_parallel_processing(false).unwrap();
    assert!(!engine.is_parallel_processing());
    assert_has_audio(&fixture.record(Duration::from_millis(100)), 0.05);
}

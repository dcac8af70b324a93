//! Transport and preview integration tests
//!
//! Play/pause/seek through the command queue, system tracks while stopped,
//! preview slots, project and clip hooks.

use crate::helpers::tolerances::*;
use crate::helpers::*;
use rondo::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_transport_starts_stopped() {
    let fixture = test_engine();
    fixture
        .engine
        .add_track(Track::new("Tone").with_source(SineSource::new(440.0, 0.5)))
        .unwrap();
    fixture.engine.start().unwrap();

    assert!(!fixture.engine.is_playing());
    let silent = fixture.record(Duration::from_millis(100));
    assert!(!silent.is_empty());
    assert_silence(&silent, FLOAT_EPSILON);
    assert_eq!(fixture.engine.position_samples(), 0);
}

#[test]
fn test_play_advances_position() {
    let (fixture, _) = playing_tone(0.3);
    let engine = &fixture.engine;

    assert!(wait_until(Duration::from_secs(1), || {
        engine.position_samples() >= u64::from(TEST_SAMPLE_RATE) / 10
    }));
    let seconds = engine.position_seconds();
    assert!(seconds > 0.09 && seconds < 1.0, "position {seconds}s");

    // Position moves in whole periods
    assert_eq!(engine.position_samples() % u64::from(TEST_BUFFER_SIZE), 0);
}

#[test]
fn test_pause_freezes_position_and_silences_tracks() {
    let (fixture, _) = playing_tone(0.3);
    let engine = &fixture.engine;
    std::thread::sleep(Duration::from_millis(50));

    assert!(engine.pause());
    assert!(wait_until(Duration::from_secs(1), || !engine.is_playing()));
    let frozen = engine.position_samples();
    assert!(frozen > 0);

    let captured = fixture.record(Duration::from_millis(80));
    assert_silence(&captured, FLOAT_EPSILON);
    assert_eq!(engine.position_samples(), frozen);
}

#[test]
fn test_seek_keeps_play_state() {
    let (fixture, _) = playing_tone(0.3);
    let engine = &fixture.engine;

    assert!(engine.seek(96_000));
    assert!(wait_until(Duration::from_secs(1), || {
        engine.position_samples() >= 96_000
    }));
    assert!(engine.is_playing());

    engine.pause();
    assert!(wait_until(Duration::from_secs(1), || !engine.is_playing()));
    assert!(engine.seek(4_800));
    assert!(wait_until(Duration::from_secs(1), || {
        engine.position_samples() == 4_800
    }));
    assert!(!engine.is_playing());
}

/// Metronome-style system tracks keep sounding with the transport stopped.
#[test]
fn test_system_track_renders_while_stopped() {
    let fixture = test_engine();
    fixture
        .engine
        .add_track(Track::new("Click").system().with_source(DcSource(0.4)))
        .unwrap();
    fixture.engine.start().unwrap();

    let captured = fixture.record(Duration::from_millis(100));
    // 0.4 through centre track pan and centre bus pan
    let left = channel(&captured, 0, 2);
    assert!(!left.is_empty());
    let settled = &left[left.len() / 2..];
    assert!(settled.iter().all(|s| (s - 0.2).abs() < DSP_EPSILON));
}

#[test]
fn test_preview_plays_while_transport_stopped() {
    let fixture = test_engine();
    let engine = &fixture.engine;
    engine
        .set_preview_source(3, Box::new(SineSource::new(880.0, 0.5)))
        .unwrap();
    engine.start().unwrap();

    assert_silence(&fixture.record(Duration::from_millis(50)), FLOAT_EPSILON);

    assert!(engine.start_preview(3));
    std::thread::sleep(Duration::from_millis(30));
    let playing = fixture.record(Duration::from_millis(100));
    assert_has_audio(&playing, 0.05);
    let freq = zero_crossing_frequency(&channel(&playing, 0, 2), TEST_SAMPLE_RATE);
    assert!((freq - 880.0).abs() < 10.0, "preview at {freq} Hz");

    assert!(engine.stop_preview());
    std::thread::sleep(Duration::from_millis(30));
    assert_silence(&fixture.record(Duration::from_millis(50)), FLOAT_EPSILON);
}

/// Solo on a mixer track never silences the preview.
#[test]
fn test_preview_bypasses_solo() {
    let (fixture, track) = playing_tone(0.3);
    let engine = &fixture.engine;
    let other = engine.add_track(Track::new("Other")).unwrap();
    engine.set_preview_source(0, Box::new(DcSource(0.5))).unwrap();

    engine.set_track_mute(track, true);
    engine.set_track_solo(other, true);
    assert!(engine.start_preview(0));
    std::thread::sleep(Duration::from_millis(60));

    // Preview skips the main bus, so only the track pan law applies
    let expected = 0.5 * std::f32::consts::FRAC_1_SQRT_2;
    let left = channel(&fixture.record(Duration::from_millis(60)), 0, 2);
    assert!(!left.is_empty());
    assert!(left.iter().all(|s| (s - expected).abs() < DSP_EPSILON));
}

#[test]
fn test_preview_slot_bounds() {
    let fixture = test_engine_with(|b| b.preview_slots(2));
    let engine = &fixture.engine;
    assert_eq!(engine.preview_slots(), 2);

    let err = engine
        .set_preview_source(2, Box::new(DcSource(1.0)))
        .unwrap_err();
    assert!(matches!(err, Error::PreviewSlot { slot: 2, capacity: 2 }));

    engine.set_preview_source(1, Box::new(DcSource(1.0))).unwrap();
    assert!(engine.clear_preview_source(1).unwrap().is_some());
    assert!(engine.clear_preview_source(1).unwrap().is_none());
}

/// Counts the payload hooks it receives.
struct HookCounter {
    project: Arc<AtomicU32>,
    clip: Arc<AtomicU32>,
}

impl AudioSource for HookCounter {
    fn channels(&self) -> usize {
        1
    }

    fn render(&mut self, out: &mut [f32], _: usize, _: f64, _: u32) {
        out.fill(0.0);
    }

    fn on_project_state(&mut self, payload: u32) {
        self.project.store(payload, Ordering::Release);
    }

    fn on_clip_update(&mut self, payload: u32) {
        self.clip.store(payload, Ordering::Release);
    }
}

#[test]
fn test_project_and_clip_payloads_reach_sources() {
    let fixture = test_engine();
    let engine = &fixture.engine;
    let project = Arc::new(AtomicU32::new(0));
    let clip_a = Arc::new(AtomicU32::new(0));
    let clip_b = Arc::new(AtomicU32::new(0));

    let a = engine
        .add_track(Track::new("A").with_source(HookCounter {
            project: Arc::clone(&project),
            clip: Arc::clone(&clip_a),
        }))
        .unwrap();
    engine
        .add_track(Track::new("B").with_source(HookCounter {
            project: Arc::new(AtomicU32::new(0)),
            clip: Arc::clone(&clip_b),
        }))
        .unwrap();
    engine.start().unwrap();

    assert!(engine.load_project_state(7));
    assert!(engine.update_clip_state(a, 42));
    assert!(wait_until(Duration::from_secs(1), || {
        project.load(Ordering::Acquire) == 7 && clip_a.load(Ordering::Acquire) == 42
    }));
    assert_eq!(clip_b.load(Ordering::Acquire), 0, "clip update is per track");
}

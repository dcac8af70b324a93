//! Metering and master-stage integration tests
//!
//! Output meters, master gain, safety processing, output tap, driver statistics.

use crate::helpers::tolerances::*;
use crate::helpers::*;
use parking_lot::Mutex;
use rondo::prelude::*;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_meters_follow_output() {
    let fixture = test_engine();
    let engine = &fixture.engine;
    let track = engine
        .add_track(Track::new("DC").with_source(DcSource(0.8)))
        .unwrap();
    engine.start().unwrap();
    engine.play();

    // 0.8 through both centre pan laws
    assert!(wait_until(Duration::from_secs(1), || {
        (engine.peak_levels().0 - 0.4).abs() < DSP_EPSILON
    }));
    let (peak_l, peak_r) = engine.peak_levels();
    let (rms_l, rms_r) = engine.rms_levels();
    assert!((peak_l - peak_r).abs() < FLOAT_EPSILON);
    assert!((rms_l - 0.4).abs() < DSP_EPSILON);
    assert!((rms_r - 0.4).abs() < DSP_EPSILON);

    // Hard left
    engine.set_track_pan(track, -1.0);
    assert!(wait_until(Duration::from_secs(1), || {
        engine.peak_levels().1 < SILENCE_THRESHOLD
    }));
    assert!(engine.peak_levels().0 > 0.5);
}

#[test]
fn test_master_gain_scales_output() {
    let fixture = test_engine();
    let engine = &fixture.engine;
    engine
        .add_track(Track::new("DC").with_source(DcSource(0.8)))
        .unwrap();
    engine.start().unwrap();
    engine.play();
    assert!(wait_until(Duration::from_secs(1), || engine.peak_levels().0 > 0.39));

    engine.set_master_gain(0.5);
    assert!((engine.master_gain() - 0.5).abs() < FLOAT_EPSILON);
    std::thread::sleep(Duration::from_millis(150));
    let left = channel(&fixture.record(Duration::from_millis(50)), 0, 2);
    assert!(!left.is_empty());
    assert!(left.iter().all(|s| (s - 0.2).abs() < PERCEPTUAL_EPSILON));

    // Negative and NaN gains are ignored or clamped
    engine.set_master_gain(f32::NAN);
    assert!((engine.master_gain() - 0.5).abs() < FLOAT_EPSILON);
    engine.set_master_gain(-3.0);
    assert_eq!(engine.master_gain(), 0.0);
}

#[test]
fn test_safety_processing_bounds_hot_output() {
    let fixture = test_engine_with(|b| b.safety_processing(true));
    let engine = &fixture.engine;
    assert!(engine.is_safety_processing());
    engine
        .add_track(Track::new("Hot").with_source(SineSource::new(440.0, 1.0)))
        .unwrap();
    engine.start().unwrap();
    engine.play();
    engine.set_master_gain(6.0);
    std::thread::sleep(Duration::from_millis(150));

    let captured = fixture.record(Duration::from_millis(100));
    assert_has_audio(&captured, 0.3);
    assert!(peak(&captured) <= 1.0, "peak {}", peak(&captured));

    engine.set_safety_processing(false);
    std::thread::sleep(Duration::from_millis(30));
    let raw = fixture.record(Duration::from_millis(50));
    assert!(peak(&raw) > 1.0, "unprocessed output is not limited");
}

#[test]
fn test_output_tap_sees_master_output() {
    let fixture = test_engine();
    let engine = &fixture.engine;
    engine
        .add_track(Track::new("DC").with_source(DcSource(0.8)).with_pan(1.0))
        .unwrap();

    let seen: Arc<Mutex<(usize, f32, f32, u32)>> = Arc::new(Mutex::new((0, 0.0, 0.0, 0)));
    let sink = Arc::clone(&seen);
    engine.set_output_tap(move |left: &[f32], right: &[f32], frames: usize, rate: u32| {
        let mut seen = sink.lock();
        seen.0 += frames;
        seen.1 = left[frames - 1];
        seen.2 = right[frames - 1];
        seen.3 = rate;
    });
    assert!(engine.has_output_tap());

    engine.start().unwrap();
    engine.play();
    assert!(wait_until(Duration::from_secs(1), || {
        seen.lock().0 >= 4 * TEST_BUFFER_SIZE as usize
    }));

    let (_, left, right, rate) = *seen.lock();
    assert_eq!(rate, TEST_SAMPLE_RATE);
    assert!(left.abs() < FLOAT_EPSILON, "hard right leaves left empty");
    assert!(right > 0.5);

    engine.clear_output_tap();
    assert!(!engine.has_output_tap());
    let frames = seen.lock().0;
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(seen.lock().0, frames);
}

/// Callback time stays well inside the buffer period over a 10 s run.
#[test]
fn test_statistics_within_budget() {
    let fixture = test_engine_with(|b| b.buffer_size(256));
    let engine = &fixture.engine;
    for i in 0..4 {
        engine
            .add_track(Track::new(format!("Tone {i}")).with_source(SineSource::new(
                220.0 * (i + 1) as f64,
                0.1,
            )))
            .unwrap();
    }
    engine.start().unwrap();
    engine.play();

    let mut last = engine.statistics();
    for _ in 0..100 {
        std::thread::sleep(Duration::from_millis(100));
        let stats = engine.statistics();
        assert!(stats.callback_count >= last.callback_count);
        assert!(stats.underrun_count >= last.underrun_count);
        assert!(stats.overrun_count >= last.overrun_count);
        last = stats;
    }

    assert!(last.callback_count > 1_500, "{} callbacks", last.callback_count);
    assert_eq!(last.underrun_count, 0);
    assert!(last.average_cpu_load_percent < 70.0);
    assert!(last.max_cpu_load_percent < 100.0);
    assert!(last.max_callback_time_us < 1e6 * 256.0 / f64::from(TEST_SAMPLE_RATE));

    engine.reset_statistics();
    assert!(engine.statistics().callback_count < last.callback_count);
}

/// Status queries polled from the control thread never cost the audio thread
/// a period.
#[test]
fn test_status_queries_keep_audio_running() {
    let (fixture, _) = playing_tone(0.3);
    let engine = &fixture.engine;
    std::thread::sleep(Duration::from_millis(100));

    fixture.clear_captured();
    let deadline = std::time::Instant::now() + Duration::from_millis(500);
    let mut polls = 0u64;
    while std::time::Instant::now() < deadline {
        assert!(!engine.is_parallel_processing());
        assert!(engine.preview_slots() > 0);
        assert!(!engine.has_output_tap());
        polls += 1;
    }
    let left = channel(&fixture.captured(), 0, 2);

    assert!(polls > 1_000, "only {polls} polls");
    assert_has_audio(&left, 0.1);
    let gap = longest_silence(&left);
    assert!(gap < 16, "gap of {gap} frames while polling");
}

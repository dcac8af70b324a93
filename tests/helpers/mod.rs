//! Test helpers and fixtures for rondo integration tests
//!
//! Every fixture runs on an in-process virtual device, so the suite needs no
//! audio hardware. The virtual clock runs in real time: waiting 100 ms renders
//! roughly 100 ms of audio.
//!
//! ## Tolerance Levels
//!
//! Use the appropriate tolerance from [`tolerances`] module:
//! - `FLOAT_EPSILON` (1e-6): Exact operations (passthrough, unity gain)
//! - `DSP_EPSILON` (1e-4): DSP processing (smoothing, oscillators)
//! - `PERCEPTUAL_EPSILON` (0.001): Perceptual equivalence (-60dB)
//! - `SILENCE_THRESHOLD` (0.0001): Silence detection (-80dB)

#![allow(dead_code)]

pub mod tolerances;

use rondo::prelude::*;
use rondo::VirtualHost;
use std::time::{Duration, Instant};

/// Default test sample rate (matches the virtual device's mix format)
pub const TEST_SAMPLE_RATE: u32 = 48_000;

/// Standard buffer size for scenario tests
pub const TEST_BUFFER_SIZE: u32 = 512;

/// Watchdog period used by fixtures, short so error tests finish quickly.
pub const TEST_WATCHDOG_INTERVAL: Duration = Duration::from_millis(20);

/// Route engine logs to the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A built (not started) engine on a single default virtual device.
pub struct Fixture {
    pub engine: RondoEngine,
    pub host: VirtualHost,
    pub device: u32,
}

impl Fixture {
    /// Drain what the device played since the last call.
    pub fn captured(&self) -> Vec<f32> {
        self.host.captured_output(self.device)
    }

    pub fn clear_captured(&self) {
        self.host.clear_captured(self.device);
    }

    /// Discard output so far, wait `duration`, and return what was played.
    pub fn record(&self, duration: Duration) -> Vec<f32> {
        self.clear_captured();
        std::thread::sleep(duration);
        self.captured()
    }
}

pub fn test_builder(host: &VirtualHost) -> RondoEngineBuilder {
    RondoEngine::builder()
        .virtual_device(host.clone())
        .sample_rate(TEST_SAMPLE_RATE)
        .buffer_size(TEST_BUFFER_SIZE)
        .parallel(false, 4)
        .watchdog_interval(TEST_WATCHDOG_INTERVAL)
}

/// Create a basic test engine on a default stereo virtual device.
pub fn test_engine() -> Fixture {
    test_engine_with(|builder| builder)
}

/// Create a test engine, letting the caller adjust the builder first.
pub fn test_engine_with(configure: impl FnOnce(RondoEngineBuilder) -> RondoEngineBuilder) -> Fixture {
    init_tracing();
    let host = VirtualHost::with_default_device();
    let engine = configure(test_builder(&host))
        .build()
        .expect("Failed to create test engine");
    Fixture {
        engine,
        host,
        device: 0,
    }
}

/// Engine with one 440 Hz tone track, started and playing.
pub fn playing_tone(amplitude: f32) -> (Fixture, TrackId) {
    let fixture = test_engine();
    let track = fixture
        .engine
        .add_track(Track::new("Tone").with_source(SineSource::new(440.0, amplitude)))
        .expect("add track");
    fixture.engine.start().expect("start");
    assert!(fixture.engine.play());
    assert!(wait_until(Duration::from_secs(1), || fixture.engine.is_playing()));
    (fixture, track)
}

/// Poll `condition` every millisecond until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Constant-level mono source, for exact gain arithmetic.
pub struct DcSource(pub f32);

impl AudioSource for DcSource {
    fn channels(&self) -> usize {
        1
    }

    fn render(&mut self, out: &mut [f32], _frames: usize, _stream_time: f64, _sample_rate: u32) {
        out.fill(self.0);
    }
}

/// One channel out of an interleaved buffer.
pub fn channel(interleaved: &[f32], index: usize, channels: usize) -> Vec<f32> {
    interleaved
        .iter()
        .skip(index)
        .step_by(channels)
        .copied()
        .collect()
}

/// Calculate RMS of a signal.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Calculate peak amplitude of a signal.
pub fn peak(samples: &[f32]) -> f32 {
    samples
        .iter()
        .map(|s| s.abs())
        .fold(0.0_f32, |a, b| a.max(b))
}

/// Largest absolute difference between neighbouring samples.
pub fn max_step(samples: &[f32]) -> f32 {
    samples
        .windows(2)
        .map(|w| (w[1] - w[0]).abs())
        .fold(0.0_f32, f32::max)
}

/// Frequency estimate from rising zero crossings.
pub fn zero_crossing_frequency(samples: &[f32], sample_rate: u32) -> f64 {
    let crossings: Vec<usize> = samples
        .windows(2)
        .enumerate()
        .filter(|(_, w)| w[0] <= 0.0 && w[1] > 0.0)
        .map(|(i, _)| i)
        .collect();
    if crossings.len() < 2 {
        return 0.0;
    }
    let span = (crossings[crossings.len() - 1] - crossings[0]) as f64;
    (crossings.len() - 1) as f64 * f64::from(sample_rate) / span
}

/// Longest run of exactly-silent frames, in frames.
pub fn longest_silence(mono: &[f32]) -> usize {
    let mut longest = 0;
    let mut run = 0;
    for sample in mono {
        if sample.abs() <= tolerances::SILENCE_THRESHOLD {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    longest
}

/// Assert that a signal is approximately silent (all values near zero).
pub fn assert_silence(samples: &[f32], tolerance: f32) {
    let max = peak(samples);
    assert!(
        max <= tolerance,
        "Expected silence, but peak amplitude was {}",
        max
    );
}

/// Assert that a signal has content (not silent).
pub fn assert_has_audio(samples: &[f32], min_rms: f32) {
    let r = rms(samples);
    assert!(
        r >= min_rms,
        "Expected audio content with RMS >= {}, but RMS was {}",
        min_rms,
        r
    );
}

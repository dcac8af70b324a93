//! Audio sources: the collaborators that feed tracks.

use std::f64::consts::TAU;

/// Supplies interleaved samples to a track on demand.
///
/// Called from the audio thread (or a worker of the parallel pool), so every
/// method must follow the real-time rules: no allocation, no blocking, no I/O.
/// Heavy work (decoding, snapshot building) belongs on a loader thread; the
/// hooks below only swap in what was prepared there.
pub trait AudioSource: Send {
    /// 1 (mono) or 2 (stereo).
    fn channels(&self) -> usize;

    /// Called off the audio thread before streaming starts.
    fn prepare(&mut self, _sample_rate: u32, _max_frames: usize) {}

    /// Write `frames` interleaved frames into `out` (`frames * channels()` samples).
    fn render(&mut self, out: &mut [f32], frames: usize, stream_time: f64, sample_rate: u32);

    /// Transport jumped to `sample_pos`.
    fn seek(&mut self, _sample_pos: u64) {}

    /// A pre-built project snapshot identified by `payload` is ready.
    fn on_project_state(&mut self, _payload: u32) {}

    /// A pre-built clip update for this track is ready.
    fn on_clip_update(&mut self, _payload: u32) {}
}

/// Mono test tone.
#[derive(Debug, Clone)]
pub struct SineSource {
    frequency: f64,
    amplitude: f32,
    phase: f64,
}

impl SineSource {
    pub fn new(frequency: f64, amplitude: f32) -> Self {
        Self {
            frequency,
            amplitude,
            phase: 0.0,
        }
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn amplitude(&self) -> f32 {
        self.amplitude
    }
}

impl Default for SineSource {
    fn default() -> Self {
        Self::new(440.0, 0.3)
    }
}

impl AudioSource for SineSource {
    fn channels(&self) -> usize {
        1
    }

    fn render(&mut self, out: &mut [f32], frames: usize, _stream_time: f64, sample_rate: u32) {
        let step = self.frequency / sample_rate.max(1) as f64;
        for sample in out.iter_mut().take(frames) {
            *sample = (self.phase * TAU).sin() as f32 * self.amplitude;
            self.phase = (self.phase + step).fract();
        }
    }

    fn seek(&mut self, _sample_pos: u64) {
        self.phase = 0.0;
    }
}

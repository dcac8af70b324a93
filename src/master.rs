//! Master output stage: smoothed gain, optional safety processing, metering.

use rondo_core::{AtomicFlag, AtomicFloat, SmoothedValue, DEFAULT_SMOOTHING_SECS};

/// DC blocker pole radius.
pub const DC_BLOCKER_R: f32 = 0.9997;

/// Inputs beyond this magnitude are hard-limited instead of soft-clipped.
pub const HARD_LIMIT: f32 = 1.5;

/// Rational tanh approximation, hard-limited to ±1 beyond [`HARD_LIMIT`].
#[inline]
pub fn soft_clip(x: f32) -> f32 {
    if x > HARD_LIMIT {
        1.0
    } else if x < -HARD_LIMIT {
        -1.0
    } else {
        let x2 = x * x;
        x * (27.0 + x2) / (27.0 + 9.0 * x2)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DcBlocker {
    x1: f32,
    y1: f32,
}

impl DcBlocker {
    #[inline]
    fn process(&mut self, x: f32) -> f32 {
        let y = x - self.x1 + DC_BLOCKER_R * self.y1;
        self.x1 = x;
        self.y1 = y;
        y
    }
}

/// Lock-free output meters (peak and RMS per channel), written once per period.
#[derive(Debug, Default)]
pub struct OutputMeters {
    peak_left: AtomicFloat,
    peak_right: AtomicFloat,
    rms_left: AtomicFloat,
    rms_right: AtomicFloat,
}

impl OutputMeters {
    #[inline]
    pub fn peak(&self) -> (f32, f32) {
        (self.peak_left.get(), self.peak_right.get())
    }

    #[inline]
    pub fn rms(&self) -> (f32, f32) {
        (self.rms_left.get(), self.rms_right.get())
    }

    #[inline]
    fn set(&self, peak: (f32, f32), rms: (f32, f32)) {
        self.peak_left.set(peak.0);
        self.peak_right.set(peak.1);
        self.rms_left.set(rms.0);
        self.rms_right.set(rms.1);
    }

    fn reset(&self) {
        self.set((0.0, 0.0), (0.0, 0.0));
    }
}

/// Control-side settings of the master stage.
#[derive(Debug)]
pub(crate) struct MasterControls {
    pub gain: AtomicFloat,
    pub safety: AtomicFlag,
    pub meters: OutputMeters,
}

impl MasterControls {
    pub fn new(safety: bool) -> Self {
        Self {
            gain: AtomicFloat::new(1.0),
            safety: AtomicFlag::new(safety),
            meters: OutputMeters::default(),
        }
    }
}

/// Audio-thread half of the master stage.
pub(crate) struct MasterStage {
    gain: SmoothedValue,
    dc: [DcBlocker; 2],
}

impl MasterStage {
    pub fn new() -> Self {
        Self {
            gain: SmoothedValue::immediate(1.0),
            dc: [DcBlocker::default(); 2],
        }
    }

    pub fn prepare(&mut self, sample_rate: u32, controls: &MasterControls) {
        self.gain
            .set_settle_time(DEFAULT_SMOOTHING_SECS, sample_rate as f32);
        self.gain.snap_to(controls.gain.get());
        self.dc = [DcBlocker::default(); 2];
        controls.meters.reset();
    }

    /// Process `frames` interleaved frames of `channels` (1 or 2) in place and
    /// publish the meters.
    pub fn process(
        &mut self,
        buffer: &mut [f32],
        frames: usize,
        channels: usize,
        controls: &MasterControls,
    ) {
        self.gain.set_target(controls.gain.get());
        let safety = controls.safety.get();
        let channels = channels.clamp(1, 2);

        let mut peak = [0.0f32; 2];
        let mut sum_sq = [0.0f32; 2];

        for frame in buffer.chunks_exact_mut(channels).take(frames) {
            let g = self.gain.next_sample();
            for (ch, sample) in frame.iter_mut().enumerate() {
                let mut x = *sample * g;
                if safety {
                    x = soft_clip(self.dc[ch].process(x));
                }
                *sample = x;
                peak[ch] = peak[ch].max(x.abs());
                sum_sq[ch] += x * x;
            }
        }

        let n = frames.max(1) as f32;
        let rms = [(sum_sq[0] / n).sqrt(), (sum_sq[1] / n).sqrt()];
        if channels == 1 {
            controls.meters.set((peak[0], peak[0]), (rms[0], rms[0]));
        } else {
            controls.meters.set((peak[0], peak[1]), (rms[0], rms[1]));
        }
    }

    #[cfg(test)]
    pub fn current_gain(&self) -> f32 {
        self.gain.current()
    }
}

//! Per-sample parameter smoothing for zipper-free gain and pan changes.
//!
//! # Example
//!
//! ```
//! use rondo_core::SmoothedValue;
//!
//! // Settles within 50 ms at 48 kHz
//! let mut gain = SmoothedValue::new(1.0, 0.050, 48000.0);
//!
//! // The UI published a new target
//! gain.set_target(0.0);
//!
//! // In the audio callback (per-sample)
//! # let mut buffer = [1.0f32; 512];
//! for sample in buffer.iter_mut() {
//!     *sample *= gain.next_sample();
//! }
//! ```

/// Settling time used for track gain and pan.
pub const DEFAULT_SMOOTHING_SECS: f32 = 0.050;

/// Residual fraction of a step left after the settling time (-40 dB).
const SETTLE_RESIDUAL: f32 = 0.01;

/// Distance below which the value snaps onto its target.
const SNAP_EPSILON: f32 = 1.0e-5;

/// One-pole smoothed parameter.
///
/// Each sample moves `coeff · (target - current)` toward the target. The
/// coefficient is derived from a settling time and the sample rate so the value
/// is within 1% of a step after `settle_secs`. Owned by the audio thread.
#[derive(Debug, Clone)]
pub struct SmoothedValue {
    current: f32,
    target: f32,
    coeff: f32,
}

impl SmoothedValue {
    pub fn new(initial: f32, settle_secs: f32, sample_rate: f32) -> Self {
        Self {
            current: initial,
            target: initial,
            coeff: coefficient(settle_secs, sample_rate),
        }
    }

    /// No smoothing: every target is reached on the next sample.
    pub fn immediate(initial: f32) -> Self {
        Self {
            current: initial,
            target: initial,
            coeff: 1.0,
        }
    }

    #[inline]
    pub fn set_target(&mut self, target: f32) {
        self.target = target;
    }

    /// Jump to `value` without a ramp.
    #[inline]
    pub fn snap_to(&mut self, value: f32) {
        self.current = value;
        self.target = value;
    }

    #[inline]
    pub fn skip_to_target(&mut self) {
        self.current = self.target;
    }

    /// Call once per sample in the audio callback.
    #[inline]
    pub fn next_sample(&mut self) -> f32 {
        let delta = self.target - self.current;
        if delta.abs() <= SNAP_EPSILON {
            self.current = self.target;
        } else {
            self.current += self.coeff * delta;
        }
        self.current
    }

    #[inline]
    pub fn current(&self) -> f32 {
        self.current
    }

    #[inline]
    pub fn target(&self) -> f32 {
        self.target
    }

    #[inline]
    pub fn is_smoothing(&self) -> bool {
        self.current != self.target
    }

    pub fn coefficient(&self) -> f32 {
        self.coeff
    }

    /// Recompute the coefficient, e.g. after a sample-rate change.
    pub fn set_settle_time(&mut self, settle_secs: f32, sample_rate: f32) {
        self.coeff = coefficient(settle_secs, sample_rate);
    }

    #[inline]
    pub fn apply_gain(&mut self, buffer: &mut [f32]) {
        if !self.is_smoothing() {
            let gain = self.current;
            for sample in buffer.iter_mut() {
                *sample *= gain;
            }
            return;
        }
        for sample in buffer.iter_mut() {
            *sample *= self.next_sample();
        }
    }
}

impl Default for SmoothedValue {
    fn default() -> Self {
        Self::new(0.0, DEFAULT_SMOOTHING_SECS, 48_000.0)
    }
}

fn coefficient(settle_secs: f32, sample_rate: f32) -> f32 {
    let samples = settle_secs * sample_rate;
    if samples <= 1.0 {
        return 1.0;
    }
    // residual = (1 - coeff)^samples
    1.0 - (SETTLE_RESIDUAL.ln() / samples).exp()
}

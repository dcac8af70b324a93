//! Summing bus.

use rondo_core::{constant_power_gains, AtomicFlag, AtomicFloat};

/// A named summing node with atomic gain, pan, mute and solo.
#[derive(Debug)]
pub struct MixerBus {
    name: String,
    channels: usize,
    gain: AtomicFloat,
    pan: AtomicFloat,
    muted: AtomicFlag,
    soloed: AtomicFlag,
}

impl MixerBus {
    /// `channels` is clamped to mono or stereo.
    pub fn new(name: impl Into<String>, channels: usize) -> Self {
        Self {
            name: name.into(),
            channels: channels.clamp(1, 2),
            gain: AtomicFloat::new(1.0),
            pan: AtomicFloat::new(0.0),
            muted: AtomicFlag::new(false),
            soloed: AtomicFlag::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn gain(&self) -> f32 {
        self.gain.get()
    }

    pub fn set_gain(&self, gain: f32) {
        if !gain.is_nan() {
            self.gain.set(gain.max(0.0));
        }
    }

    pub fn pan(&self) -> f32 {
        self.pan.get()
    }

    pub fn set_pan(&self, pan: f32) {
        if !pan.is_nan() {
            self.pan.set(pan.clamp(-1.0, 1.0));
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted.get()
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.set(muted);
    }

    pub fn is_soloed(&self) -> bool {
        self.soloed.get()
    }

    pub fn set_soloed(&self, soloed: bool) {
        self.soloed.set(soloed);
    }

    /// Per-channel gains for the current settings. Mono buses ignore pan.
    #[inline]
    fn channel_gains(&self) -> (f32, f32) {
        if self.is_muted() {
            return (0.0, 0.0);
        }
        let gain = self.gain();
        if self.channels == 1 {
            return (gain, gain);
        }
        let (left, right) = constant_power_gains(self.pan());
        (gain * left, gain * right)
    }

    /// Apply gain and pan to `frames` interleaved frames in place.
    pub fn process(&self, buffer: &mut [f32], frames: usize) {
        let (left, right) = self.channel_gains();
        if self.channels == 1 {
            for sample in buffer.iter_mut().take(frames) {
                *sample *= left;
            }
            return;
        }
        for frame in buffer.chunks_exact_mut(2).take(frames) {
            frame[0] *= left;
            frame[1] *= right;
        }
    }

    /// Sum `input` scaled by gain and pan into `out` without clearing it.
    pub fn mix_into(&self, out: &mut [f32], input: &[f32], frames: usize) {
        let (left, right) = self.channel_gains();
        if left == 0.0 && right == 0.0 {
            return;
        }
        if self.channels == 1 {
            for (o, i) in out.iter_mut().zip(input.iter()).take(frames) {
                *o += i * left;
            }
            return;
        }
        for (o, i) in out
            .chunks_exact_mut(2)
            .zip(input.chunks_exact(2))
            .take(frames)
        {
            o[0] += i[0] * left;
            o[1] += i[1] * right;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f32::consts::FRAC_1_SQRT_2;

    #[test]
    fn test_process_center() {
        let bus = MixerBus::new("main", 2);
        let mut buffer = [1.0f32; 4];
        bus.process(&mut buffer, 2);
        for sample in buffer {
            assert_abs_diff_eq!(sample, FRAC_1_SQRT_2, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_process_hard_right() {
        let bus = MixerBus::new("main", 2);
        bus.set_pan(1.0);
        bus.set_gain(0.5);
        let mut buffer = [1.0f32; 4];
        bus.process(&mut buffer, 2);
        assert_abs_diff_eq!(buffer[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(buffer[1], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_mix_into_accumulates() {
        let bus = MixerBus::new("aux", 2);
        bus.set_pan(-1.0);
        let mut out = [0.5f32; 4];
        bus.mix_into(&mut out, &[1.0; 4], 2);
        assert_abs_diff_eq!(out[0], 1.5, epsilon = 1e-6);
        assert_abs_diff_eq!(out[1], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_mix_into_respects_frame_count() {
        let bus = MixerBus::new("mono", 1);
        let mut out = [0.0f32; 4];
        bus.mix_into(&mut out, &[1.0; 4], 3);
        assert_eq!(out, [1.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_muted_bus() {
        let bus = MixerBus::new("main", 2);
        bus.set_muted(true);
        let mut out = [0.25f32; 4];
        bus.mix_into(&mut out, &[1.0; 4], 2);
        assert_eq!(out, [0.25; 4]);

        bus.process(&mut out, 2);
        assert_eq!(out, [0.0; 4]);
    }
}

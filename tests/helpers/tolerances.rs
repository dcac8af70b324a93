//! Tolerance constants for audio testing.
//!
//! Output captured from a virtual device passes through the negotiated native
//! sample format, so comparisons against captured audio use the looser levels.

/// Floating point rounding errors (passthrough, unity gain).
pub const FLOAT_EPSILON: f32 = 1e-6;

/// DSP processing tolerance (smoothing, oscillators).
pub const DSP_EPSILON: f32 = 1e-4;

/// Audio perceptual tolerance (~-60dB, inaudible differences).
pub const PERCEPTUAL_EPSILON: f32 = 0.001;

/// Silence threshold (~-80dB).
pub const SILENCE_THRESHOLD: f32 = 0.0001;

/// Largest step between neighbouring samples of a 440 Hz tone at full scale
/// and 48 kHz, with headroom. A larger step is a click or zipper.
pub const MAX_TONE_STEP: f32 = 0.08;

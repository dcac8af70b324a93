//! Buffer-period arithmetic and latency reporting.
//!
//! Latency is always computed from the negotiated buffer size and sample rate,
//! never queried from the device on the audio thread.

use serde::{Deserialize, Serialize};

/// One-way duration of `frames` at `sample_rate`, in milliseconds.
#[inline]
pub fn buffer_period_ms(frames: u32, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    1000.0 * frames as f64 / sample_rate as f64
}

/// Duration of `frames` at `sample_rate`, in microseconds.
#[inline]
pub fn buffer_period_us(frames: u32, sample_rate: u32) -> f64 {
    buffer_period_ms(frames, sample_rate) * 1000.0
}

/// Latency figures for an open stream.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LatencyInfo {
    pub buffer_period_ms: f64,
    /// Input buffer + ring + output buffer.
    pub estimated_rtl_ms: f64,
    pub input_latency_ms: f64,
    pub output_latency_ms: f64,
    pub actual_buffer_frames: u32,
    pub sample_rate: u32,
}

impl LatencyInfo {
    /// Arithmetic estimate: round trip is three buffer periods.
    pub fn calculate(frames: u32, sample_rate: u32) -> Self {
        let period = buffer_period_ms(frames, sample_rate);
        Self {
            buffer_period_ms: period,
            estimated_rtl_ms: 3.0 * period,
            input_latency_ms: period,
            output_latency_ms: period,
            actual_buffer_frames: frames,
            sample_rate,
        }
    }

    /// Device-reported output latency, as exclusive endpoints provide it.
    ///
    /// The round trip never exceeds the arithmetic estimate.
    pub fn measured(frames: u32, sample_rate: u32, output_ms: f64) -> Self {
        let mut info = Self::calculate(frames, sample_rate);
        if output_ms.is_finite() && output_ms > 0.0 {
            info.output_latency_ms = output_ms;
            info.estimated_rtl_ms =
                (info.input_latency_ms + output_ms + info.buffer_period_ms).min(info.estimated_rtl_ms);
        }
        info
    }

    /// One-way output latency in seconds.
    pub fn output_latency_secs(&self) -> f64 {
        self.output_latency_ms / 1000.0
    }

    /// Total compensation applied when aligning recorded material.
    pub fn compensation_ms(&self) -> f64 {
        self.input_latency_ms + self.output_latency_ms
    }
}

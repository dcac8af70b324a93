//! Stream and engine configuration.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

pub const MIN_SAMPLE_RATE: u32 = 8_000;
pub const MAX_SAMPLE_RATE: u32 = 384_000;
pub const MIN_BUFFER_SIZE: u32 = 16;
pub const MAX_BUFFER_SIZE: u32 = 8_192;

pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_BUFFER_SIZE: u32 = 512;
pub const DEFAULT_UNDERRUN_THRESHOLD: u32 = 10;
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 4;

/// Preferred device access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DriverMode {
    /// Sole ownership of the device, bit-exact, lowest latency.
    Exclusive,
    /// Routed through the OS mixer.
    Shared,
    /// Try exclusive first and fall back to shared.
    #[default]
    Auto,
}

/// Requested stream parameters.
///
/// Immutable once a stream is open. The negotiated values come back separately
/// (see [`StreamFormat`](crate::StreamFormat) and [`LatencyInfo`](crate::LatencyInfo)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// `None` selects the default output device.
    pub device_id: Option<u32>,
    pub sample_rate: u32,
    pub buffer_size: u32,
    pub input_channels: u16,
    pub output_channels: u16,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            input_channels: 0,
            output_channels: 2,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            return Err(Error::InvalidSampleRate(self.sample_rate));
        }
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(Error::InvalidBufferSize(self.buffer_size));
        }
        if self.output_channels == 0 {
            return Err(Error::InvalidChannels(self.output_channels));
        }
        Ok(())
    }

    pub fn with_device(mut self, device_id: Option<u32>) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: u32) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// One-way duration of one buffer in milliseconds.
    pub fn buffer_period_ms(&self) -> f64 {
        crate::latency::buffer_period_ms(self.buffer_size, self.sample_rate)
    }
}

/// Engine configuration record.
///
/// Plain data so collaborators can persist it (serde).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub device_id: Option<u32>,
    pub sample_rate: u32,
    pub buffer_size: u32,
    pub input_channels: u16,
    pub output_channels: u16,
    pub preferred_mode: DriverMode,
    /// Release the device when the host application loses focus.
    pub release_in_background: bool,
    pub auto_buffer_scaling: bool,
    pub underrun_threshold_per_min: u32,
    pub parallel_processing: bool,
    /// Minimum track count before parallel rendering kicks in.
    pub parallel_threshold: usize,
    pub command_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            input_channels: 0,
            output_channels: 2,
            preferred_mode: DriverMode::Auto,
            release_in_background: false,
            auto_buffer_scaling: false,
            underrun_threshold_per_min: DEFAULT_UNDERRUN_THRESHOLD,
            parallel_processing: false,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
            command_queue_capacity: crate::command::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.stream_config().validate()?;
        if self.output_channels > 2 {
            return Err(Error::InvalidConfig(format!(
                "output_channels {} not supported (mono or stereo only)",
                self.output_channels
            )));
        }
        if self.command_queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "command_queue_capacity must be non-zero".into(),
            ));
        }
        if self.parallel_threshold == 0 {
            return Err(Error::InvalidConfig(
                "parallel_threshold must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            device_id: self.device_id,
            sample_rate: self.sample_rate,
            buffer_size: self.buffer_size,
            input_channels: self.input_channels,
            output_channels: self.output_channels,
        }
    }
}

//! Audio endpoint descriptions.

use crate::config::StreamConfig;
use serde::{Deserialize, Serialize};

/// An enumerated audio endpoint.
///
/// `id` is only valid for the enumeration that produced it; hot-plugging can
/// make a stored `DeviceInfo` stale.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: u32,
    pub name: String,
    pub max_input_channels: u16,
    pub max_output_channels: u16,
    /// Ascending.
    pub sample_rates: Vec<u32>,
    pub preferred_sample_rate: u32,
    pub is_default_input: bool,
    pub is_default_output: bool,
}

impl DeviceInfo {
    pub fn supports_rate(&self, sample_rate: u32) -> bool {
        self.sample_rates.binary_search(&sample_rate).is_ok()
    }

    pub fn is_output(&self) -> bool {
        self.max_output_channels > 0
    }

    pub fn is_input(&self) -> bool {
        self.max_input_channels > 0
    }

    /// Channel counts fit and the rate is advertised.
    pub fn supports_config(&self, config: &StreamConfig) -> bool {
        config.output_channels <= self.max_output_channels
            && config.input_channels <= self.max_input_channels
            && self.supports_rate(config.sample_rate)
    }
}

/// First device flagged as default output, else the first output device.
pub fn default_output(devices: &[DeviceInfo]) -> Option<&DeviceInfo> {
    devices
        .iter()
        .find(|d| d.is_default_output)
        .or_else(|| devices.iter().find(|d| d.is_output()))
}

/// First device flagged as default input, else the first input device.
pub fn default_input(devices: &[DeviceInfo]) -> Option<&DeviceInfo> {
    devices
        .iter()
        .find(|d| d.is_default_input)
        .or_else(|| devices.iter().find(|d| d.is_input()))
}

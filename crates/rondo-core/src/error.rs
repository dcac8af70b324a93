//! Error types for rondo-core.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Platform-neutral driver error kinds.
///
/// Backends map native error codes into these. The discriminants are stable so a
/// kind can be published through an `AtomicU32` from the audio thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum DriverErrorKind {
    #[default]
    None = 0,
    InitializationFailed = 1,
    DeviceNotFound = 2,
    DeviceInUse = 3,
    UnsupportedFormat = 4,
    BufferUnderrun = 5,
    BufferOverrun = 6,
    SampleRateMismatch = 7,
    ExclusiveModeUnavailable = 8,
    DriverDllNotFound = 9,
    DriverDllLoadFailed = 10,
    StreamOpenFailed = 11,
    StreamStartFailed = 12,
    Unknown = 13,
}

impl DriverErrorKind {
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Unknown codes decode as [`DriverErrorKind::Unknown`].
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::None,
            1 => Self::InitializationFailed,
            2 => Self::DeviceNotFound,
            3 => Self::DeviceInUse,
            4 => Self::UnsupportedFormat,
            5 => Self::BufferUnderrun,
            6 => Self::BufferOverrun,
            7 => Self::SampleRateMismatch,
            8 => Self::ExclusiveModeUnavailable,
            9 => Self::DriverDllNotFound,
            10 => Self::DriverDllLoadFailed,
            11 => Self::StreamOpenFailed,
            12 => Self::StreamStartFailed,
            _ => Self::Unknown,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::None => "No error",
            Self::InitializationFailed => "Driver initialization failed",
            Self::DeviceNotFound => "Audio device not found",
            Self::DeviceInUse => "Device is already in use",
            Self::UnsupportedFormat => "Audio format not supported",
            Self::BufferUnderrun => "Buffer underrun detected",
            Self::BufferOverrun => "Buffer overrun detected",
            Self::SampleRateMismatch => "Sample rate mismatch",
            Self::ExclusiveModeUnavailable => "Exclusive mode not available",
            Self::DriverDllNotFound => "Driver library not found",
            Self::DriverDllLoadFailed => "Driver library load failed",
            Self::StreamOpenFailed => "Stream open failed",
            Self::StreamStartFailed => "Stream start failed",
            Self::Unknown => "Unknown error",
        }
    }

    /// Transient kinds are counted in statistics and never surfaced as errors.
    pub fn is_fatal(self) -> bool {
        !matches!(
            self,
            Self::None | Self::BufferUnderrun | Self::BufferOverrun
        )
    }
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Error type for rondo-core operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid sample rate: {0} Hz (8000-384000)")]
    InvalidSampleRate(u32),

    #[error("Invalid buffer size: {0} frames (16-8192)")]
    InvalidBufferSize(u32),

    #[error("Invalid channel count: {0}")]
    InvalidChannels(u16),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for rondo-driver.

use crate::state::DriverState;
use rondo_core::DriverErrorKind;
use thiserror::Error;

/// Error type for driver and device-manager operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{kind}: {message}")]
    Driver {
        kind: DriverErrorKind,
        message: String,
    },

    #[error(transparent)]
    Core(#[from] rondo_core::Error),

    #[error("{operation} not allowed in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: DriverState,
    },

    #[error("No driver backend available")]
    NoBackend,

    #[error("No stream has been opened")]
    NoStream,

    #[error("Failed to spawn audio thread")]
    Spawn(#[from] std::io::Error),

    #[cfg(feature = "cpal-backend")]
    #[error("Audio device not available")]
    DeviceNotAvailable(#[from] cpal::DefaultStreamConfigError),

    #[cfg(feature = "cpal-backend")]
    #[error("Failed to query stream configs")]
    SupportedConfigs(#[from] cpal::SupportedStreamConfigsError),

    #[cfg(feature = "cpal-backend")]
    #[error("Failed to build audio stream")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[cfg(feature = "cpal-backend")]
    #[error("Failed to play audio stream")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[cfg(feature = "cpal-backend")]
    #[error("Failed to pause audio stream")]
    PauseStream(#[from] cpal::PauseStreamError),

    #[cfg(feature = "cpal-backend")]
    #[error("Failed to enumerate devices")]
    Devices(#[from] cpal::DevicesError),

    #[cfg(feature = "cpal-backend")]
    #[error("Failed to get device name")]
    DeviceName(#[from] cpal::DeviceNameError),
}

impl Error {
    pub fn driver(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self::Driver {
            kind,
            message: message.into(),
        }
    }

    /// Platform-neutral kind for this error.
    pub fn kind(&self) -> DriverErrorKind {
        match self {
            Self::Driver { kind, .. } => *kind,
            Self::Core(_) => DriverErrorKind::UnsupportedFormat,
            Self::InvalidState { .. } | Self::NoStream => DriverErrorKind::StreamOpenFailed,
            Self::NoBackend => DriverErrorKind::InitializationFailed,
            Self::Spawn(_) => DriverErrorKind::StreamStartFailed,
            #[cfg(feature = "cpal-backend")]
            Self::DeviceNotAvailable(_) | Self::Devices(_) | Self::DeviceName(_) => {
                DriverErrorKind::DeviceNotFound
            }
            #[cfg(feature = "cpal-backend")]
            Self::SupportedConfigs(_) => DriverErrorKind::UnsupportedFormat,
            #[cfg(feature = "cpal-backend")]
            Self::BuildStream(err) => match err {
                cpal::BuildStreamError::DeviceNotAvailable => DriverErrorKind::DeviceNotFound,
                cpal::BuildStreamError::StreamConfigNotSupported
                | cpal::BuildStreamError::InvalidArgument => DriverErrorKind::UnsupportedFormat,
                _ => DriverErrorKind::StreamOpenFailed,
            },
            #[cfg(feature = "cpal-backend")]
            Self::PlayStream(_) | Self::PauseStream(_) => DriverErrorKind::StreamStartFailed,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

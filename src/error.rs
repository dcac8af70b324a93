//! Centralized error type for the rondo umbrella crate.
//!
//! Wraps the member-crate errors so `?` propagates naturally across crate
//! boundaries.

use rondo_core::DriverErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] rondo_core::Error),

    #[error(transparent)]
    Driver(#[from] rondo_driver::Error),

    #[error("Preview slot {slot} out of range (0..{capacity})")]
    PreviewSlot { slot: u32, capacity: usize },

    #[cfg(feature = "parallel")]
    #[error("Failed to start render pool: {0}")]
    RenderPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Failed to spawn watchdog thread")]
    Watchdog(#[source] std::io::Error),
}

impl Error {
    /// Platform-neutral kind, `Unknown` for errors that do not come from a driver.
    pub fn kind(&self) -> DriverErrorKind {
        match self {
            Self::Driver(err) => err.kind(),
            Self::Core(_) => DriverErrorKind::UnsupportedFormat,
            _ => DriverErrorKind::Unknown,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

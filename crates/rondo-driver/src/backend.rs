//! The uniform driver backend contract.

use crate::state::{AtomicDriverState, DriverState};
use crate::{Error, Result};
use parking_lot::Mutex;
use rondo_core::{
    DeviceInfo, DriverErrorKind, DriverMode, DriverStatistics, LatencyInfo, SharedCallback,
    StreamConfig,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Fatal-error listener. Always invoked off the audio thread.
pub type ErrorCallback = Box<dyn Fn(DriverErrorKind, &str) + Send + Sync>;

/// Backend catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriverType {
    /// Event-driven, sole ownership of the device.
    Exclusive,
    /// Event-driven through the OS mixer.
    Shared,
    /// Generic cross-platform backend.
    Fallback,
    /// In-process device, no hardware.
    Virtual,
}

impl DriverType {
    pub const ALL: [DriverType; 4] = [
        Self::Exclusive,
        Self::Shared,
        Self::Fallback,
        Self::Virtual,
    ];

    /// Lower is preferred.
    pub fn priority(self) -> u8 {
        match self {
            Self::Exclusive => 0,
            Self::Shared => 1,
            Self::Fallback => 2,
            Self::Virtual => 3,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Exclusive => "Exclusive",
            Self::Shared => "Shared",
            Self::Fallback => "Fallback",
            Self::Virtual => "Virtual",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Exclusive => "Exclusive device access, bit-exact, lowest latency",
            Self::Shared => "Shared through the system mixer, coexists with other applications",
            Self::Fallback => "Generic cross-platform audio, higher latency",
            Self::Virtual => "In-process virtual device without hardware",
        }
    }

    pub fn typical_latency_ms(self) -> f64 {
        match self {
            Self::Exclusive => 5.0,
            Self::Shared => 15.0,
            Self::Fallback => 30.0,
            Self::Virtual => 10.0,
        }
    }

    /// Exclusive and shared swap places; the others have no counterpart.
    pub fn alternative(self) -> Option<DriverType> {
        match self {
            Self::Exclusive => Some(Self::Shared),
            Self::Shared => Some(Self::Exclusive),
            Self::Fallback | Self::Virtual => None,
        }
    }
}

impl From<DriverMode> for DriverType {
    /// `Auto` prefers exclusive and relies on the manager's fallback order.
    fn from(mode: DriverMode) -> Self {
        match mode {
            DriverMode::Exclusive | DriverMode::Auto => Self::Exclusive,
            DriverMode::Shared => Self::Shared,
        }
    }
}

impl fmt::Display for DriverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Capability flags reported per backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DriverCapabilities(u32);

impl DriverCapabilities {
    pub const NONE: Self = Self(0);
    pub const PLAYBACK: Self = Self(1 << 0);
    pub const RECORDING: Self = Self(1 << 1);
    pub const DUPLEX: Self = Self(1 << 2);
    pub const SAMPLE_RATE_CONVERSION: Self = Self(1 << 3);
    pub const BIT_DEPTH_CONVERSION: Self = Self(1 << 4);
    pub const EXCLUSIVE_MODE: Self = Self(1 << 5);
    pub const EVENT_DRIVEN: Self = Self(1 << 6);
    pub const HOT_PLUG_DETECTION: Self = Self(1 << 7);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for DriverCapabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One native audio API mode behind a uniform interface.
///
/// Owned exclusively by a [`DeviceManager`](crate::DeviceManager). Every method
/// runs on a control thread; the backend's own audio thread never calls back
/// into it.
pub trait DriverBackend: Send {
    fn driver_type(&self) -> DriverType;

    fn capabilities(&self) -> DriverCapabilities;

    /// `Uninitialized → Initialized`. Idempotent.
    fn initialize(&mut self) -> Result<()>;

    /// Stop, close and release everything. Always ends `Uninitialized`.
    fn shutdown(&mut self);

    fn devices(&self) -> Result<Vec<DeviceInfo>>;

    fn is_available(&self) -> bool;

    /// Negotiate a format and acquire native handles. A failure leaves the
    /// backend `Initialized`.
    fn open_stream(&mut self, config: &StreamConfig, callback: SharedCallback) -> Result<()>;

    fn close_stream(&mut self);

    /// A failure leaves the stream open.
    fn start_stream(&mut self) -> Result<()>;

    /// Returns once the audio thread has exited (or was detached) and the
    /// device buffer holds silence.
    fn stop_stream(&mut self) -> Result<()>;

    fn is_stream_running(&self) -> bool;

    /// One-way output latency in seconds, 0 without a stream.
    fn stream_latency(&self) -> f64 {
        self.latency_info()
            .map(|info| info.output_latency_secs())
            .unwrap_or(0.0)
    }

    fn latency_info(&self) -> Option<LatencyInfo>;

    /// Negotiated rate, 0 without a stream.
    fn stream_sample_rate(&self) -> u32;

    /// Negotiated buffer size in frames, 0 without a stream.
    fn stream_buffer_size(&self) -> u32;

    fn statistics(&self) -> DriverStatistics;

    fn reset_statistics(&self);

    fn state(&self) -> DriverState;

    fn last_error(&self) -> Option<(DriverErrorKind, String)>;

    fn set_error_callback(&mut self, callback: ErrorCallback);

    /// Surface an error the audio thread reported. Returns each event once.
    fn poll_deferred_error(&mut self) -> Option<(DriverErrorKind, String)>;
}

/// State, last error and error listener shared by the backend implementations.
pub(crate) struct DriverStatus {
    driver_type: DriverType,
    state: AtomicDriverState,
    last_error: Mutex<Option<(DriverErrorKind, String)>>,
    error_callback: Option<ErrorCallback>,
}

impl DriverStatus {
    pub(crate) fn new(driver_type: DriverType) -> Self {
        Self {
            driver_type,
            state: AtomicDriverState::new(DriverState::Uninitialized),
            last_error: Mutex::new(None),
            error_callback: None,
        }
    }

    pub(crate) fn state(&self) -> DriverState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: DriverState) {
        self.state.set(state);
    }

    pub(crate) fn last_error(&self) -> Option<(DriverErrorKind, String)> {
        self.last_error.lock().clone()
    }

    pub(crate) fn set_error_callback(&mut self, callback: ErrorCallback) {
        self.error_callback = Some(callback);
    }

    /// Latch without notifying listeners.
    pub(crate) fn record(&self, kind: DriverErrorKind, message: &str) {
        *self.last_error.lock() = Some((kind, message.to_string()));
    }

    /// Latch `(kind, message)`, notify the listener for fatal kinds, and build
    /// the error to return.
    pub(crate) fn fail(&self, kind: DriverErrorKind, message: impl Into<String>) -> Error {
        let message = message.into();
        tracing::warn!(driver = %self.driver_type, ?kind, "{message}");
        self.record(kind, &message);
        if kind.is_fatal() {
            if let Some(callback) = &self.error_callback {
                callback(kind, &message);
            }
        }
        Error::driver(kind, message)
    }

    /// [`fail`](Self::fail) for an error built elsewhere.
    pub(crate) fn fail_with(&self, err: Error) -> Error {
        match err {
            Error::Driver { kind, message } => self.fail(kind, message),
            other => {
                let kind = other.kind();
                let message = other.to_string();
                self.fail(kind, message);
                other
            }
        }
    }

    pub(crate) fn require(&self, operation: &'static str, allowed: &[DriverState]) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(Error::InvalidState { operation, state })
        }
    }
}

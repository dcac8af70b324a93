//! Shared data model for the rondo real-time audio engine.
//!
//! # Primary API
//!
//! - [`StreamConfig`] / [`EngineConfig`]: Requested stream and engine settings
//! - [`command_queue`]: Lock-free UI → audio thread command channel
//! - [`AudioCallback`] / [`SharedCallback`]: The render capability backends call
//! - [`SmoothedValue`], [`constant_power_gains`]: Per-sample parameter handling
//! - [`StatisticsRecorder`], [`LatencyInfo`]: Timing figures for an open stream
//!
//! Everything here is usable from the audio thread except where a method says
//! otherwise.

pub mod error;
pub use error::{DriverErrorKind, Error, Result};

pub mod config;
pub use config::{DriverMode, EngineConfig, StreamConfig};

pub mod command;
pub use command::{
    command_queue, AudioCommand, CommandKind, CommandReceiver, CommandSender,
    DEFAULT_QUEUE_CAPACITY, NO_SEEK,
};

mod lockfree;
pub use lockfree::{AtomicCounter, AtomicDouble, AtomicFlag, AtomicFloat};

mod smooth;
pub use smooth::{SmoothedValue, DEFAULT_SMOOTHING_SECS};

mod pan;
pub use pan::constant_power_gains;

mod stats;
pub use stats::{DriverStatistics, StatisticsRecorder, STATS_EMA_ALPHA};

pub mod latency;
pub use latency::{buffer_period_ms, LatencyInfo};

pub mod device;
pub use device::DeviceInfo;

mod callback;
pub use callback::{AudioCallback, CallbackControl, SharedCallback, StreamFormat};

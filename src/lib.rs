//! Real-time audio engine core for a multi-track DAW.
//!
//! Gets sample-accurate audio to the device with bounded latency while control
//! threads adjust gain, pan, mute, solo and transport without ever sharing a
//! lock with the audio thread.
//!
//! # Primary API
//!
//! - [`RondoEngine`]: Engine facade (device manager + command queue + mixer)
//! - [`RondoEngineBuilder`]: Fluent configuration
//! - [`Track`] / [`AudioSource`]: What the mixer renders
//! - [`DeviceManager`]: Backend selection, fallback, reconfiguration with rollback
//! - [`EngineCore`]: The audio callback on its own, for custom hosts
//!
//! # Feature-gated APIs
//!
//! - `"cpal-backend"`: cross-platform fallback backend (enabled by default)
//! - `"parallel"`: worker-pool track rendering (enabled by default)
//!
//! # Example
//!
//! ```ignore
//! use rondo::prelude::*;
//!
//! let engine = RondoEngine::builder()
//!     .preferred_mode(DriverMode::Auto)
//!     .buffer_size(256)
//!     .build()?;
//!
//! engine.set_driver_mode_change_callback(|preferred, actual, reason| {
//!     eprintln!("{preferred} unavailable, using {actual}: {reason}");
//! });
//!
//! let tone = engine.add_track(Track::new("Tone").with_source(SineSource::new(440.0, 0.3)))?;
//! engine.start()?;
//! engine.play();
//!
//! engine.set_track_pan(tone, -0.5);
//! let (peak_l, peak_r) = engine.peak_levels();
//! ```

mod error;
pub use error::{Error, Result};

// Member crates
pub use rondo_core as core;
pub use rondo_driver as driver;
pub use rondo_mixer as mixer;

pub use rondo_core::{
    command_queue, AudioCallback, AudioCommand, CallbackControl, CommandKind, CommandReceiver,
    CommandSender, DeviceInfo, DriverErrorKind, DriverMode, DriverStatistics, EngineConfig,
    LatencyInfo, SharedCallback, StreamConfig, StreamFormat,
};

pub use rondo_driver::{
    DeviceManager, DriverBackend, DriverCapabilities, DriverState, DriverType,
    VirtualDeviceSpec, VirtualHost,
};

pub use rondo_mixer::{AudioSource, MixerBus, SineSource, Track, TrackId, TrackParams};

mod master;
pub use master::{soft_clip, OutputMeters, DC_BLOCKER_R, HARD_LIMIT};

mod preview;
pub use preview::DEFAULT_PREVIEW_SLOTS;

mod tap;
pub use tap::OutputTap;

mod render;
pub use render::EngineCore;

mod watchdog;
pub use watchdog::DEFAULT_WATCHDOG_INTERVAL;

mod builder;
mod engine;

pub use builder::RondoEngineBuilder;
pub use engine::RondoEngine;

/// Convenience prelude for common imports
pub mod prelude {
    // Main engine
    pub use crate::{RondoEngine, RondoEngineBuilder};

    // Configuration
    pub use crate::{DriverMode, DriverType, EngineConfig, StreamConfig};

    // Mixing
    pub use crate::{AudioSource, SineSource, Track, TrackId};

    // Commands
    pub use crate::{AudioCommand, CommandKind};

    // Output
    pub use crate::OutputTap;

    // Errors
    pub use crate::{DriverErrorKind, Error, Result};
}

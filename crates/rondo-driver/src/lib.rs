//! Audio driver backends and the device manager.
//!
//! # Primary API
//!
//! - [`DeviceManager`]: Owns the backends, opens with fallback, reconfigures with rollback
//! - [`DriverBackend`]: Uniform contract every backend implements
//! - [`EventDrivenBackend`]: Exclusive/shared negotiation over an [`EndpointHost`]
//! - [`VirtualHost`]: In-process device host for headless use and tests
//!
//! # Feature-gated APIs
//!
//! - `"cpal-backend"`: [`CpalBackend`], the generic fallback (enabled by default)
//! - Windows: [`WasapiHost`] endpoint
//!
//! # Example
//!
//! ```ignore
//! use rondo_driver::{DeviceManager, DriverType};
//! use rondo_core::{CallbackControl, SharedCallback, StreamConfig};
//!
//! let mut manager = DeviceManager::with_platform_backends();
//! manager.initialize()?;
//! manager.set_preferred_driver_type(DriverType::Shared);
//!
//! let callback = SharedCallback::from_fn(|out: &mut [f32], _, _, _| {
//!     out.fill(0.0);
//!     CallbackControl::Continue
//! });
//! manager.open_stream(&StreamConfig::default(), callback)?;
//! manager.start_stream()?;
//! ```

pub mod error;
pub use error::{Error, Result};

mod state;
pub use state::DriverState;

mod backend;
pub use backend::{DriverBackend, DriverCapabilities, DriverType, ErrorCallback};

pub mod convert;
pub use convert::SampleFormat;

mod deferred;
pub use deferred::DeferredError;

pub mod endpoint;
pub use endpoint::{
    AudioClient, CaptureClient, EndpointHost, EnginePeriod, NativeError, RenderClient, ShareMode,
    WaveFormat,
};

mod event;
pub use event::{AudioEvent, ReadyEvent, WaitOutcome};

mod rt_thread;
pub use rt_thread::{EVENT_WAIT_TIMEOUT, JOIN_TIMEOUT};

mod event_driven;
pub use event_driven::EventDrivenBackend;

pub mod virtual_host;
pub use virtual_host::{VirtualDeviceSpec, VirtualHost};

#[cfg(feature = "cpal-backend")]
mod cpal_backend;
#[cfg(feature = "cpal-backend")]
pub use cpal_backend::CpalBackend;

#[cfg(windows)]
mod wasapi;
#[cfg(windows)]
pub use wasapi::{WasapiEvent, WasapiHost};

mod manager;
pub use manager::{
    next_buffer_step, DeviceManager, ModeChangeCallback, StreamErrorCallback,
    DEFAULT_SCALING_INTERVAL, MIN_RECONFIGURE_BUFFER, SCALING_LADDER,
};

//! Builder for configuring and constructing a `RondoEngine`.

use crate::preview::DEFAULT_PREVIEW_SLOTS;
use crate::render::EngineCore;
use crate::watchdog::DEFAULT_WATCHDOG_INTERVAL;
use crate::{Result, RondoEngine};
use rondo_core::{command_queue, DriverErrorKind, DriverMode, EngineConfig};
use rondo_driver::{
    DeviceManager, DriverType, ModeChangeCallback, StreamErrorCallback, VirtualHost,
};
use std::sync::Arc;
use std::time::Duration;

/// Without an explicit device manager or virtual host, the platform backends
/// are registered (WASAPI exclusive/shared on Windows, plus the cpal fallback
/// when the `cpal-backend` feature is on).
///
/// `build` initializes the manager and opens the stream, so the actual sample
/// rate and buffer size are known afterwards. It does not start the audio
/// thread; call `engine.start()`.
///
/// # Example
///
/// ```ignore
/// use rondo::prelude::*;
///
/// let engine = RondoEngine::builder()
///     .preferred_mode(DriverMode::Shared)
///     .buffer_size(256)
///     .outputs(2)
///     .build()?;
///
/// let sr = engine.sample_rate(); // e.g. 44100 or 48000
/// ```
pub struct RondoEngineBuilder {
    config: EngineConfig,
    manager: Option<DeviceManager>,
    virtual_host: Option<VirtualHost>,
    preview_slots: usize,
    watchdog_interval: Duration,
    auto_scaling_interval: Option<Duration>,
    safety_processing: bool,
    mode_change: Option<ModeChangeCallback>,
    stream_error: Option<StreamErrorCallback>,
}

impl Default for RondoEngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            manager: None,
            virtual_host: None,
            preview_slots: DEFAULT_PREVIEW_SLOTS,
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            auto_scaling_interval: None,
            safety_processing: false,
            mode_change: None,
            stream_error: None,
        }
    }
}

impl RondoEngineBuilder {
    /// Replace every config field at once.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn device(mut self, device_id: u32) -> Self {
        self.config.device_id = Some(device_id);
        self
    }

    /// Default: 48000
    pub fn sample_rate(mut self, sample_rate: u32) -> Self {
        self.config.sample_rate = sample_rate;
        self
    }

    /// Default: 512
    pub fn buffer_size(mut self, frames: u32) -> Self {
        self.config.buffer_size = frames;
        self
    }

    /// Default: 0
    pub fn inputs(mut self, channels: u16) -> Self {
        self.config.input_channels = channels;
        self
    }

    /// Default: 2
    pub fn outputs(mut self, channels: u16) -> Self {
        self.config.output_channels = channels;
        self
    }

    /// Default: `Auto` (exclusive, falling back to shared)
    pub fn preferred_mode(mut self, mode: DriverMode) -> Self {
        self.config.preferred_mode = mode;
        self
    }

    pub fn release_in_background(mut self, enabled: bool) -> Self {
        self.config.release_in_background = enabled;
        self
    }

    /// Double the buffer when underruns per window exceed `threshold`.
    pub fn auto_buffer_scaling(mut self, enabled: bool, threshold: u32) -> Self {
        self.config.auto_buffer_scaling = enabled;
        self.config.underrun_threshold_per_min = threshold;
        self
    }

    /// Underrun window for auto scaling. Default: one minute.
    pub fn auto_scaling_interval(mut self, interval: Duration) -> Self {
        self.auto_scaling_interval = Some(interval);
        self
    }

    /// Render tracks on a worker pool once `threshold` tracks exist.
    pub fn parallel(mut self, enabled: bool, threshold: usize) -> Self {
        self.config.parallel_processing = enabled;
        self.config.parallel_threshold = threshold;
        self
    }

    /// Default: 1024
    pub fn command_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.command_queue_capacity = capacity;
        self
    }

    /// Default: 16
    pub fn preview_slots(mut self, slots: usize) -> Self {
        self.preview_slots = slots;
        self
    }

    /// DC blocker and soft clipper on the master output. Default: off
    pub fn safety_processing(mut self, enabled: bool) -> Self {
        self.safety_processing = enabled;
        self
    }

    /// How often the watchdog polls for errors. Default: 100 ms
    pub fn watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    /// Run on in-process virtual devices instead of hardware.
    pub fn virtual_device(mut self, host: VirtualHost) -> Self {
        self.virtual_host = Some(host);
        self
    }

    /// Use a manager with custom backends. Takes precedence over
    /// [`virtual_device`](Self::virtual_device).
    pub fn device_manager(mut self, manager: DeviceManager) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Installed before the first open, so a fallback during `build` is reported.
    pub fn on_driver_mode_change(
        mut self,
        callback: impl Fn(DriverType, DriverType, &str) + Send + Sync + 'static,
    ) -> Self {
        self.mode_change = Some(Box::new(callback));
        self
    }

    pub fn on_stream_error(
        mut self,
        callback: impl Fn(DriverErrorKind, &str) + Send + Sync + 'static,
    ) -> Self {
        self.stream_error = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Result<RondoEngine> {
        let config = self.config;
        config.validate()?;

        let mut manager = match (self.manager, self.virtual_host) {
            (Some(manager), _) => manager,
            (None, Some(host)) => DeviceManager::with_virtual_host(host),
            (None, None) => DeviceManager::with_platform_backends(),
        };
        manager.set_preferred_driver_type(config.preferred_mode.into());
        manager.set_auto_buffer_scaling(
            config.auto_buffer_scaling,
            config.underrun_threshold_per_min,
        );
        if let Some(interval) = self.auto_scaling_interval {
            manager.set_auto_scaling_interval(interval);
        }
        if let Some(callback) = self.mode_change {
            manager.set_driver_mode_change_callback(callback);
        }
        if let Some(callback) = self.stream_error {
            manager.set_stream_error_callback(callback);
        }
        manager.initialize()?;

        let (sender, receiver) = command_queue(config.command_queue_capacity);
        let core = EngineCore::with_preview_slots(&config, receiver, self.preview_slots)?;

        let engine = RondoEngine::from_parts(
            manager,
            core,
            sender,
            config.clone(),
            self.watchdog_interval,
        )?;
        engine.set_safety_processing(self.safety_processing);

        // Reconfiguration and resume reuse the config this open stores
        engine.open_with(&config.stream_config())?;

        tracing::info!(
            rate = engine.sample_rate(),
            frames = engine.buffer_size(),
            driver = ?engine.active_driver_type(),
            "engine built"
        );
        Ok(engine)
    }
}

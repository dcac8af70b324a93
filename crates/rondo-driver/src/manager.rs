//! Device manager: owns the registered backends and designates one as active.

use crate::backend::{DriverBackend, DriverType};
use crate::state::DriverState;
use crate::{Error, Result};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use rondo_core::config::{DEFAULT_UNDERRUN_THRESHOLD, MAX_BUFFER_SIZE};
use rondo_core::{
    DeviceInfo, DriverErrorKind, DriverStatistics, LatencyInfo, SharedCallback, StreamConfig,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Buffer sizes auto-scaling steps through. Upward only.
pub const SCALING_LADDER: [u32; 5] = [64, 128, 256, 512, 1024];

/// Smallest buffer `set_buffer_size` accepts.
pub const MIN_RECONFIGURE_BUFFER: u32 = 64;

pub const DEFAULT_SCALING_INTERVAL: Duration = Duration::from_secs(60);

/// `(preferred, actual, reason)`, fired when the manager falls back.
pub type ModeChangeCallback = Box<dyn Fn(DriverType, DriverType, &str) + Send + Sync>;

/// Fatal stream errors after start. Invoked on a control thread.
pub type StreamErrorCallback = Arc<dyn Fn(DriverErrorKind, &str) + Send + Sync>;

/// Next ladder step above `current`, `None` at the top.
pub fn next_buffer_step(current: u32) -> Option<u32> {
    SCALING_LADDER.iter().copied().find(|&step| step > current)
}

/// Latched error slot plus listener, shared with every backend's error callback.
#[derive(Default)]
struct ErrorSink {
    latched: ArcSwapOption<(DriverErrorKind, String)>,
    listener: Mutex<Option<StreamErrorCallback>>,
    /// Listener only hears about errors while a stream is started.
    streaming: AtomicBool,
}

impl ErrorSink {
    fn latch(&self, kind: DriverErrorKind, message: &str) {
        self.latched
            .store(Some(Arc::new((kind, message.to_string()))));
    }

    fn notify(&self, kind: DriverErrorKind, message: &str) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener(kind, message);
        }
    }

    fn dispatch(&self, kind: DriverErrorKind, message: &str) {
        self.latch(kind, message);
        if self.streaming.load(Ordering::Acquire) {
            self.notify(kind, message);
        }
    }
}

struct AutoScaling {
    enabled: bool,
    threshold: u32,
    interval: Duration,
    last_check: Instant,
    baseline: u64,
}

#[derive(Clone, Copy)]
struct Suspended {
    was_open: bool,
    was_running: bool,
}

/// Holds the platform backends and routes every stream operation to the
/// active one.
///
/// Open order is the preferred type, its exclusive/shared counterpart, the
/// generic fallback, then the virtual device. Reconfiguration follows
/// save → stop → close → re-open, rolling back to the last good config on
/// failure.
pub struct DeviceManager {
    backends: Vec<Box<dyn DriverBackend>>,
    active: Option<usize>,
    preferred: DriverType,
    config: StreamConfig,
    callback: Option<SharedCallback>,
    fallback_reason: Option<String>,
    mode_change: Option<ModeChangeCallback>,
    errors: Arc<ErrorSink>,
    scaling: AutoScaling,
    suspended: Option<Suspended>,
    initialized: bool,
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceManager {
    /// Empty manager. Register backends before `initialize`.
    pub fn new() -> Self {
        Self {
            backends: Vec::new(),
            active: None,
            preferred: DriverType::Exclusive,
            config: StreamConfig::default(),
            callback: None,
            fallback_reason: None,
            mode_change: None,
            errors: Arc::new(ErrorSink::default()),
            scaling: AutoScaling {
                enabled: false,
                threshold: DEFAULT_UNDERRUN_THRESHOLD,
                interval: DEFAULT_SCALING_INTERVAL,
                last_check: Instant::now(),
                baseline: 0,
            },
            suspended: None,
            initialized: false,
        }
    }

    /// Backends native to this host: the Windows endpoint pair where present,
    /// then the cpal fallback when that feature is enabled.
    pub fn with_platform_backends() -> Self {
        #[allow(unused_mut)]
        let mut manager = Self::new();

        #[cfg(windows)]
        {
            use crate::event_driven::EventDrivenBackend;
            use crate::wasapi::WasapiHost;
            manager.register(Box::new(EventDrivenBackend::exclusive(WasapiHost::new())));
            manager.register(Box::new(EventDrivenBackend::shared(WasapiHost::new())));
        }

        #[cfg(feature = "cpal-backend")]
        manager.register(Box::new(crate::cpal_backend::CpalBackend::new()));

        manager
    }

    /// Exclusive, shared and headless slots all served by one virtual host.
    pub fn with_virtual_host(host: crate::VirtualHost) -> Self {
        use crate::event_driven::EventDrivenBackend;

        let mut manager = Self::new();
        manager.register(Box::new(EventDrivenBackend::exclusive(host.clone())));
        manager.register(Box::new(EventDrivenBackend::shared(host.clone())));
        manager.register(Box::new(
            EventDrivenBackend::shared(host).with_driver_type(DriverType::Virtual),
        ));
        manager
    }

    /// Add a backend. A second backend of the same type replaces the first.
    pub fn register(&mut self, mut backend: Box<dyn DriverBackend>) {
        let sink = Arc::clone(&self.errors);
        backend.set_error_callback(Box::new(move |kind, message| sink.dispatch(kind, message)));

        let driver_type = backend.driver_type();
        if let Some(index) = self.index_of(driver_type) {
            if self.active == Some(index) {
                self.close_stream();
            }
            self.backends[index].shutdown();
            self.backends[index] = backend;
        } else {
            let active_type = self.active_driver_type();
            self.backends.push(backend);
            self.backends.sort_by_key(|b| b.driver_type().priority());
            self.active = active_type.and_then(|t| self.index_of(t));
        }
        if self.initialized {
            if let Some(index) = self.index_of(driver_type) {
                if let Err(err) = self.backends[index].initialize() {
                    warn!(driver = %driver_type, "backend unavailable: {err}");
                }
            }
        }
    }

    fn index_of(&self, driver_type: DriverType) -> Option<usize> {
        self.backends
            .iter()
            .position(|b| b.driver_type() == driver_type)
    }

    fn active_backend(&self) -> Option<&dyn DriverBackend> {
        self.active.map(|i| self.backends[i].as_ref())
    }

    /// Initialize every registered backend. Succeeds if at least one is usable.
    pub fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        let mut usable = 0;
        for backend in &mut self.backends {
            match backend.initialize() {
                Ok(()) => usable += 1,
                Err(err) => {
                    debug!(driver = %backend.driver_type(), "backend unavailable: {err}")
                }
            }
        }
        if usable == 0 {
            self.errors.latch(
                DriverErrorKind::InitializationFailed,
                "no driver backend available",
            );
            return Err(Error::NoBackend);
        }
        self.initialized = true;
        info!(
            available = ?self.available_driver_types(),
            "device manager initialized"
        );
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.close_stream();
        for backend in &mut self.backends {
            backend.shutdown();
        }
        self.suspended = None;
        self.initialized = false;
        debug!("device manager shut down");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn usable(backend: &dyn DriverBackend) -> bool {
        backend.state() != DriverState::Uninitialized && backend.is_available()
    }

    /// Devices of the active backend, or of the best usable one.
    pub fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let backend = match self.active_backend() {
            Some(backend) => backend,
            None => self
                .backends
                .iter()
                .map(|b| b.as_ref())
                .find(|b| Self::usable(*b))
                .ok_or(Error::NoBackend)?,
        };
        backend.devices()
    }

    pub fn default_output_device(&self) -> Option<DeviceInfo> {
        let devices = self.devices().ok()?;
        rondo_core::device::default_output(&devices).cloned()
    }

    pub fn default_input_device(&self) -> Option<DeviceInfo> {
        let devices = self.devices().ok()?;
        rondo_core::device::default_input(&devices).cloned()
    }

    /// Whether `device_id` exists and advertises `sample_rate`.
    pub fn validate_device_config(&self, device_id: u32, sample_rate: u32) -> bool {
        self.devices()
            .map(|devices| {
                devices
                    .iter()
                    .any(|d| d.id == device_id && d.supports_rate(sample_rate))
            })
            .unwrap_or(false)
    }

    fn open_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(DriverType::ALL.len());
        let candidates = [
            Some(self.preferred),
            self.preferred.alternative(),
            Some(DriverType::Fallback),
            Some(DriverType::Virtual),
        ];
        for driver_type in candidates.into_iter().flatten() {
            if let Some(index) = self.index_of(driver_type) {
                if !order.contains(&index) && Self::usable(self.backends[index].as_ref()) {
                    order.push(index);
                }
            }
        }
        order
    }

    /// Open on the first backend that accepts `config`, in fallback order.
    pub fn open_stream(&mut self, config: &StreamConfig, callback: SharedCallback) -> Result<()> {
        if !self.initialized {
            return Err(Error::InvalidState {
                operation: "open_stream",
                state: DriverState::Uninitialized,
            });
        }
        config.validate()?;
        self.close_stream();

        let order = self.open_order();
        let mut reasons = Vec::new();
        let mut last_err = None;

        for index in order {
            let backend = &mut self.backends[index];
            let driver_type = backend.driver_type();
            match backend.open_stream(config, callback.clone()) {
                Ok(()) => {
                    self.active = Some(index);
                    break;
                }
                Err(err) => {
                    info!(driver = %driver_type, "open failed, trying next backend: {err}");
                    reasons.push(format!("{driver_type}: {err}"));
                    last_err = Some(err);
                }
            }
        }

        let Some(index) = self.active else {
            let err = last_err.unwrap_or(Error::NoBackend);
            error!("no backend could open the stream: {err}");
            self.errors.latch(err.kind(), &err.to_string());
            return Err(err);
        };

        let actual = self.backends[index].driver_type();
        // Keep the rate the device actually runs at; the buffer size stays a request
        self.config = StreamConfig {
            sample_rate: self.backends[index].stream_sample_rate(),
            ..*config
        };
        self.callback = Some(callback);
        self.scaling.baseline = 0;
        self.scaling.last_check = Instant::now();

        if actual != self.preferred {
            let reason = if reasons.is_empty() {
                format!("{} not registered or unavailable", self.preferred)
            } else {
                reasons.join("; ")
            };
            warn!(preferred = %self.preferred, %actual, "falling back: {reason}");
            if let Some(notify) = &self.mode_change {
                notify(self.preferred, actual, &reason);
            }
            self.fallback_reason = Some(reason);
        } else {
            self.fallback_reason = None;
        }

        let backend = &self.backends[index];
        info!(
            driver = %actual,
            rate = backend.stream_sample_rate(),
            frames = backend.stream_buffer_size(),
            "stream opened"
        );
        Ok(())
    }

    pub fn close_stream(&mut self) {
        if let Some(index) = self.active.take() {
            self.errors.streaming.store(false, Ordering::Release);
            self.backends[index].close_stream();
            debug!(driver = %self.backends[index].driver_type(), "stream closed");
        }
    }

    pub fn start_stream(&mut self) -> Result<()> {
        let index = self.active.ok_or(Error::NoStream)?;
        self.backends[index].start_stream()?;
        self.errors.streaming.store(true, Ordering::Release);
        self.scaling.last_check = Instant::now();
        Ok(())
    }

    pub fn stop_stream(&mut self) -> Result<()> {
        let Some(index) = self.active else {
            return Ok(());
        };
        self.errors.streaming.store(false, Ordering::Release);
        self.backends[index].stop_stream()
    }

    pub fn is_stream_open(&self) -> bool {
        self.active_backend()
            .is_some_and(|b| b.state().has_stream())
    }

    pub fn is_stream_running(&self) -> bool {
        self.active_backend().is_some_and(|b| b.is_stream_running())
    }

    /// Move to another device, rolling back on failure.
    pub fn switch_device(&mut self, device_id: u32) -> Result<()> {
        self.reconfigure("switch_device", |config| config.device_id = Some(device_id))
    }

    /// Rejected without touching the stream when the target device does not
    /// advertise `sample_rate`.
    pub fn set_sample_rate(&mut self, sample_rate: u32) -> Result<()> {
        if self.initialized {
            let device = self
                .config
                .device_id
                .or_else(|| self.default_output_device().map(|d| d.id));
            if let Some(device) = device {
                if !self.validate_device_config(device, sample_rate) {
                    let err = Error::driver(
                        DriverErrorKind::SampleRateMismatch,
                        format!("device {device} does not support {sample_rate} Hz"),
                    );
                    warn!("set_sample_rate rejected: {err}");
                    self.errors.latch(err.kind(), &err.to_string());
                    return Err(err);
                }
            }
        }
        self.reconfigure("set_sample_rate", |config| config.sample_rate = sample_rate)
    }

    pub fn set_buffer_size(&mut self, frames: u32) -> Result<()> {
        if !(MIN_RECONFIGURE_BUFFER..=MAX_BUFFER_SIZE).contains(&frames) {
            return Err(rondo_core::Error::InvalidBufferSize(frames).into());
        }
        self.reconfigure("set_buffer_size", |config| config.buffer_size = frames)
    }

    fn reconfigure(
        &mut self,
        operation: &'static str,
        apply: impl FnOnce(&mut StreamConfig),
    ) -> Result<()> {
        let previous = self.config;
        let mut working = previous;
        apply(&mut working);
        working.validate()?;

        let callback = match (&self.callback, self.active) {
            (Some(callback), Some(_)) => callback.clone(),
            // Nothing open: the change applies to the next open
            _ => {
                self.config = working;
                return Ok(());
            }
        };
        if working == previous {
            return Ok(());
        }

        let was_running = self.is_stream_running();
        info!(operation, ?working, was_running, "reconfiguring stream");

        if let Err(err) = self.stop_stream() {
            warn!(operation, "stop failed during reconfigure: {err}");
        }
        self.close_stream();

        let reopened = self
            .open_stream(&working, callback.clone())
            .and_then(|()| self.ensure_rate(working.sample_rate));
        match reopened {
            Ok(()) => {
                if was_running {
                    self.start_stream()?;
                }
                Ok(())
            }
            Err(err) => {
                warn!(operation, "reconfigure failed, rolling back: {err}");
                self.errors.latch(err.kind(), &err.to_string());
                match self.open_stream(&previous, callback) {
                    Ok(()) => {
                        if was_running {
                            self.start_stream()?;
                        }
                        Err(err)
                    }
                    Err(rollback_err) => {
                        let message =
                            format!("{operation} failed ({err}) and rollback failed ({rollback_err})");
                        error!("{message}");
                        self.errors.latch(rollback_err.kind(), &message);
                        self.errors.notify(rollback_err.kind(), &message);
                        Err(rollback_err)
                    }
                }
            }
        }
    }

    /// Close a stream that came up at a rate other than `requested`.
    fn ensure_rate(&mut self, requested: u32) -> Result<()> {
        let negotiated = self.stream_sample_rate();
        if negotiated == requested {
            return Ok(());
        }
        self.close_stream();
        Err(Error::driver(
            DriverErrorKind::SampleRateMismatch,
            format!("requested {requested} Hz, device runs at {negotiated} Hz"),
        ))
    }

    /// Takes effect on the next `open_stream`.
    pub fn set_preferred_driver_type(&mut self, driver_type: DriverType) {
        self.preferred = driver_type;
    }

    pub fn preferred_driver_type(&self) -> DriverType {
        self.preferred
    }

    pub fn is_driver_type_available(&self, driver_type: DriverType) -> bool {
        self.index_of(driver_type)
            .is_some_and(|i| self.backends[i].is_available())
    }

    /// The active backend is not the preferred one.
    pub fn is_using_fallback_driver(&self) -> bool {
        self.active_driver_type()
            .is_some_and(|actual| actual != self.preferred)
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        self.fallback_reason.as_deref()
    }

    pub fn active_driver_type(&self) -> Option<DriverType> {
        self.active_backend().map(|b| b.driver_type())
    }

    pub fn available_driver_types(&self) -> Vec<DriverType> {
        self.backends
            .iter()
            .filter(|b| b.is_available())
            .map(|b| b.driver_type())
            .collect()
    }

    pub fn set_auto_buffer_scaling(&mut self, enabled: bool, underrun_threshold: u32) {
        self.scaling.enabled = enabled;
        self.scaling.threshold = underrun_threshold;
        self.scaling.last_check = Instant::now();
        self.scaling.baseline = self.statistics().underrun_count;
    }

    /// Window over which underruns are counted. One minute by default.
    pub fn set_auto_scaling_interval(&mut self, interval: Duration) {
        self.scaling.interval = interval;
    }

    /// Step the buffer up the ladder if the last window saw too many
    /// underruns. Returns whether the buffer size changed.
    pub fn check_and_auto_scale_buffer(&mut self) -> Result<bool> {
        if !self.scaling.enabled || !self.is_stream_running() {
            return Ok(false);
        }
        if self.scaling.last_check.elapsed() < self.scaling.interval {
            return Ok(false);
        }

        let underruns = self.statistics().underrun_count;
        let delta = underruns.saturating_sub(self.scaling.baseline);
        self.scaling.baseline = underruns;
        self.scaling.last_check = Instant::now();

        if delta <= u64::from(self.scaling.threshold) {
            return Ok(false);
        }
        let current = self.stream_buffer_size().max(self.config.buffer_size);
        let Some(next) = next_buffer_step(current) else {
            debug!(current, "buffer already at the top of the scaling ladder");
            return Ok(false);
        };

        warn!(underruns = delta, from = current, to = next, "auto-scaling buffer size");
        self.set_buffer_size(next)?;
        Ok(true)
    }

    /// Release the device. Idempotent.
    pub fn suspend_audio(&mut self) -> Result<()> {
        if self.suspended.is_some() {
            return Ok(());
        }
        let state = Suspended {
            was_open: self.active.is_some(),
            was_running: self.is_stream_running(),
        };
        if let Err(err) = self.stop_stream() {
            warn!("stop failed during suspend: {err}");
        }
        self.close_stream();
        self.suspended = Some(state);
        info!(was_running = state.was_running, "audio suspended");
        Ok(())
    }

    /// Re-open with the stored config and restart if it was running. Idempotent.
    pub fn resume_audio(&mut self) -> Result<()> {
        let Some(state) = self.suspended.take() else {
            return Ok(());
        };
        if state.was_open {
            if let Some(callback) = self.callback.clone() {
                let config = self.config;
                if let Err(err) = self.open_stream(&config, callback) {
                    self.suspended = Some(state);
                    return Err(err);
                }
                if state.was_running {
                    self.start_stream()?;
                }
            }
        }
        info!("audio resumed");
        Ok(())
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.is_some()
    }

    pub fn set_driver_mode_change_callback(&mut self, callback: ModeChangeCallback) {
        self.mode_change = Some(callback);
    }

    pub fn set_stream_error_callback(&mut self, callback: StreamErrorCallback) {
        *self.errors.listener.lock() = Some(callback);
    }

    /// Surface a deferred error from the active backend. The backend's error
    /// callback has already latched and forwarded it.
    pub fn poll_errors(&mut self) -> Option<(DriverErrorKind, String)> {
        let index = self.active?;
        let surfaced = self.backends[index].poll_deferred_error();
        if surfaced.is_some() {
            self.errors.streaming.store(false, Ordering::Release);
        }
        surfaced
    }

    pub fn latched_error(&self) -> Option<(DriverErrorKind, String)> {
        self.errors.latched.load_full().map(|e| (*e).clone())
    }

    pub fn clear_latched_error(&self) {
        self.errors.latched.store(None);
    }

    /// State of the active backend, `Uninitialized` when none is active.
    pub fn state(&self) -> DriverState {
        self.active_backend()
            .map_or(DriverState::Uninitialized, |b| b.state())
    }

    pub fn statistics(&self) -> DriverStatistics {
        self.active_backend()
            .map(|b| b.statistics())
            .unwrap_or_default()
    }

    pub fn reset_statistics(&mut self) {
        if let Some(backend) = self.active_backend() {
            backend.reset_statistics();
        }
        self.scaling.baseline = 0;
    }

    /// One-way output latency in seconds.
    pub fn stream_latency(&self) -> f64 {
        self.active_backend().map_or(0.0, |b| b.stream_latency())
    }

    pub fn latency_info(&self) -> Option<LatencyInfo> {
        self.active_backend().and_then(|b| b.latency_info())
    }

    /// `(input_ms, output_ms)` for recording alignment.
    pub fn latency_compensation(&self) -> (f64, f64) {
        self.latency_info()
            .map_or((0.0, 0.0), |l| (l.input_latency_ms, l.output_latency_ms))
    }

    pub fn stream_sample_rate(&self) -> u32 {
        self.active_backend().map_or(0, |b| b.stream_sample_rate())
    }

    pub fn stream_buffer_size(&self) -> u32 {
        self.active_backend().map_or(0, |b| b.stream_buffer_size())
    }

    /// Last config a stream opened with (or the pending one if none is open).
    pub fn current_config(&self) -> StreamConfig {
        self.config
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! Event-driven backend over an [`EndpointHost`].
//!
//! One instance drives one share mode. Exclusive mode probes native formats in
//! priority order; shared mode takes the OS mixer format and the smallest engine
//! period that holds the requested buffer.

use crate::backend::{DriverBackend, DriverCapabilities, DriverStatus, DriverType, ErrorCallback};
use crate::convert::SampleFormat;
use crate::deferred::{format_message, DeferredError};
use crate::endpoint::{
    AudioClient, CaptureClient, EndpointHost, RenderClient, ShareMode, WaveFormat,
};
use crate::event::ReadyEvent;
use crate::rt_thread::{AudioThread, RenderContext, EVENT_WAIT_TIMEOUT, JOIN_TIMEOUT};
use crate::state::DriverState;
use crate::{Error, Result};
use rondo_core::{
    DeviceInfo, DriverErrorKind, DriverStatistics, LatencyInfo, SharedCallback,
    StatisticsRecorder, StreamConfig, StreamFormat,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Rates tried after the requested and device-preferred ones.
const EXCLUSIVE_FALLBACK_RATES: [u32; 2] = [48_000, 44_100];

struct Negotiated {
    event: Arc<dyn ReadyEvent>,
    client: Box<dyn AudioClient>,
    format: WaveFormat,
    buffer_frames: u32,
    latency: LatencyInfo,
}

struct OpenStream {
    event: Arc<dyn ReadyEvent>,
    /// `None` while the audio thread owns it.
    render: Option<Box<dyn RenderClient>>,
    capture: Option<Box<dyn CaptureClient>>,
    client: Box<dyn AudioClient>,
    callback: SharedCallback,
    format: WaveFormat,
    input_channels: u16,
    buffer_frames: u32,
    latency: LatencyInfo,
    thread: Option<AudioThread>,
    should_stop: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
    scratch: Option<(Vec<f32>, Vec<f32>)>,
}

impl OpenStream {
    /// Release handles in reverse order of acquisition.
    fn release(self) {
        let OpenStream {
            event,
            render,
            capture,
            client,
            ..
        } = self;
        drop(event);
        drop(capture);
        drop(render);
        drop(client);
    }
}

/// Backend for an event-driven native API.
pub struct EventDrivenBackend<H: EndpointHost> {
    host: H,
    mode: ShareMode,
    driver_type: DriverType,
    status: DriverStatus,
    stats: Arc<StatisticsRecorder>,
    deferred: Arc<DeferredError>,
    stream: Option<OpenStream>,
    wait_timeout: Duration,
    join_timeout: Duration,
}

impl<H: EndpointHost> EventDrivenBackend<H> {
    pub fn new(host: H, mode: ShareMode) -> Self {
        let driver_type = match mode {
            ShareMode::Exclusive => DriverType::Exclusive,
            ShareMode::Shared => DriverType::Shared,
        };
        Self {
            host,
            mode,
            driver_type,
            status: DriverStatus::new(driver_type),
            stats: Arc::new(StatisticsRecorder::new()),
            deferred: Arc::new(DeferredError::new()),
            stream: None,
            wait_timeout: EVENT_WAIT_TIMEOUT,
            join_timeout: JOIN_TIMEOUT,
        }
    }

    pub fn exclusive(host: H) -> Self {
        Self::new(host, ShareMode::Exclusive)
    }

    pub fn shared(host: H) -> Self {
        Self::new(host, ShareMode::Shared)
    }

    /// Register under a different catalogue slot, e.g. [`DriverType::Virtual`].
    pub fn with_driver_type(mut self, driver_type: DriverType) -> Self {
        self.driver_type = driver_type;
        self.status = DriverStatus::new(driver_type);
        self
    }

    pub fn with_timeouts(mut self, wait: Duration, join: Duration) -> Self {
        self.wait_timeout = wait;
        self.join_timeout = join;
        self
    }

    pub fn share_mode(&self) -> ShareMode {
        self.mode
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Negotiated native format.
    pub fn native_format(&self) -> Option<WaveFormat> {
        self.stream.as_ref().map(|s| s.format)
    }

    fn activate(&self, config: &StreamConfig) -> Result<(Box<dyn AudioClient>, DeviceInfo)> {
        let client = self.host.activate(config.device_id)?;
        let info = client.device_info().clone();

        if config.output_channels > info.max_output_channels {
            return Err(Error::driver(
                DriverErrorKind::UnsupportedFormat,
                format!(
                    "'{}' has {} output channels, {} requested",
                    info.name, info.max_output_channels, config.output_channels
                ),
            ));
        }
        if config.input_channels > info.max_input_channels {
            return Err(Error::driver(
                DriverErrorKind::UnsupportedFormat,
                format!(
                    "'{}' has {} input channels, {} requested",
                    info.name, info.max_input_channels, config.input_channels
                ),
            ));
        }
        Ok((client, info))
    }

    fn negotiate_exclusive(&self, config: &StreamConfig) -> Result<Negotiated> {
        let (mut client, info) = self.activate(config)?;

        let mut rates = Vec::with_capacity(4);
        for rate in [config.sample_rate, info.preferred_sample_rate]
            .into_iter()
            .chain(EXCLUSIVE_FALLBACK_RATES)
        {
            if rate != 0 && !rates.contains(&rate) {
                rates.push(rate);
            }
        }

        let format = rates
            .iter()
            .flat_map(|&rate| {
                SampleFormat::PREFERENCE
                    .iter()
                    .map(move |&fmt| WaveFormat::new(rate, config.output_channels, fmt))
            })
            .find(|candidate| client.is_format_supported(ShareMode::Exclusive, candidate))
            .ok_or_else(|| {
                Error::driver(
                    DriverErrorKind::UnsupportedFormat,
                    format!(
                        "no exclusive format for {} Hz x {} ch on '{}'",
                        config.sample_rate, config.output_channels, info.name
                    ),
                )
            })?;

        if format.sample_rate != config.sample_rate {
            info!(
                requested = config.sample_rate,
                actual = format.sample_rate,
                "exclusive probe settled on a different rate"
            );
        }

        let event = self.host.create_event()?;
        let buffer_frames = client.initialize(
            ShareMode::Exclusive,
            &format,
            config.buffer_size,
            config.input_channels,
            Arc::clone(&event),
        )?;
        let latency = LatencyInfo::measured(
            buffer_frames,
            format.sample_rate,
            client.stream_latency_ms().unwrap_or(0.0),
        );

        Ok(Negotiated {
            event,
            client,
            format,
            buffer_frames,
            latency,
        })
    }

    fn negotiate_shared(&self, config: &StreamConfig) -> Result<Negotiated> {
        let (mut client, info) = self.activate(config)?;

        let mix = client.mix_format()?;
        let format = WaveFormat::new(mix.sample_rate, config.output_channels, mix.sample_format);
        if !client.is_format_supported(ShareMode::Shared, &format) {
            return Err(Error::driver(
                DriverErrorKind::UnsupportedFormat,
                format!(
                    "mixer on '{}' rejects {} ch at {} Hz",
                    info.name, config.output_channels, mix.sample_rate
                ),
            ));
        }
        if mix.sample_rate != config.sample_rate {
            debug!(
                requested = config.sample_rate,
                mixer = mix.sample_rate,
                "shared mode follows the mixer rate"
            );
        }

        let period = client.engine_period(&format)?;
        let event = self.host.create_event()?;
        let buffer_frames = client.initialize(
            ShareMode::Shared,
            &format,
            period.align(config.buffer_size),
            config.input_channels,
            Arc::clone(&event),
        )?;
        let latency = LatencyInfo::calculate(buffer_frames, format.sample_rate);

        Ok(Negotiated {
            event,
            client,
            format,
            buffer_frames,
            latency,
        })
    }

    fn build_stream(
        &self,
        config: &StreamConfig,
        callback: SharedCallback,
    ) -> Result<OpenStream> {
        let Negotiated {
            event,
            mut client,
            format,
            buffer_frames,
            latency,
        } = match self.mode {
            ShareMode::Exclusive => self.negotiate_exclusive(config)?,
            ShareMode::Shared => self.negotiate_shared(config)?,
        };

        let render = client.render_client()?;
        let capture = if config.input_channels > 0 {
            client.capture_client()?
        } else {
            None
        };

        let stream_format = StreamFormat {
            sample_rate: format.sample_rate,
            buffer_frames,
            output_channels: format.channels,
            input_channels: config.input_channels,
        };
        callback.prepare(&stream_format);

        Ok(OpenStream {
            event,
            render: Some(render),
            capture,
            client,
            callback,
            format,
            input_channels: config.input_channels,
            buffer_frames,
            latency,
            thread: None,
            should_stop: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicBool::new(false)),
            scratch: Some((
                vec![0.0; stream_format.output_samples()],
                vec![0.0; stream_format.input_samples()],
            )),
        })
    }

    /// Put everything the audio thread owned back into the stream.
    fn reclaim(stream: &mut OpenStream, ctx: RenderContext) {
        let RenderContext {
            render,
            capture,
            scratch,
            input_scratch,
            ..
        } = ctx;
        stream.render = Some(render);
        stream.capture = capture;
        stream.scratch = Some((scratch, input_scratch));
    }
}

impl<H: EndpointHost> DriverBackend for EventDrivenBackend<H> {
    fn driver_type(&self) -> DriverType {
        self.driver_type
    }

    fn capabilities(&self) -> DriverCapabilities {
        let common = DriverCapabilities::PLAYBACK
            | DriverCapabilities::RECORDING
            | DriverCapabilities::DUPLEX
            | DriverCapabilities::EVENT_DRIVEN
            | DriverCapabilities::HOT_PLUG_DETECTION;
        match self.mode {
            ShareMode::Exclusive => {
                common
                    | DriverCapabilities::EXCLUSIVE_MODE
                    | DriverCapabilities::BIT_DEPTH_CONVERSION
            }
            ShareMode::Shared => common | DriverCapabilities::SAMPLE_RATE_CONVERSION,
        }
    }

    fn initialize(&mut self) -> Result<()> {
        match self.status.state() {
            DriverState::Uninitialized => {}
            DriverState::Error => {
                self.close_stream();
                self.status.set_state(DriverState::Initialized);
                return Ok(());
            }
            _ => return Ok(()),
        }

        if !self.host.is_available() {
            return Err(self.status.fail(
                DriverErrorKind::InitializationFailed,
                format!("{} endpoint API not available", self.host.name()),
            ));
        }
        if let Err(err) = self.host.devices() {
            return Err(self.status.fail_with(err.into()));
        }

        self.status.set_state(DriverState::Initialized);
        info!(driver = %self.driver_type, host = self.host.name(), "backend initialized");
        Ok(())
    }

    fn shutdown(&mut self) {
        self.close_stream();
        self.status.set_state(DriverState::Uninitialized);
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.host.devices()?)
    }

    fn is_available(&self) -> bool {
        self.host.is_available()
    }

    fn open_stream(&mut self, config: &StreamConfig, callback: SharedCallback) -> Result<()> {
        match self.status.state() {
            DriverState::Uninitialized => {
                return Err(Error::InvalidState {
                    operation: "open_stream",
                    state: DriverState::Uninitialized,
                })
            }
            DriverState::StreamOpen | DriverState::StreamRunning | DriverState::Error => {
                self.close_stream();
            }
            DriverState::Initialized => {}
        }

        if let Err(err) = config.validate() {
            return Err(self.status.fail_with(err.into()));
        }

        let stream = match self.build_stream(config, callback) {
            Ok(stream) => stream,
            Err(err) => {
                self.status.set_state(DriverState::Initialized);
                return Err(self.status.fail_with(err));
            }
        };

        info!(
            driver = %self.driver_type,
            rate = stream.format.sample_rate,
            frames = stream.buffer_frames,
            format = ?stream.format.sample_format,
            latency_ms = stream.latency.output_latency_ms,
            "stream opened"
        );

        self.stats.reset();
        self.stats.set_latency_ms(stream.latency.output_latency_ms);
        self.deferred.clear();
        self.stream = Some(stream);
        self.status.set_state(DriverState::StreamOpen);
        Ok(())
    }

    fn close_stream(&mut self) {
        if self.status.state() == DriverState::StreamRunning {
            if let Err(err) = self.stop_stream() {
                warn!("stop before close failed: {err}");
            }
        }
        if let Some(mut stream) = self.stream.take() {
            if let Some(thread) = stream.thread.take() {
                stream.should_stop.store(true, Ordering::Release);
                stream.event.signal();
                let _ = thread.join(self.join_timeout);
            }
            stream.release();
            debug!(driver = %self.driver_type, "stream closed");
        }
        if self.status.state() != DriverState::Uninitialized {
            self.status.set_state(DriverState::Initialized);
        }
    }

    fn start_stream(&mut self) -> Result<()> {
        match self.status.state() {
            DriverState::StreamRunning => return Ok(()),
            DriverState::StreamOpen => {}
            state => {
                return Err(Error::InvalidState {
                    operation: "start_stream",
                    state,
                })
            }
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::NoStream);
        };
        let Some(mut render) = stream.render.take() else {
            return Err(self.status.fail(
                DriverErrorKind::StreamStartFailed,
                "render client unavailable, reopen the stream",
            ));
        };

        if let Err(err) = render.start() {
            stream.render = Some(render);
            return Err(self.status.fail(err.kind, err.to_string()));
        }

        let (scratch, input_scratch) = stream.scratch.take().unwrap_or_else(|| {
            let samples = stream.buffer_frames as usize;
            (
                vec![0.0; samples * stream.format.channels as usize],
                vec![0.0; samples * stream.input_channels as usize],
            )
        });

        stream.should_stop.store(false, Ordering::Release);
        stream.active.store(true, Ordering::Release);

        let ctx = RenderContext {
            render,
            capture: stream.capture.take(),
            event: Arc::clone(&stream.event),
            callback: stream.callback.clone(),
            stats: Arc::clone(&self.stats),
            deferred: Arc::clone(&self.deferred),
            should_stop: Arc::clone(&stream.should_stop),
            active: Arc::clone(&stream.active),
            sample_rate: stream.format.sample_rate,
            sample_format: stream.format.sample_format,
            output_channels: stream.format.channels as usize,
            input_channels: stream.input_channels as usize,
            buffer_frames: stream.buffer_frames,
            scratch,
            input_scratch,
            wait_timeout: self.wait_timeout,
        };

        match AudioThread::spawn("rondo-audio", ctx) {
            Ok(thread) => stream.thread = Some(thread),
            Err(err) => {
                stream.active.store(false, Ordering::Release);
                return Err(self.status.fail(
                    DriverErrorKind::StreamStartFailed,
                    format!("audio thread spawn failed: {err}"),
                ));
            }
        }

        self.status.set_state(DriverState::StreamRunning);
        info!(driver = %self.driver_type, "stream started");
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        let Some(thread) = stream.thread.take() else {
            if self.status.state() == DriverState::StreamRunning {
                self.status.set_state(DriverState::StreamOpen);
            }
            return Ok(());
        };

        stream.should_stop.store(true, Ordering::Release);
        stream.event.signal();

        match thread.join(self.join_timeout) {
            Some(ctx) => {
                Self::reclaim(stream, ctx);
                if let Some(render) = stream.render.as_mut() {
                    // Only now that the thread is gone may the buffer be touched
                    if let Err(err) = render.write_silence() {
                        debug!("silence fill skipped: {err}");
                    }
                    if let Err(err) = render.stop() {
                        debug!("render client stop failed: {err}");
                    }
                }
                if self.status.state() != DriverState::Error {
                    self.status.set_state(DriverState::StreamOpen);
                }
                info!(driver = %self.driver_type, "stream stopped");
            }
            None => {
                self.status.record(
                    DriverErrorKind::Unknown,
                    "audio thread did not exit in time and was detached",
                );
                if let Some(stream) = self.stream.take() {
                    stream.release();
                }
                self.status.set_state(DriverState::Initialized);
            }
        }
        Ok(())
    }

    fn is_stream_running(&self) -> bool {
        self.status.state() == DriverState::StreamRunning
            && self
                .stream
                .as_ref()
                .is_some_and(|s| s.active.load(Ordering::Acquire))
    }

    fn latency_info(&self) -> Option<LatencyInfo> {
        self.stream.as_ref().map(|s| s.latency)
    }

    fn stream_sample_rate(&self) -> u32 {
        self.stream.as_ref().map_or(0, |s| s.format.sample_rate)
    }

    fn stream_buffer_size(&self) -> u32 {
        self.stream.as_ref().map_or(0, |s| s.buffer_frames)
    }

    fn statistics(&self) -> DriverStatistics {
        self.stats.snapshot()
    }

    fn reset_statistics(&self) {
        self.stats.reset();
    }

    fn state(&self) -> DriverState {
        self.status.state()
    }

    fn last_error(&self) -> Option<(DriverErrorKind, String)> {
        self.status.last_error()
    }

    fn set_error_callback(&mut self, callback: ErrorCallback) {
        self.status.set_error_callback(callback);
    }

    fn poll_deferred_error(&mut self) -> Option<(DriverErrorKind, String)> {
        let Some((kind, code)) = self.deferred.take() else {
            // A callback that asked to stop leaves a finished thread behind
            let finished = self.status.state() == DriverState::StreamRunning
                && self
                    .stream
                    .as_ref()
                    .is_some_and(|s| !s.active.load(Ordering::Acquire));
            if finished {
                debug!(driver = %self.driver_type, "callback ended the stream");
                if let Err(err) = self.stop_stream() {
                    warn!("stop after callback exit failed: {err}");
                }
            }
            return None;
        };

        let message = format_message(kind, code);
        self.status.set_state(DriverState::Error);

        if let Some(stream) = self.stream.as_mut() {
            if let Some(thread) = stream.thread.take() {
                stream.should_stop.store(true, Ordering::Release);
                stream.event.signal();
                if let Some(ctx) = thread.join(self.join_timeout) {
                    Self::reclaim(stream, ctx);
                    if let Some(render) = stream.render.as_mut() {
                        let _ = render.stop();
                    }
                }
            }
        }

        self.status.fail(kind, message.clone());
        Some((kind, message))
    }
}

impl<H: EndpointHost> Drop for EventDrivenBackend<H> {
    fn drop(&mut self) {
        if self.stream.is_some() {
            self.close_stream();
        }
    }
}

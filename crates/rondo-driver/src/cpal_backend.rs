//! Generic cross-platform fallback backend on CPAL.
//!
//! CPAL owns the audio thread here; the data callback follows the same rules
//! as the event-driven loop (no allocation, `try_render`, statistics through
//! atomics). Output only.

use crate::backend::{DriverBackend, DriverCapabilities, DriverStatus, DriverType, ErrorCallback};
use crate::deferred::{format_message, DeferredError};
use crate::state::DriverState;
use crate::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rondo_core::config::MAX_BUFFER_SIZE;
use rondo_core::{
    CallbackControl, DeviceInfo, DriverErrorKind, DriverStatistics, LatencyInfo, SharedCallback,
    StatisticsRecorder, StreamConfig, StreamFormat,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const STANDARD_RATES: [u32; 11] = [
    8_000, 11_025, 16_000, 22_050, 32_000, 44_100, 48_000, 88_200, 96_000, 176_400, 192_000,
];

/// Wrapper to hold a `cpal::Stream` in a `Send` context.
///
/// `cpal::Stream` is `!Send` due to platform internals. The backend is only
/// driven from one control thread at a time (the device manager sits behind a
/// mutex), and the stream is dropped on close.
struct StreamHandle(cpal::Stream);

// SAFETY: see above; the stream is never accessed concurrently.
unsafe impl Send for StreamHandle {}

/// Flags shared between the backend and the CPAL data callback.
#[derive(Default)]
struct CallbackFlags {
    /// Render enabled. Cleared on stop so the device drains silence.
    running: AtomicBool,
    /// The callback has not asked to stop and the device is alive.
    active: AtomicBool,
    /// Restart stream time on the next callback.
    reset_clock: AtomicBool,
}

struct CpalStream {
    handle: StreamHandle,
    flags: Arc<CallbackFlags>,
    sample_rate: u32,
    channels: u16,
    buffer_frames: u32,
    latency: LatencyInfo,
}

pub struct CpalBackend {
    status: DriverStatus,
    stats: Arc<StatisticsRecorder>,
    deferred: Arc<DeferredError>,
    stream: Option<CpalStream>,
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalBackend {
    pub fn new() -> Self {
        Self {
            status: DriverStatus::new(DriverType::Fallback),
            stats: Arc::new(StatisticsRecorder::new()),
            deferred: Arc::new(DeferredError::new()),
            stream: None,
        }
    }

    fn get_device(index: Option<u32>) -> Result<cpal::Device> {
        let host = cpal::default_host();

        match index {
            Some(i) => {
                let devices: Vec<_> = host.output_devices()?.collect();
                let count = devices.len();
                devices.into_iter().nth(i as usize).ok_or_else(|| {
                    Error::driver(
                        DriverErrorKind::DeviceNotFound,
                        format!("output device {i} out of range ({count} available)"),
                    )
                })
            }
            None => host.default_output_device().ok_or_else(|| {
                Error::driver(DriverErrorKind::DeviceNotFound, "no output device available")
            }),
        }
    }

    fn describe(id: u32, device: &cpal::Device, default_name: Option<&str>) -> Result<DeviceInfo> {
        let name = device.name()?;

        let mut max_output_channels = 0;
        let mut sample_rates = Vec::new();
        for range in device.supported_output_configs()? {
            max_output_channels = max_output_channels.max(range.channels());
            let (lo, hi) = (range.min_sample_rate().0, range.max_sample_rate().0);
            sample_rates.extend(STANDARD_RATES.iter().filter(|&&r| r >= lo && r <= hi));
        }
        sample_rates.sort_unstable();
        sample_rates.dedup();

        let max_input_channels = device
            .supported_input_configs()
            .map(|configs| configs.map(|c| c.channels()).max().unwrap_or(0))
            .unwrap_or(0);

        let preferred_sample_rate = device
            .default_output_config()
            .map(|c| c.sample_rate().0)
            .unwrap_or(48_000);

        Ok(DeviceInfo {
            id,
            is_default_output: default_name == Some(name.as_str()),
            is_default_input: false,
            name,
            max_input_channels,
            max_output_channels,
            sample_rates,
            preferred_sample_rate,
        })
    }

    /// Pick a device config for `config`: exact channel count, requested rate
    /// if the device runs it, otherwise the device's default rate.
    fn choose_config(
        device: &cpal::Device,
        config: &StreamConfig,
    ) -> Result<(cpal::StreamConfig, cpal::SampleFormat)> {
        let ranges: Vec<_> = device
            .supported_output_configs()?
            .filter(|r| r.channels() == config.output_channels)
            .collect();
        if ranges.is_empty() {
            return Err(Error::driver(
                DriverErrorKind::UnsupportedFormat,
                format!("no {}-channel output config", config.output_channels),
            ));
        }

        let rank = |format: cpal::SampleFormat| match format {
            cpal::SampleFormat::F32 => 0,
            cpal::SampleFormat::I16 => 1,
            cpal::SampleFormat::U16 => 2,
            _ => 3,
        };
        let rate = cpal::SampleRate(config.sample_rate);
        let exact = ranges
            .iter()
            .filter(|r| r.min_sample_rate() <= rate && rate <= r.max_sample_rate())
            .min_by_key(|r| rank(r.sample_format()));

        let chosen = match exact {
            Some(range) => range.clone().with_sample_rate(rate),
            None => {
                let fallback = device.default_output_config()?;
                let range = ranges
                    .iter()
                    .filter(|r| {
                        r.min_sample_rate() <= fallback.sample_rate()
                            && fallback.sample_rate() <= r.max_sample_rate()
                    })
                    .min_by_key(|r| rank(r.sample_format()))
                    .ok_or_else(|| {
                        Error::driver(
                            DriverErrorKind::SampleRateMismatch,
                            format!("{} Hz not supported by device", config.sample_rate),
                        )
                    })?;
                info!(
                    requested = config.sample_rate,
                    actual = fallback.sample_rate().0,
                    "fallback backend uses the device rate"
                );
                range.clone().with_sample_rate(fallback.sample_rate())
            }
        };

        let buffer_size = match chosen.buffer_size() {
            cpal::SupportedBufferSize::Range { min, max } => {
                cpal::BufferSize::Fixed(config.buffer_size.clamp(*min, *max))
            }
            cpal::SupportedBufferSize::Unknown => cpal::BufferSize::Default,
        };
        let sample_format = chosen.sample_format();
        let mut stream_config = chosen.config();
        stream_config.buffer_size = buffer_size;
        Ok((stream_config, sample_format))
    }

    fn build_stream<T>(
        &self,
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        callback: SharedCallback,
        flags: Arc<CallbackFlags>,
    ) -> Result<cpal::Stream>
    where
        T: cpal::SizedSample + cpal::FromSample<f32>,
    {
        let channels = config.channels as usize;
        let sample_rate = config.sample_rate.0;
        let stats = Arc::clone(&self.stats);
        let deferred = Arc::clone(&self.deferred);
        let error_flags = Arc::clone(&flags);

        let mut scratch = vec![0.0f32; MAX_BUFFER_SIZE as usize * channels];
        let mut frames_rendered: u64 = 0;

        let stream = device.build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let started = Instant::now();
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    if !flags.running.load(Ordering::Acquire) || data.len() > scratch.len() {
                        return false;
                    }
                    if flags.reset_clock.swap(false, Ordering::AcqRel) {
                        frames_rendered = 0;
                    }

                    let frames = data.len() / channels;
                    let output = &mut scratch[..data.len()];
                    output.fill(0.0);

                    let stream_time = frames_rendered as f64 / sample_rate as f64;
                    let control = callback
                        .try_render(output, None, frames as u32, stream_time)
                        .unwrap_or(CallbackControl::Continue);

                    for (sample, value) in data.iter_mut().zip(output.iter()) {
                        *sample = T::from_sample(*value);
                    }

                    frames_rendered += frames as u64;
                    stats.record_callback(started.elapsed(), frames as u32, sample_rate);

                    if control == CallbackControl::Stop {
                        flags.running.store(false, Ordering::Release);
                        flags.active.store(false, Ordering::Release);
                    }
                    true
                }));

                if !matches!(result, Ok(true)) {
                    for sample in data.iter_mut() {
                        *sample = T::from_sample(0.0);
                    }
                }
            },
            move |err| {
                let kind = match err {
                    cpal::StreamError::DeviceNotAvailable => DriverErrorKind::DeviceNotFound,
                    cpal::StreamError::BackendSpecific { .. } => DriverErrorKind::Unknown,
                };
                error_flags.active.store(false, Ordering::Release);
                deferred.report(kind, 0);
            },
            None,
        )?;

        Ok(stream)
    }

    fn open_inner(&self, config: &StreamConfig, callback: SharedCallback) -> Result<CpalStream> {
        let device = Self::get_device(config.device_id)?;
        let (stream_config, sample_format) = Self::choose_config(&device, config)?;

        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels;
        let buffer_frames = match stream_config.buffer_size {
            cpal::BufferSize::Fixed(frames) => frames,
            cpal::BufferSize::Default => config.buffer_size,
        };

        callback.prepare(&StreamFormat {
            sample_rate,
            buffer_frames: MAX_BUFFER_SIZE,
            output_channels: channels,
            input_channels: 0,
        });

        let flags = Arc::new(CallbackFlags::default());
        let stream = match sample_format {
            cpal::SampleFormat::F32 => {
                self.build_stream::<f32>(&device, &stream_config, callback, Arc::clone(&flags))?
            }
            cpal::SampleFormat::I16 => {
                self.build_stream::<i16>(&device, &stream_config, callback, Arc::clone(&flags))?
            }
            cpal::SampleFormat::U16 => {
                self.build_stream::<u16>(&device, &stream_config, callback, Arc::clone(&flags))?
            }
            format => {
                return Err(Error::driver(
                    DriverErrorKind::UnsupportedFormat,
                    format!("unsupported sample format: {format:?}"),
                ));
            }
        };
        // Some hosts start streams on build
        let _ = stream.pause();

        Ok(CpalStream {
            handle: StreamHandle(stream),
            flags,
            sample_rate,
            channels,
            buffer_frames,
            latency: LatencyInfo::calculate(buffer_frames, sample_rate),
        })
    }
}

impl DriverBackend for CpalBackend {
    fn driver_type(&self) -> DriverType {
        DriverType::Fallback
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities::PLAYBACK | DriverCapabilities::BIT_DEPTH_CONVERSION
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
        if !self.is_available() {
            return Err(self.status.fail(
                DriverErrorKind::InitializationFailed,
                "no default output device",
            ));
        }
        self.status.set_state(DriverState::Initialized);
        info!(host = ?cpal::default_host().id(), "fallback backend initialized");
        Ok(())
    }

    fn shutdown(&mut self) {
        self.close_stream();
        self.status.set_state(DriverState::Uninitialized);
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let host = cpal::default_host();
        let default_name = host.default_output_device().and_then(|d| d.name().ok());
        host.output_devices()?
            .enumerate()
            .map(|(i, device)| Self::describe(i as u32, &device, default_name.as_deref()))
            .collect()
    }

    fn is_available(&self) -> bool {
        cpal::default_host().default_output_device().is_some()
    }

    fn open_stream(&mut self, config: &StreamConfig, callback: SharedCallback) -> Result<()> {
        match self.status.state() {
            DriverState::Uninitialized => {
                return Err(Error::InvalidState {
                    operation: "open_stream",
                    state: DriverState::Uninitialized,
                })
            }
            DriverState::Initialized => {}
            _ => self.close_stream(),
        }
        if let Err(err) = config.validate() {
            return Err(self.status.fail_with(err.into()));
        }

        match self.open_inner(config, callback) {
            Ok(stream) => {
                info!(
                    rate = stream.sample_rate,
                    channels = stream.channels,
                    frames = stream.buffer_frames,
                    "fallback stream opened"
                );
                self.stats.reset();
                self.stats.set_latency_ms(stream.latency.output_latency_ms);
                self.deferred.clear();
                self.stream = Some(stream);
                self.status.set_state(DriverState::StreamOpen);
                Ok(())
            }
            Err(err) => {
                self.status.set_state(DriverState::Initialized);
                Err(self.status.fail_with(err))
            }
        }
    }

    fn close_stream(&mut self) {
        if self.status.state() == DriverState::StreamRunning {
            if let Err(err) = self.stop_stream() {
                warn!("stop before close failed: {err}");
            }
        }
        if self.stream.take().is_some() {
            debug!("fallback stream closed");
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
        let Some(stream) = self.stream.as_ref() else {
            return Err(Error::NoStream);
        };

        stream.flags.reset_clock.store(true, Ordering::Release);
        stream.flags.active.store(true, Ordering::Release);
        stream.flags.running.store(true, Ordering::Release);

        if let Err(err) = stream.handle.0.play() {
            stream.flags.running.store(false, Ordering::Release);
            stream.flags.active.store(false, Ordering::Release);
            return Err(self.status.fail_with(err.into()));
        }

        self.status.set_state(DriverState::StreamRunning);
        info!("fallback stream started");
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_ref() else {
            return Ok(());
        };
        if !stream.flags.running.swap(false, Ordering::AcqRel)
            && self.status.state() != DriverState::StreamRunning
        {
            return Ok(());
        }

        // Let the device pull one buffer of silence before pausing
        let period = Duration::from_secs_f64(
            stream.buffer_frames as f64 / stream.sample_rate.max(1) as f64,
        );
        std::thread::sleep(period);

        let paused = stream.handle.0.pause();
        stream.flags.active.store(false, Ordering::Release);
        if self.status.state() != DriverState::Error {
            self.status.set_state(DriverState::StreamOpen);
        }
        paused.map_err(|err| self.status.fail_with(err.into()))
    }

    fn is_stream_running(&self) -> bool {
        self.status.state() == DriverState::StreamRunning
            && self
                .stream
                .as_ref()
                .is_some_and(|s| s.flags.active.load(Ordering::Acquire))
    }

    fn latency_info(&self) -> Option<LatencyInfo> {
        self.stream.as_ref().map(|s| s.latency)
    }

    fn stream_sample_rate(&self) -> u32 {
        self.stream.as_ref().map_or(0, |s| s.sample_rate)
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
            let finished = self.status.state() == DriverState::StreamRunning
                && self
                    .stream
                    .as_ref()
                    .is_some_and(|s| !s.flags.active.load(Ordering::Acquire));
            if finished {
                if let Err(err) = self.stop_stream() {
                    warn!("stop after callback exit failed: {err}");
                }
            }
            return None;
        };

        let message = format_message(kind, code);
        self.status.set_state(DriverState::Error);
        if let Some(stream) = self.stream.as_ref() {
            stream.flags.running.store(false, Ordering::Release);
            let _ = stream.handle.0.pause();
        }
        self.status.fail(kind, message.clone());
        Some((kind, message))
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        if self.stream.is_some() {
            self.close_stream();
        }
    }
}

//! Platform-neutral boundary to a native endpoint API.
//!
//! An event-driven native API (WASAPI on Windows, the in-process
//! [`VirtualHost`](crate::VirtualHost) everywhere) is reduced to three small
//! traits. Everything above this module is platform-independent; native handles
//! and their reference counting stay inside the implementations.

use crate::convert::SampleFormat;
use crate::event::ReadyEvent;
use rondo_core::{DeviceInfo, DriverErrorKind};
use std::fmt;
use std::sync::Arc;

/// Device access mode requested from the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShareMode {
    Exclusive,
    Shared,
}

/// A concrete native wave format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaveFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl WaveFormat {
    pub fn new(sample_rate: u32, channels: u16, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format,
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * self.sample_format.bytes_per_sample()
    }
}

/// Shared-mode engine periods, in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnginePeriod {
    pub default_frames: u32,
    pub fundamental_frames: u32,
    pub min_frames: u32,
    pub max_frames: u32,
}

impl EnginePeriod {
    /// Smallest supported period that holds `requested` frames.
    ///
    /// Rounded up to a multiple of the fundamental period and clamped to the
    /// supported range.
    pub fn align(&self, requested: u32) -> u32 {
        let fundamental = self.fundamental_frames.max(1);
        let aligned = requested.div_ceil(fundamental) * fundamental;
        aligned.clamp(self.min_frames, self.max_frames.max(self.min_frames))
    }
}

/// A native failure, already classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    pub kind: DriverErrorKind,
    /// Native status code, e.g. an HRESULT. Zero when there is none.
    pub code: i64,
    pub context: &'static str,
}

impl NativeError {
    pub fn new(kind: DriverErrorKind, code: i64, context: &'static str) -> Self {
        Self {
            kind,
            code,
            context,
        }
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code == 0 {
            write!(f, "{}: {}", self.context, self.kind)
        } else {
            write!(
                f,
                "{}: {} (0x{:08X})",
                self.context, self.kind, self.code as u32
            )
        }
    }
}

impl From<NativeError> for crate::Error {
    fn from(err: NativeError) -> Self {
        crate::Error::driver(err.kind, err.to_string())
    }
}

pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Device enumerator.
pub trait EndpointHost: Send + Sync {
    fn name(&self) -> &str;

    /// The native API can be used on this machine.
    fn is_available(&self) -> bool;

    fn devices(&self) -> NativeResult<Vec<DeviceInfo>>;

    /// `None` opens the default output device.
    fn activate(&self, device_id: Option<u32>) -> NativeResult<Box<dyn AudioClient>>;

    fn create_event(&self) -> NativeResult<Arc<dyn ReadyEvent>>;
}

/// An activated device, before and after stream initialization.
pub trait AudioClient: Send {
    fn device_info(&self) -> &DeviceInfo;

    /// Format used by the OS mixer in shared mode.
    fn mix_format(&self) -> NativeResult<WaveFormat>;

    fn is_format_supported(&self, mode: ShareMode, format: &WaveFormat) -> bool;

    fn engine_period(&self, format: &WaveFormat) -> NativeResult<EnginePeriod>;

    /// Initialize for event-driven rendering. Returns the actual buffer size in frames.
    fn initialize(
        &mut self,
        mode: ShareMode,
        format: &WaveFormat,
        period_frames: u32,
        input_channels: u16,
        event: Arc<dyn ReadyEvent>,
    ) -> NativeResult<u32>;

    /// Output latency the device reports, in ms. Called once after initialize.
    fn stream_latency_ms(&self) -> Option<f64> {
        None
    }

    fn render_client(&mut self) -> NativeResult<Box<dyn RenderClient>>;

    /// `None` when the stream was initialized without input channels.
    fn capture_client(&mut self) -> NativeResult<Option<Box<dyn CaptureClient>>> {
        Ok(None)
    }
}

/// Render side of an initialized client. Owned by the audio thread while running.
pub trait RenderClient: Send {
    fn start(&mut self) -> NativeResult<()>;

    fn stop(&mut self) -> NativeResult<()>;

    /// Frames the device can accept right now.
    fn available_frames(&mut self) -> NativeResult<u32>;

    /// Native buffer for `frames` frames. Must be followed by `release_buffer`.
    fn get_buffer(&mut self, frames: u32) -> NativeResult<&mut [u8]>;

    fn release_buffer(&mut self, frames: u32, silent: bool) -> NativeResult<()>;

    /// Fill whatever the device will accept with silence.
    fn write_silence(&mut self) -> NativeResult<()> {
        let frames = self.available_frames()?;
        if frames == 0 {
            return Ok(());
        }
        self.get_buffer(frames)?.fill(0);
        self.release_buffer(frames, true)
    }
}

/// Capture side of an initialized duplex client.
pub trait CaptureClient: Send {
    /// Fill `dest` with `frames` interleaved frames. Missing data reads as silence.
    fn read(&mut self, dest: &mut [f32], frames: u32) -> NativeResult<()>;
}

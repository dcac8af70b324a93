//! In-process endpoint host.
//!
//! Devices are described by a [`VirtualDeviceSpec`]. A timer thread per running
//! stream plays the part of the hardware clock: it consumes one period and
//! signals the audio-ready event every `buffer_frames / sample_rate` seconds.
//! Everything written to a device is decoded back to f32 and kept in a bounded
//! ring, so tests can inspect exactly what reached the "hardware".
//!
//! Faults can be injected from any thread: device removal, exclusive hold by
//! another process, start failure.

use crate::convert::{decode, SampleFormat};
use crate::endpoint::{
    AudioClient, CaptureClient, EndpointHost, EnginePeriod, NativeError, NativeResult,
    RenderClient, ShareMode, WaveFormat,
};
use crate::event::{AudioEvent, ReadyEvent};
use parking_lot::Mutex;
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use rondo_core::{DeviceInfo, DriverErrorKind};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// Status codes in the style of the Windows audio client
pub const E_DEVICE_INVALIDATED: i64 = 0x8889_0004;
pub const E_UNSUPPORTED_FORMAT: i64 = 0x8889_0008;
pub const E_DEVICE_IN_USE: i64 = 0x8889_000A;
pub const E_BUFFER_TOO_LARGE: i64 = 0x8889_0006;
pub const E_NOT_INITIALIZED: i64 = 0x8889_0001;

const DEFAULT_CAPTURE_SECS: f32 = 10.0;

/// Description of a virtual device.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualDeviceSpec {
    pub name: String,
    pub max_output_channels: u16,
    pub max_input_channels: u16,
    pub sample_rates: Vec<u32>,
    pub preferred_sample_rate: u32,
    /// Native formats accepted in exclusive mode.
    pub exclusive_formats: Vec<SampleFormat>,
    /// Shared-mode mixer format.
    pub mix_format: WaveFormat,
    pub engine_period: EnginePeriod,
    /// Smallest exclusive buffer the device accepts.
    pub min_exclusive_frames: u32,
    /// Output latency reported in exclusive mode, in ms.
    pub reported_latency_ms: Option<f64>,
    /// Constant level delivered on every input channel.
    pub input_level: f32,
}

impl Default for VirtualDeviceSpec {
    fn default() -> Self {
        Self {
            name: "Virtual Output".into(),
            max_output_channels: 2,
            max_input_channels: 0,
            sample_rates: vec![44_100, 48_000, 88_200, 96_000],
            preferred_sample_rate: 48_000,
            exclusive_formats: SampleFormat::PREFERENCE.to_vec(),
            mix_format: WaveFormat::new(48_000, 2, SampleFormat::F32),
            engine_period: EnginePeriod {
                default_frames: 480,
                fundamental_frames: 16,
                min_frames: 64,
                max_frames: 4096,
            },
            min_exclusive_frames: 32,
            reported_latency_ms: None,
            input_level: 0.0,
        }
    }
}

impl VirtualDeviceSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_sample_rates(mut self, rates: &[u32]) -> Self {
        let mut rates = rates.to_vec();
        rates.sort_unstable();
        rates.dedup();
        if !rates.contains(&self.preferred_sample_rate) {
            if let Some(&first) = rates.first() {
                self.preferred_sample_rate = first;
            }
        }
        self.sample_rates = rates;
        self
    }

    pub fn with_exclusive_formats(mut self, formats: &[SampleFormat]) -> Self {
        self.exclusive_formats = formats.to_vec();
        self
    }

    pub fn with_mix_format(mut self, format: WaveFormat) -> Self {
        self.mix_format = format;
        self
    }

    pub fn with_input_channels(mut self, channels: u16, level: f32) -> Self {
        self.max_input_channels = channels;
        self.input_level = level;
        self
    }

    pub fn with_reported_latency_ms(mut self, latency_ms: f64) -> Self {
        self.reported_latency_ms = Some(latency_ms);
        self
    }

    fn device_info(&self, id: u32) -> DeviceInfo {
        let mut sample_rates = self.sample_rates.clone();
        sample_rates.sort_unstable();
        DeviceInfo {
            id,
            name: self.name.clone(),
            max_input_channels: self.max_input_channels,
            max_output_channels: self.max_output_channels,
            sample_rates,
            preferred_sample_rate: self.preferred_sample_rate,
            is_default_input: false,
            is_default_output: false,
        }
    }
}

struct VirtualDevice {
    id: u32,
    spec: VirtualDeviceSpec,
    removed: AtomicBool,
    held_externally: AtomicBool,
    exclusive_in_use: AtomicBool,
    fail_next_start: AtomicBool,
    frames_played: AtomicU64,
    captured: Mutex<Option<HeapCons<f32>>>,
}

impl VirtualDevice {
    fn invalidated(&self, context: &'static str) -> NativeResult<()> {
        if self.removed.load(Ordering::Acquire) {
            Err(NativeError::new(
                DriverErrorKind::DeviceNotFound,
                E_DEVICE_INVALIDATED,
                context,
            ))
        } else {
            Ok(())
        }
    }
}

struct HostInner {
    devices: Mutex<Vec<Arc<VirtualDevice>>>,
    default_output: AtomicU32,
    available: AtomicBool,
    capture_secs: f32,
}

/// Cloneable handle to a set of virtual devices.
#[derive(Clone)]
pub struct VirtualHost {
    inner: Arc<HostInner>,
}

impl Default for VirtualHost {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualHost {
    /// Empty host; add devices with [`add_device`](Self::add_device).
    pub fn new() -> Self {
        Self::with_capture_seconds(DEFAULT_CAPTURE_SECS)
    }

    /// Empty host keeping at most `seconds` of captured output per device.
    pub fn with_capture_seconds(seconds: f32) -> Self {
        Self {
            inner: Arc::new(HostInner {
                devices: Mutex::new(Vec::new()),
                default_output: AtomicU32::new(0),
                available: AtomicBool::new(true),
                capture_secs: seconds.max(0.1),
            }),
        }
    }

    /// Host with a single default stereo device.
    pub fn with_default_device() -> Self {
        let host = Self::new();
        host.add_device(VirtualDeviceSpec::default());
        host
    }

    /// Returns the new device id.
    pub fn add_device(&self, spec: VirtualDeviceSpec) -> u32 {
        let mut devices = self.inner.devices.lock();
        let id = devices.len() as u32;
        devices.push(Arc::new(VirtualDevice {
            id,
            spec,
            removed: AtomicBool::new(false),
            held_externally: AtomicBool::new(false),
            exclusive_in_use: AtomicBool::new(false),
            fail_next_start: AtomicBool::new(false),
            frames_played: AtomicU64::new(0),
            captured: Mutex::new(None),
        }));
        id
    }

    pub fn set_default_output(&self, id: u32) {
        self.inner.default_output.store(id, Ordering::Release);
    }

    /// Make the native API look missing.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Release);
    }

    /// Unplug a device. Running streams fail on their next buffer.
    pub fn remove_device(&self, id: u32) {
        if let Some(device) = self.device(id) {
            device.removed.store(true, Ordering::Release);
        }
    }

    pub fn restore_device(&self, id: u32) {
        if let Some(device) = self.device(id) {
            device.removed.store(false, Ordering::Release);
        }
    }

    /// Another process holds (or releases) the device exclusively.
    pub fn hold_exclusive(&self, id: u32, held: bool) {
        if let Some(device) = self.device(id) {
            device.held_externally.store(held, Ordering::Release);
        }
    }

    /// The next `start` on this device fails.
    pub fn fail_next_start(&self, id: u32) {
        if let Some(device) = self.device(id) {
            device.fail_next_start.store(true, Ordering::Release);
        }
    }

    /// Drain everything written to the device since the last call.
    pub fn captured_output(&self, id: u32) -> Vec<f32> {
        let Some(device) = self.device(id) else {
            return Vec::new();
        };
        let mut captured = device.captured.lock();
        match captured.as_mut() {
            Some(cons) => cons.pop_iter().collect(),
            None => Vec::new(),
        }
    }

    pub fn clear_captured(&self, id: u32) {
        if let Some(device) = self.device(id) {
            if let Some(cons) = device.captured.lock().as_mut() {
                cons.clear();
            }
        }
    }

    /// Frames the device clock has consumed over its lifetime.
    pub fn frames_played(&self, id: u32) -> u64 {
        self.device(id)
            .map(|d| d.frames_played.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Whether a stream currently owns the device exclusively.
    pub fn is_exclusive_in_use(&self, id: u32) -> bool {
        self.device(id)
            .map(|d| d.exclusive_in_use.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    fn device(&self, id: u32) -> Option<Arc<VirtualDevice>> {
        self.inner.devices.lock().get(id as usize).cloned()
    }

    fn default_output_id(&self) -> Option<u32> {
        let devices = self.inner.devices.lock();
        let preferred = self.inner.default_output.load(Ordering::Acquire);
        let usable = |d: &&Arc<VirtualDevice>| {
            !d.removed.load(Ordering::Acquire) && d.spec.max_output_channels > 0
        };
        devices
            .get(preferred as usize)
            .filter(usable)
            .or_else(|| devices.iter().find(usable))
            .map(|d| d.id)
    }
}

impl EndpointHost for VirtualHost {
    fn name(&self) -> &str {
        "virtual"
    }

    fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::Acquire)
    }

    fn devices(&self) -> NativeResult<Vec<DeviceInfo>> {
        let default_output = self.default_output_id();
        let devices = self.inner.devices.lock();
        let default_input = devices
            .iter()
            .find(|d| !d.removed.load(Ordering::Acquire) && d.spec.max_input_channels > 0)
            .map(|d| d.id);

        Ok(devices
            .iter()
            .filter(|d| !d.removed.load(Ordering::Acquire))
            .map(|d| {
                let mut info = d.spec.device_info(d.id);
                info.is_default_output = Some(d.id) == default_output;
                info.is_default_input = Some(d.id) == default_input;
                info
            })
            .collect())
    }

    fn activate(&self, device_id: Option<u32>) -> NativeResult<Box<dyn AudioClient>> {
        let not_found = || {
            NativeError::new(
                DriverErrorKind::DeviceNotFound,
                E_DEVICE_INVALIDATED,
                "activate",
            )
        };
        let id = match device_id {
            Some(id) => id,
            None => self.default_output_id().ok_or_else(not_found)?,
        };
        let device = self.device(id).ok_or_else(not_found)?;
        device.invalidated("activate")?;

        let info = device.spec.device_info(id);
        Ok(Box::new(VirtualClient {
            device,
            info,
            capture_secs: self.inner.capture_secs,
            init: None,
            owns_exclusive: false,
        }))
    }

    fn create_event(&self) -> NativeResult<Arc<dyn ReadyEvent>> {
        Ok(Arc::new(AudioEvent::new()))
    }
}

#[derive(Clone)]
struct InitState {
    mode: ShareMode,
    format: WaveFormat,
    buffer_frames: u32,
    input_channels: u16,
    event: Arc<dyn ReadyEvent>,
}

struct VirtualClient {
    device: Arc<VirtualDevice>,
    info: DeviceInfo,
    capture_secs: f32,
    init: Option<InitState>,
    owns_exclusive: bool,
}

impl VirtualClient {
    fn init_state(&self, context: &'static str) -> NativeResult<&InitState> {
        self.init.as_ref().ok_or(NativeError::new(
            DriverErrorKind::InitializationFailed,
            E_NOT_INITIALIZED,
            context,
        ))
    }
}

impl Drop for VirtualClient {
    fn drop(&mut self) {
        if self.owns_exclusive {
            self.device.exclusive_in_use.store(false, Ordering::Release);
        }
    }
}

impl AudioClient for VirtualClient {
    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn mix_format(&self) -> NativeResult<WaveFormat> {
        self.device.invalidated("mix_format")?;
        Ok(self.device.spec.mix_format)
    }

    fn is_format_supported(&self, mode: ShareMode, format: &WaveFormat) -> bool {
        let spec = &self.device.spec;
        match mode {
            ShareMode::Exclusive => {
                format.channels <= spec.max_output_channels
                    && spec.sample_rates.contains(&format.sample_rate)
                    && spec.exclusive_formats.contains(&format.sample_format)
            }
            // The mixer converts channel counts, never rate or sample type
            ShareMode::Shared => {
                format.sample_rate == spec.mix_format.sample_rate
                    && format.sample_format == spec.mix_format.sample_format
                    && format.channels <= spec.mix_format.channels.max(spec.max_output_channels)
            }
        }
    }

    fn engine_period(&self, _format: &WaveFormat) -> NativeResult<EnginePeriod> {
        self.device.invalidated("engine_period")?;
        Ok(self.device.spec.engine_period)
    }

    fn initialize(
        &mut self,
        mode: ShareMode,
        format: &WaveFormat,
        period_frames: u32,
        input_channels: u16,
        event: Arc<dyn ReadyEvent>,
    ) -> NativeResult<u32> {
        self.device.invalidated("initialize")?;
        let in_use =
            || NativeError::new(DriverErrorKind::DeviceInUse, E_DEVICE_IN_USE, "initialize");

        if !self.is_format_supported(mode, format) {
            return Err(NativeError::new(
                DriverErrorKind::UnsupportedFormat,
                E_UNSUPPORTED_FORMAT,
                "initialize",
            ));
        }
        if input_channels > self.device.spec.max_input_channels {
            return Err(NativeError::new(
                DriverErrorKind::UnsupportedFormat,
                E_UNSUPPORTED_FORMAT,
                "initialize input",
            ));
        }

        let buffer_frames = match mode {
            ShareMode::Exclusive => {
                if self.device.held_externally.load(Ordering::Acquire) {
                    return Err(in_use());
                }
                if self
                    .device
                    .exclusive_in_use
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return Err(in_use());
                }
                self.owns_exclusive = true;
                period_frames.max(self.device.spec.min_exclusive_frames)
            }
            ShareMode::Shared => {
                if self.device.exclusive_in_use.load(Ordering::Acquire) {
                    return Err(in_use());
                }
                self.device.spec.engine_period.align(period_frames)
            }
        };

        self.init = Some(InitState {
            mode,
            format: *format,
            buffer_frames,
            input_channels,
            event,
        });
        Ok(buffer_frames)
    }

    fn stream_latency_ms(&self) -> Option<f64> {
        match self.init.as_ref()?.mode {
            ShareMode::Exclusive => self.device.spec.reported_latency_ms,
            ShareMode::Shared => None,
        }
    }

    fn render_client(&mut self) -> NativeResult<Box<dyn RenderClient>> {
        let init = self.init_state("render_client")?.clone();
        let samples_per_sec = init.format.sample_rate as f32 * init.format.channels as f32;
        let capacity = (samples_per_sec * self.capture_secs) as usize;
        let (prod, cons) = HeapRb::<f32>::new(capacity.max(1)).split();
        *self.device.captured.lock() = Some(cons);

        let samples = init.buffer_frames as usize * init.format.channels as usize;
        Ok(Box::new(VirtualRender {
            device: Arc::clone(&self.device),
            native: vec![0u8; samples * init.format.sample_format.bytes_per_sample()],
            decoded: vec![0.0; samples],
            captured: prod,
            queued: Arc::new(AtomicU32::new(0)),
            clock: None,
            init,
        }))
    }

    fn capture_client(&mut self) -> NativeResult<Option<Box<dyn CaptureClient>>> {
        let init = self.init_state("capture_client")?;
        if init.input_channels == 0 {
            return Ok(None);
        }
        Ok(Some(Box::new(VirtualCapture {
            device: Arc::clone(&self.device),
            level: self.device.spec.input_level,
        })))
    }
}

struct DeviceClock {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct VirtualRender {
    device: Arc<VirtualDevice>,
    init: InitState,
    native: Vec<u8>,
    decoded: Vec<f32>,
    captured: HeapProd<f32>,
    /// Frames written but not yet consumed by the clock (shared mode padding).
    queued: Arc<AtomicU32>,
    clock: Option<DeviceClock>,
}

impl VirtualRender {
    fn stop_clock(&mut self) {
        if let Some(clock) = self.clock.take() {
            clock.stop.store(true, Ordering::Release);
            let _ = clock.handle.join();
        }
    }
}

impl Drop for VirtualRender {
    fn drop(&mut self) {
        self.stop_clock();
    }
}

impl RenderClient for VirtualRender {
    fn start(&mut self) -> NativeResult<()> {
        self.device.invalidated("start")?;
        if self.device.fail_next_start.swap(false, Ordering::AcqRel) {
            return Err(NativeError::new(
                DriverErrorKind::StreamStartFailed,
                0,
                "start",
            ));
        }
        if self.clock.is_some() {
            return Ok(());
        }

        let period_frames = self.init.buffer_frames;
        let period = Duration::from_secs_f64(
            period_frames as f64 / self.init.format.sample_rate.max(1) as f64,
        );
        let stop = Arc::new(AtomicBool::new(false));
        let event = Arc::clone(&self.init.event);
        let queued = Arc::clone(&self.queued);
        let device = Arc::clone(&self.device);
        let thread_stop = Arc::clone(&stop);

        queued.store(0, Ordering::Release);
        let handle = thread::Builder::new()
            .name(format!("rondo-virtual-clock-{}", self.device.id))
            .spawn(move || {
                // The device asks for its first buffer straight away
                event.signal();
                let mut deadline = Instant::now() + period;
                while !thread_stop.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if deadline > now {
                        thread::sleep(deadline - now);
                    }
                    deadline += period;

                    let _ = queued.fetch_update(Ordering::AcqRel, Ordering::Acquire, |q| {
                        Some(q.saturating_sub(period_frames))
                    });
                    device
                        .frames_played
                        .fetch_add(period_frames as u64, Ordering::AcqRel);
                    event.signal();
                }
            })
            .map_err(|_| NativeError::new(DriverErrorKind::StreamStartFailed, 0, "clock thread"))?;

        self.clock = Some(DeviceClock { stop, handle });
        Ok(())
    }

    fn stop(&mut self) -> NativeResult<()> {
        self.stop_clock();
        Ok(())
    }

    fn available_frames(&mut self) -> NativeResult<u32> {
        self.device.invalidated("available_frames")?;
        Ok(match self.init.mode {
            ShareMode::Exclusive => self.init.buffer_frames,
            ShareMode::Shared => self
                .init
                .buffer_frames
                .saturating_sub(self.queued.load(Ordering::Acquire)),
        })
    }

    fn get_buffer(&mut self, frames: u32) -> NativeResult<&mut [u8]> {
        self.device.invalidated("get_buffer")?;
        if frames > self.init.buffer_frames {
            return Err(NativeError::new(
                DriverErrorKind::Unknown,
                E_BUFFER_TOO_LARGE,
                "get_buffer",
            ));
        }
        let bytes = frames as usize * self.init.format.frame_bytes();
        Ok(&mut self.native[..bytes])
    }

    fn release_buffer(&mut self, frames: u32, silent: bool) -> NativeResult<()> {
        let bytes = frames as usize * self.init.format.frame_bytes();
        let samples = frames as usize * self.init.format.channels as usize;
        if silent {
            self.native[..bytes].fill(0);
        }
        decode(
            &self.native[..bytes],
            &mut self.decoded[..samples],
            self.init.format.sample_format,
        );
        // Oldest data is kept when full
        self.captured.push_slice(&self.decoded[..samples]);

        if self.init.mode == ShareMode::Shared {
            self.queued.fetch_add(frames, Ordering::AcqRel);
        }
        Ok(())
    }
}

struct VirtualCapture {
    device: Arc<VirtualDevice>,
    level: f32,
}

impl CaptureClient for VirtualCapture {
    fn read(&mut self, dest: &mut [f32], _frames: u32) -> NativeResult<()> {
        self.device.invalidated("capture")?;
        dest.fill(self.level);
        Ok(())
    }
}

//! WASAPI endpoint host (Windows only).
//!
//! COM pointers never leave this module. Clients are created in the MTA and
//! marked `Send`; each one is used by a single thread at a time (control thread
//! until start, then the audio thread).

use crate::convert::SampleFormat;
use crate::endpoint::{
    AudioClient, EndpointHost, EnginePeriod, NativeError, NativeResult, RenderClient, ShareMode,
    WaveFormat,
};
use crate::event::{ReadyEvent, WaitOutcome};
use rondo_core::{DeviceInfo, DriverErrorKind};
use std::sync::Arc;
use std::time::Duration;
use windows::core::{ComInterface, GUID};
use windows::Win32::Devices::FunctionDiscovery::PKEY_Device_FriendlyName;
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::Media::Audio::{
    eConsole, eRender, IAudioClient, IAudioClient3, IAudioRenderClient, IMMDevice,
    IMMDeviceEnumerator, MMDeviceEnumerator, AUDCLNT_BUFFERFLAGS_SILENT,
    AUDCLNT_SHAREMODE_EXCLUSIVE, AUDCLNT_SHAREMODE_SHARED, AUDCLNT_STREAMFLAGS_EVENTCALLBACK,
    DEVICE_STATE_ACTIVE, WAVEFORMATEX, WAVEFORMATEXTENSIBLE, WAVEFORMATEXTENSIBLE_0,
};
use windows::Win32::Media::KernelStreaming::{KSDATAFORMAT_SUBTYPE_PCM, WAVE_FORMAT_EXTENSIBLE};
use windows::Win32::Media::Multimedia::KSDATAFORMAT_SUBTYPE_IEEE_FLOAT;
use windows::Win32::System::Com::StructuredStorage::PropVariantToStringAlloc;
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoTaskMemFree, CLSCTX_ALL, COINIT_MULTITHREADED, STGM_READ,
};
use windows::Win32::System::Threading::{CreateEventW, SetEvent, WaitForSingleObject};

const AUDCLNT_E_NOT_INITIALIZED: u32 = 0x8889_0001;
const AUDCLNT_E_DEVICE_INVALIDATED: u32 = 0x8889_0004;
const AUDCLNT_E_BUFFER_SIZE_ERROR: u32 = 0x8889_0016;
const AUDCLNT_E_UNSUPPORTED_FORMAT: u32 = 0x8889_0008;
const AUDCLNT_E_DEVICE_IN_USE: u32 = 0x8889_000A;
const AUDCLNT_E_SERVICE_NOT_RUNNING: u32 = 0x8889_0010;
const AUDCLNT_E_EXCLUSIVE_MODE_NOT_ALLOWED: u32 = 0x8889_000E;
const AUDCLNT_E_BUFFER_SIZE_NOT_ALIGNED: u32 = 0x8889_0019;
const AUDCLNT_E_RESOURCES_INVALIDATED: u32 = 0x8889_0026;

/// 100 ns units per second.
const REFTIMES_PER_SEC: f64 = 10_000_000.0;

fn classify(code: u32) -> DriverErrorKind {
    match code {
        AUDCLNT_E_DEVICE_INVALIDATED
        | AUDCLNT_E_SERVICE_NOT_RUNNING
        | AUDCLNT_E_RESOURCES_INVALIDATED => DriverErrorKind::DeviceNotFound,
        AUDCLNT_E_DEVICE_IN_USE => DriverErrorKind::DeviceInUse,
        AUDCLNT_E_UNSUPPORTED_FORMAT
        | AUDCLNT_E_BUFFER_SIZE_ERROR
        | AUDCLNT_E_BUFFER_SIZE_NOT_ALIGNED => DriverErrorKind::UnsupportedFormat,
        AUDCLNT_E_EXCLUSIVE_MODE_NOT_ALLOWED => DriverErrorKind::ExclusiveModeUnavailable,
        AUDCLNT_E_NOT_INITIALIZED => DriverErrorKind::StreamOpenFailed,
        _ => DriverErrorKind::Unknown,
    }
}

fn native(err: windows::core::Error, context: &'static str) -> NativeError {
    let code = err.code().0 as u32;
    NativeError::new(classify(code), i64::from(code), context)
}

fn com_init() {
    // Already-initialized and mode-changed results are fine here
    let _ = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
}

fn frames_to_reftime(frames: u32, sample_rate: u32) -> i64 {
    (frames as f64 * REFTIMES_PER_SEC / sample_rate.max(1) as f64).round() as i64
}

fn reftime_to_frames(reftime: i64, sample_rate: u32) -> u32 {
    (reftime as f64 * sample_rate as f64 / REFTIMES_PER_SEC).round() as u32
}

fn extensible(format: &WaveFormat) -> WAVEFORMATEXTENSIBLE {
    let bits = format.sample_format.bits_per_sample();
    let block_align = format.frame_bytes() as u16;
    WAVEFORMATEXTENSIBLE {
        Format: WAVEFORMATEX {
            wFormatTag: WAVE_FORMAT_EXTENSIBLE as u16,
            nChannels: format.channels,
            nSamplesPerSec: format.sample_rate,
            nAvgBytesPerSec: format.sample_rate * block_align as u32,
            nBlockAlign: block_align,
            wBitsPerSample: bits,
            cbSize: (std::mem::size_of::<WAVEFORMATEXTENSIBLE>()
                - std::mem::size_of::<WAVEFORMATEX>()) as u16,
        },
        Samples: WAVEFORMATEXTENSIBLE_0 {
            wValidBitsPerSample: bits,
        },
        dwChannelMask: if format.channels == 1 { 0x4 } else { 0x3 },
        SubFormat: match format.sample_format {
            SampleFormat::F32 => KSDATAFORMAT_SUBTYPE_IEEE_FLOAT,
            SampleFormat::I24 | SampleFormat::I16 => KSDATAFORMAT_SUBTYPE_PCM,
        },
    }
}

/// Read an OS-owned format descriptor and free it.
///
/// # Safety
/// `ptr` must come from `GetMixFormat`.
unsafe fn take_mix_format(ptr: *mut WAVEFORMATEX) -> NativeResult<WaveFormat> {
    if ptr.is_null() {
        return Err(NativeError::new(
            DriverErrorKind::UnsupportedFormat,
            0,
            "GetMixFormat",
        ));
    }
    let wfx = *ptr;
    let is_float = if u32::from(wfx.wFormatTag) == WAVE_FORMAT_EXTENSIBLE {
        let ext = *(ptr as *const WAVEFORMATEXTENSIBLE);
        let sub: GUID = ext.SubFormat;
        sub == KSDATAFORMAT_SUBTYPE_IEEE_FLOAT
    } else {
        wfx.wFormatTag == 3
    };
    CoTaskMemFree(Some(ptr as *const _));

    let sample_format = match (is_float, wfx.wBitsPerSample) {
        (true, 32) => SampleFormat::F32,
        (false, 24) => SampleFormat::I24,
        (false, 16) => SampleFormat::I16,
        _ => {
            return Err(NativeError::new(
                DriverErrorKind::UnsupportedFormat,
                0,
                "mix format",
            ))
        }
    };
    Ok(WaveFormat::new(wfx.nSamplesPerSec, wfx.nChannels, sample_format))
}

/// Kernel auto-reset event.
pub struct WasapiEvent(HANDLE);

// SAFETY: event handles are process-wide and usable from any thread.
unsafe impl Send for WasapiEvent {}
unsafe impl Sync for WasapiEvent {}

impl ReadyEvent for WasapiEvent {
    fn wait(&self, timeout: Duration) -> WaitOutcome {
        let result = unsafe { WaitForSingleObject(self.0, timeout.as_millis() as u32) };
        if result == WAIT_OBJECT_0 {
            WaitOutcome::Signaled
        } else if result == WAIT_TIMEOUT {
            WaitOutcome::TimedOut
        } else {
            WaitOutcome::Closed
        }
    }

    fn signal(&self) {
        let _ = unsafe { SetEvent(self.0) };
    }

    fn raw_handle(&self) -> Option<isize> {
        Some(self.0 .0)
    }
}

impl Drop for WasapiEvent {
    fn drop(&mut self) {
        let _ = unsafe { CloseHandle(self.0) };
    }
}

/// Enumerates render endpoints through `IMMDeviceEnumerator`.
#[derive(Debug, Default, Clone)]
pub struct WasapiHost;

impl WasapiHost {
    pub fn new() -> Self {
        Self
    }

    fn enumerator() -> NativeResult<IMMDeviceEnumerator> {
        com_init();
        unsafe { CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL) }
            .map_err(|e| native(e, "CoCreateInstance"))
    }

    fn render_devices() -> NativeResult<Vec<IMMDevice>> {
        let enumerator = Self::enumerator()?;
        unsafe {
            let collection = enumerator
                .EnumAudioEndpoints(eRender, DEVICE_STATE_ACTIVE)
                .map_err(|e| native(e, "EnumAudioEndpoints"))?;
            let count = collection.GetCount().map_err(|e| native(e, "GetCount"))?;
            (0..count)
                .map(|i| collection.Item(i).map_err(|e| native(e, "Item")))
                .collect()
        }
    }

    fn device_id(device: &IMMDevice) -> Option<String> {
        unsafe {
            let id = device.GetId().ok()?;
            let text = id.to_string().ok();
            CoTaskMemFree(Some(id.0 as *const _));
            text
        }
    }

    fn friendly_name(device: &IMMDevice) -> String {
        unsafe {
            let name = device.OpenPropertyStore(STGM_READ).and_then(|store| {
                let value = store.GetValue(&PKEY_Device_FriendlyName)?;
                let text = PropVariantToStringAlloc(&value)?;
                let name = text.to_string().unwrap_or_default();
                CoTaskMemFree(Some(text.0 as *const _));
                Ok(name)
            });
            name.unwrap_or_else(|_| "Unknown device".into())
        }
    }

    fn describe(id: u32, device: &IMMDevice, default_id: Option<&str>) -> NativeResult<DeviceInfo> {
        let client: IAudioClient = unsafe { device.Activate(CLSCTX_ALL, None) }
            .map_err(|e| native(e, "Activate"))?;
        let mix = unsafe { take_mix_format(client.GetMixFormat().map_err(|e| native(e, "GetMixFormat"))?) }?;

        let mut sample_rates: Vec<u32> = [44_100, 48_000, 88_200, 96_000, 176_400, 192_000]
            .into_iter()
            .filter(|&rate| {
                SampleFormat::PREFERENCE.iter().any(|&fmt| {
                    let wfx = extensible(&WaveFormat::new(rate, mix.channels, fmt));
                    unsafe {
                        client
                            .IsFormatSupported(
                                AUDCLNT_SHAREMODE_EXCLUSIVE,
                                &wfx.Format as *const WAVEFORMATEX,
                                None,
                            )
                            .is_ok()
                    }
                })
            })
            .collect();
        if !sample_rates.contains(&mix.sample_rate) {
            sample_rates.push(mix.sample_rate);
            sample_rates.sort_unstable();
        }

        Ok(DeviceInfo {
            id,
            name: Self::friendly_name(device),
            max_input_channels: 0,
            max_output_channels: mix.channels,
            sample_rates,
            preferred_sample_rate: mix.sample_rate,
            is_default_input: false,
            is_default_output: default_id.is_some() && Self::device_id(device).as_deref() == default_id,
        })
    }
}

impl EndpointHost for WasapiHost {
    fn name(&self) -> &str {
        "WASAPI"
    }

    fn is_available(&self) -> bool {
        Self::enumerator()
            .and_then(|e| unsafe { e.GetDefaultAudioEndpoint(eRender, eConsole) }
                .map_err(|e| native(e, "GetDefaultAudioEndpoint")))
            .is_ok()
    }

    fn devices(&self) -> NativeResult<Vec<DeviceInfo>> {
        let enumerator = Self::enumerator()?;
        let default_id = unsafe { enumerator.GetDefaultAudioEndpoint(eRender, eConsole) }
            .ok()
            .and_then(|d| Self::device_id(&d));

        Self::render_devices()?
            .iter()
            .enumerate()
            .map(|(i, device)| Self::describe(i as u32, device, default_id.as_deref()))
            .collect()
    }

    fn activate(&self, device_id: Option<u32>) -> NativeResult<Box<dyn AudioClient>> {
        let enumerator = Self::enumerator()?;
        let default_id = unsafe { enumerator.GetDefaultAudioEndpoint(eRender, eConsole) }
            .ok()
            .and_then(|d| Self::device_id(&d));

        let devices = Self::render_devices()?;
        let index = match device_id {
            Some(id) => id as usize,
            None => devices
                .iter()
                .position(|d| Self::device_id(d) == default_id)
                .unwrap_or(0),
        };
        let device = devices.get(index).cloned().ok_or(NativeError::new(
            DriverErrorKind::DeviceNotFound,
            i64::from(AUDCLNT_E_DEVICE_INVALIDATED),
            "activate",
        ))?;

        let info = Self::describe(index as u32, &device, default_id.as_deref())?;
        let client = unsafe { device.Activate(CLSCTX_ALL, None) }
            .map_err(|e| native(e, "Activate"))?;

        Ok(Box::new(WasapiClient {
            device,
            client,
            info,
            mode: ShareMode::Shared,
            format: None,
            buffer_frames: 0,
        }))
    }

    fn create_event(&self) -> NativeResult<Arc<dyn ReadyEvent>> {
        let handle = unsafe { CreateEventW(None, false, false, None) }
            .map_err(|e| native(e, "CreateEventW"))?;
        Ok(Arc::new(WasapiEvent(handle)))
    }
}

struct WasapiClient {
    device: IMMDevice,
    client: IAudioClient,
    info: DeviceInfo,
    mode: ShareMode,
    format: Option<WaveFormat>,
    buffer_frames: u32,
}

// SAFETY: created in the MTA; see module docs.
unsafe impl Send for WasapiClient {}

impl WasapiClient {
    fn initialize_exclusive(&mut self, wfx: &WAVEFORMATEXTENSIBLE, period_frames: u32) -> NativeResult<()> {
        let rate = wfx.Format.nSamplesPerSec;
        let period = frames_to_reftime(period_frames, rate);
        let result = unsafe {
            self.client.Initialize(
                AUDCLNT_SHAREMODE_EXCLUSIVE,
                AUDCLNT_STREAMFLAGS_EVENTCALLBACK,
                period,
                period,
                &wfx.Format,
                None,
            )
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.code().0 as u32 == AUDCLNT_E_BUFFER_SIZE_NOT_ALIGNED => {
                // Retry with the aligned size the driver asks for
                let aligned = unsafe { self.client.GetBufferSize() }
                    .map_err(|e| native(e, "GetBufferSize"))?;
                self.client = unsafe { self.device.Activate(CLSCTX_ALL, None) }
                    .map_err(|e| native(e, "Activate"))?;
                let period = frames_to_reftime(aligned, rate);
                unsafe {
                    self.client.Initialize(
                        AUDCLNT_SHAREMODE_EXCLUSIVE,
                        AUDCLNT_STREAMFLAGS_EVENTCALLBACK,
                        period,
                        period,
                        &wfx.Format,
                        None,
                    )
                }
                .map_err(|e| native(e, "Initialize (aligned)"))
            }
            Err(err) => Err(native(err, "Initialize")),
        }
    }

    fn initialize_shared(&mut self, wfx: &WAVEFORMATEXTENSIBLE, period_frames: u32) -> NativeResult<()> {
        if let Ok(client3) = self.client.cast::<IAudioClient3>() {
            let low_latency = unsafe {
                client3.InitializeSharedAudioStream(
                    AUDCLNT_STREAMFLAGS_EVENTCALLBACK,
                    period_frames,
                    &wfx.Format,
                    None,
                )
            };
            if low_latency.is_ok() {
                return Ok(());
            }
        }
        unsafe {
            self.client.Initialize(
                AUDCLNT_SHAREMODE_SHARED,
                AUDCLNT_STREAMFLAGS_EVENTCALLBACK,
                0,
                0,
                &wfx.Format,
                None,
            )
        }
        .map_err(|e| native(e, "Initialize"))
    }
}

impl AudioClient for WasapiClient {
    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn mix_format(&self) -> NativeResult<WaveFormat> {
        unsafe {
            let ptr = self
                .client
                .GetMixFormat()
                .map_err(|e| native(e, "GetMixFormat"))?;
            take_mix_format(ptr)
        }
    }

    fn is_format_supported(&self, mode: ShareMode, format: &WaveFormat) -> bool {
        let wfx = extensible(format);
        let share = match mode {
            ShareMode::Exclusive => AUDCLNT_SHAREMODE_EXCLUSIVE,
            ShareMode::Shared => AUDCLNT_SHAREMODE_SHARED,
        };
        let mut closest: *mut WAVEFORMATEX = std::ptr::null_mut();
        let hr = unsafe {
            self.client
                .IsFormatSupported(share, &wfx.Format, Some(&mut closest))
        };
        if !closest.is_null() {
            unsafe { CoTaskMemFree(Some(closest as *const _)) };
        }
        // S_FALSE carries a closest match, which is not an exact hit
        hr.0 == 0
    }

    fn engine_period(&self, format: &WaveFormat) -> NativeResult<EnginePeriod> {
        if let Ok(client3) = self.client.cast::<IAudioClient3>() {
            let wfx = extensible(format);
            let (mut default, mut fundamental, mut min, mut max) = (0u32, 0u32, 0u32, 0u32);
            let queried = unsafe {
                client3.GetSharedModeEnginePeriod(
                    &wfx.Format,
                    &mut default,
                    &mut fundamental,
                    &mut min,
                    &mut max,
                )
            };
            if queried.is_ok() {
                return Ok(EnginePeriod {
                    default_frames: default,
                    fundamental_frames: fundamental,
                    min_frames: min,
                    max_frames: max,
                });
            }
        }

        let (mut default, mut min) = (0i64, 0i64);
        unsafe { self.client.GetDevicePeriod(Some(&mut default), Some(&mut min)) }
            .map_err(|e| native(e, "GetDevicePeriod"))?;
        let default_frames = reftime_to_frames(default, format.sample_rate);
        Ok(EnginePeriod {
            default_frames,
            fundamental_frames: default_frames,
            min_frames: default_frames,
            max_frames: default_frames,
        })
    }

    fn initialize(
        &mut self,
        mode: ShareMode,
        format: &WaveFormat,
        period_frames: u32,
        input_channels: u16,
        event: Arc<dyn ReadyEvent>,
    ) -> NativeResult<u32> {
        if input_channels > 0 {
            tracing::debug!(input_channels, "WASAPI endpoint renders output only");
        }
        let wfx = extensible(format);
        match mode {
            ShareMode::Exclusive => self.initialize_exclusive(&wfx, period_frames)?,
            ShareMode::Shared => self.initialize_shared(&wfx, period_frames)?,
        }

        let handle = event.raw_handle().ok_or(NativeError::new(
            DriverErrorKind::StreamOpenFailed,
            0,
            "event handle",
        ))?;
        unsafe { self.client.SetEventHandle(HANDLE(handle)) }
            .map_err(|e| native(e, "SetEventHandle"))?;

        self.buffer_frames =
            unsafe { self.client.GetBufferSize() }.map_err(|e| native(e, "GetBufferSize"))?;
        self.mode = mode;
        self.format = Some(*format);
        Ok(self.buffer_frames)
    }

    fn stream_latency_ms(&self) -> Option<f64> {
        let format = self.format?;
        let latency = unsafe { self.client.GetStreamLatency() }.ok()?;
        let latency_ms = latency as f64 / 10_000.0;
        // Shared-mode latency excludes the engine buffer
        Some(match self.mode {
            ShareMode::Exclusive => latency_ms,
            ShareMode::Shared => {
                latency_ms + 1000.0 * self.buffer_frames as f64 / format.sample_rate as f64
            }
        })
    }

    fn render_client(&mut self) -> NativeResult<Box<dyn RenderClient>> {
        let format = self.format.ok_or(NativeError::new(
            DriverErrorKind::StreamOpenFailed,
            i64::from(AUDCLNT_E_NOT_INITIALIZED),
            "render_client",
        ))?;
        let render: IAudioRenderClient = unsafe { self.client.GetService() }
            .map_err(|e| native(e, "GetService"))?;
        Ok(Box::new(WasapiRender {
            client: self.client.clone(),
            render,
            mode: self.mode,
            frame_bytes: format.frame_bytes(),
            buffer_frames: self.buffer_frames,
        }))
    }
}

struct WasapiRender {
    client: IAudioClient,
    render: IAudioRenderClient,
    mode: ShareMode,
    frame_bytes: usize,
    buffer_frames: u32,
}

// SAFETY: created in the MTA; see module docs.
unsafe impl Send for WasapiRender {}

impl RenderClient for WasapiRender {
    fn start(&mut self) -> NativeResult<()> {
        // Pre-roll one silent buffer so the first event has data behind it
        self.write_silence()?;
        unsafe { self.client.Start() }.map_err(|e| native(e, "Start"))
    }

    fn stop(&mut self) -> NativeResult<()> {
        unsafe { self.client.Stop() }.map_err(|e| native(e, "Stop"))
    }

    fn available_frames(&mut self) -> NativeResult<u32> {
        match self.mode {
            ShareMode::Exclusive => Ok(self.buffer_frames),
            ShareMode::Shared => {
                let padding = unsafe { self.client.GetCurrentPadding() }
                    .map_err(|e| native(e, "GetCurrentPadding"))?;
                Ok(self.buffer_frames.saturating_sub(padding))
            }
        }
    }

    fn get_buffer(&mut self, frames: u32) -> NativeResult<&mut [u8]> {
        let ptr = unsafe { self.render.GetBuffer(frames) }.map_err(|e| native(e, "GetBuffer"))?;
        let len = frames as usize * self.frame_bytes;
        // SAFETY: WASAPI hands out `frames` frames of writable memory until ReleaseBuffer
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, len) })
    }

    fn release_buffer(&mut self, frames: u32, silent: bool) -> NativeResult<()> {
        let flags = if silent {
            AUDCLNT_BUFFERFLAGS_SILENT.0 as u32
        } else {
            0
        };
        unsafe { self.render.ReleaseBuffer(frames, flags) }
            .map_err(|e| native(e, "ReleaseBuffer"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(AUDCLNT_E_DEVICE_INVALIDATED),
            DriverErrorKind::DeviceNotFound
        );
        assert_eq!(classify(AUDCLNT_E_DEVICE_IN_USE), DriverErrorKind::DeviceInUse);
        assert_eq!(
            classify(AUDCLNT_E_EXCLUSIVE_MODE_NOT_ALLOWED),
            DriverErrorKind::ExclusiveModeUnavailable
        );
        assert_eq!(classify(0x8000_4005), DriverErrorKind::Unknown);
    }

    #[test]
    fn test_reftime_conversion() {
        assert_eq!(frames_to_reftime(480, 48_000), 100_000);
        assert_eq!(reftime_to_frames(100_000, 48_000), 480);
    }

    #[test]
    fn test_extensible_layout() {
        let wfx = extensible(&WaveFormat::new(48_000, 2, SampleFormat::I24));
        assert_eq!(wfx.Format.nBlockAlign, 6);
        assert_eq!(wfx.Format.nAvgBytesPerSec, 288_000);
        assert_eq!(wfx.Format.cbSize, 22);
    }
}

//! RondoEngine: the facade that ties the device manager, the command queue and
//! the mixer together.

use crate::render::{EngineCore, SharedState};
use crate::tap::OutputTap;
use crate::watchdog::Watchdog;
use crate::{Error, Result};
use parking_lot::Mutex;
use rondo_core::{
    AudioCommand, CommandSender, DeviceInfo, DriverErrorKind, DriverStatistics, EngineConfig,
    LatencyInfo, SharedCallback, StreamConfig,
};
use rondo_driver::{
    DeviceManager, DriverState, DriverType, ModeChangeCallback, StreamErrorCallback,
};
use rondo_mixer::{AudioSource, Track, TrackId, TrackParams};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Control-side view of one mixer track, in mixer order.
#[derive(Clone)]
pub(crate) struct TrackHandle {
    pub id: TrackId,
    pub params: Arc<TrackParams>,
}

pub(crate) type TrackRegistry = Arc<Mutex<Vec<TrackHandle>>>;

/// Real-time audio engine.
///
/// Owns the device manager, the engine callback and the producer half of the
/// command queue. Parameter changes go through the queue and never touch the
/// audio thread's state; structural edits (adding or removing tracks) stop
/// the stream, edit, and restart it.
///
/// Callbacks registered through [`set_stream_error_callback`] and
/// [`set_driver_mode_change_callback`] run with the device manager locked and
/// must not call back into the engine.
///
/// [`set_stream_error_callback`]: Self::set_stream_error_callback
/// [`set_driver_mode_change_callback`]: Self::set_driver_mode_change_callback
///
/// # Example
///
/// ```ignore
/// use rondo::prelude::*;
///
/// let engine = RondoEngine::builder()
///     .sample_rate(48_000)
///     .buffer_size(256)
///     .build()?;
///
/// let tone = engine.add_track(Track::new("Tone").with_source(SineSource::default()))?;
/// engine.start()?;
/// engine.play();
/// engine.set_track_volume(tone, 0.5);
/// ```
pub struct RondoEngine {
    manager: Arc<Mutex<DeviceManager>>,
    core: Arc<Mutex<EngineCore>>,
    callback: SharedCallback,
    commands: Mutex<CommandSender>,
    shared: Arc<SharedState>,
    tracks: TrackRegistry,
    config: EngineConfig,
    watchdog: Option<Watchdog>,
}

impl RondoEngine {
    pub fn builder() -> crate::RondoEngineBuilder {
        crate::RondoEngineBuilder::default()
    }

    pub(crate) fn from_parts(
        manager: DeviceManager,
        core: EngineCore,
        commands: CommandSender,
        config: EngineConfig,
        watchdog_interval: Duration,
    ) -> Result<Self> {
        let shared = Arc::clone(core.shared());
        let tracks: TrackRegistry = Arc::new(Mutex::new(
            core.mixer()
                .tracks()
                .iter()
                .map(|t| TrackHandle {
                    id: t.id(),
                    params: Arc::clone(t.params()),
                })
                .collect(),
        ));
        let core = Arc::new(Mutex::new(core));
        let callback = SharedCallback::from_arc(Arc::clone(&core));
        let manager = Arc::new(Mutex::new(manager));

        let watchdog = Watchdog::spawn(
            Arc::clone(&manager),
            Arc::clone(&tracks),
            watchdog_interval,
        )
        .map_err(Error::Watchdog)?;

        Ok(Self {
            manager,
            core,
            callback,
            commands: Mutex::new(commands),
            shared,
            tracks,
            config,
            watchdog: Some(watchdog),
        })
    }

    // Stream lifecycle

    /// Open a stream with the current config if none is open.
    pub fn open(&self) -> Result<()> {
        let mut manager = self.manager.lock();
        if manager.is_stream_open() {
            return Ok(());
        }
        let config = manager.current_config();
        manager.open_stream(&config, self.callback.clone())?;
        self.sync_latency(&manager);
        Ok(())
    }

    pub(crate) fn open_with(&self, config: &StreamConfig) -> Result<()> {
        let mut manager = self.manager.lock();
        manager.open_stream(config, self.callback.clone())?;
        self.sync_latency(&manager);
        Ok(())
    }

    pub fn close(&self) {
        self.manager.lock().close_stream();
    }

    pub fn is_open(&self) -> bool {
        self.manager.lock().is_stream_open()
    }

    /// Start the audio thread, opening the stream first if needed.
    pub fn start(&self) -> Result<()> {
        self.open()?;
        self.manager.lock().start_stream()?;
        info!("engine started");
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.manager.lock().stop_stream()?;
        info!("engine stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.manager.lock().is_stream_running()
    }

    /// Configuration the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stream config of the open stream, or the one the next open will use.
    pub fn stream_config(&self) -> StreamConfig {
        self.manager.lock().current_config()
    }

    /// Run `f` with the device manager locked.
    pub fn with_manager<R>(&self, f: impl FnOnce(&mut DeviceManager) -> R) -> R {
        f(&mut self.manager.lock())
    }

    // Command queue

    /// Push a raw command. Returns `false` when the queue is full.
    pub fn push_command(&self, cmd: AudioCommand) -> bool {
        self.commands.lock().push(cmd)
    }

    pub fn set_track_volume(&self, track: TrackId, gain: f32) -> bool {
        self.push_for(track, |index| AudioCommand::set_track_volume(index, gain))
    }

    pub fn set_track_pan(&self, track: TrackId, pan: f32) -> bool {
        self.push_for(track, |index| AudioCommand::set_track_pan(index, pan))
    }

    pub fn set_track_mute(&self, track: TrackId, muted: bool) -> bool {
        self.push_for(track, |index| AudioCommand::set_track_mute(index, muted))
    }

    pub fn set_track_solo(&self, track: TrackId, soloed: bool) -> bool {
        self.push_for(track, |index| AudioCommand::set_track_solo(index, soloed))
    }

    pub fn update_clip_state(&self, track: TrackId, payload_index: u32) -> bool {
        self.push_for(track, |index| {
            AudioCommand::update_clip_state(index, payload_index)
        })
    }

    pub fn load_project_state(&self, payload_index: u32) -> bool {
        self.push_command(AudioCommand::load_project_state(payload_index))
    }

    pub fn play(&self) -> bool {
        self.push_command(AudioCommand::set_transport(true, None))
    }

    pub fn pause(&self) -> bool {
        self.push_command(AudioCommand::set_transport(false, None))
    }

    /// Jump to `sample_pos`, keeping the current play state.
    pub fn seek(&self, sample_pos: u64) -> bool {
        let playing = self.shared.playing.get();
        self.push_command(AudioCommand::set_transport(playing, Some(sample_pos)))
    }

    pub fn start_preview(&self, slot: u32) -> bool {
        self.push_command(AudioCommand::start_preview(slot))
    }

    pub fn stop_preview(&self) -> bool {
        self.push_command(AudioCommand::stop_preview())
    }

    pub fn command_queue_capacity(&self) -> usize {
        self.commands.lock().capacity()
    }

    pub fn pending_commands(&self) -> usize {
        self.commands.lock().approx_depth()
    }

    pub fn dropped_commands(&self) -> u64 {
        self.commands.lock().dropped_count()
    }

    pub fn max_command_depth(&self) -> u32 {
        self.commands.lock().max_depth()
    }

    fn push_for(&self, track: TrackId, build: impl FnOnce(u32) -> AudioCommand) -> bool {
        match self.track_index(track) {
            Some(index) => self.push_command(build(index as u32)),
            None => false,
        }
    }

    // Tracks

    /// Add a track at the end of the mixer. Stops and restarts a running stream.
    pub fn add_track(&self, track: Track) -> Result<TrackId> {
        let params = Arc::clone(track.params());
        let (input_ms, output_ms) = self.latency_compensation();
        params.set_latency_compensation(input_ms as f32, output_ms as f32);

        let id = self.structural(|core| core.mixer_mut().add_track(track))?;
        self.tracks.lock().push(TrackHandle { id, params });
        debug!(%id, "track added");
        Ok(id)
    }

    /// Remove a track. Later tracks move down one index.
    pub fn remove_track(&self, id: TrackId) -> Result<Option<Track>> {
        let removed = self.structural(|core| core.mixer_mut().remove_track(id))?;
        if removed.is_some() {
            self.tracks.lock().retain(|t| t.id != id);
            debug!(%id, "track removed");
        }
        Ok(removed)
    }

    /// Run a structural edit with the audio thread stopped.
    fn structural<R>(&self, edit: impl FnOnce(&mut EngineCore) -> R) -> Result<R> {
        let mut manager = self.manager.lock();
        let was_running = manager.is_stream_running();
        if was_running {
            manager.stop_stream()?;
        }
        let result = {
            let mut core = self.core.lock();
            // Index-addressed commands must land before indices shift
            core.apply_pending_commands();
            let result = edit(&mut core);
            core.publish_flags();
            result
        };
        if was_running {
            manager.start_stream()?;
        }
        Ok(result)
    }

    pub fn track_ids(&self) -> Vec<TrackId> {
        self.tracks.lock().iter().map(|t| t.id).collect()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.lock().len()
    }

    /// Mixer index used by track commands.
    pub fn track_index(&self, id: TrackId) -> Option<usize> {
        self.tracks.lock().iter().position(|t| t.id == id)
    }

    /// Shared parameter block of a track, for reading back gain, mute, solo.
    pub fn track_params(&self, id: TrackId) -> Option<Arc<TrackParams>> {
        self.tracks
            .lock()
            .iter()
            .find(|t| t.id == id)
            .map(|t| Arc::clone(&t.params))
    }

    /// Run `f` with the engine core locked. The audio thread plays silence
    /// while the lock is held.
    pub fn with_core<R>(&self, f: impl FnOnce(&mut EngineCore) -> R) -> R {
        let mut core = self.core.lock();
        let result = f(&mut core);
        core.publish_flags();
        result
    }

    #[cfg(feature = "parallel")]
    pub fn set_parallel_processing(&self, enabled: bool) -> Result<()> {
        self.structural(|core| {
            if enabled {
                core.mixer_mut().enable_parallel(0)
            } else {
                core.mixer_mut().disable_parallel();
                Ok(())
            }
        })??;
        Ok(())
    }

    pub fn is_parallel_processing(&self) -> bool {
        self.shared.parallel.get()
    }

    // Preview

    /// Register a source in a preview slot, replacing any previous one.
    pub fn set_preview_source(&self, slot: u32, source: Box<dyn AudioSource>) -> Result<()> {
        self.replace_preview(slot, Some(source)).map(drop)
    }

    pub fn clear_preview_source(&self, slot: u32) -> Result<Option<Box<dyn AudioSource>>> {
        self.replace_preview(slot, None)
    }

    pub fn preview_slots(&self) -> usize {
        self.shared.preview_capacity
    }

    fn replace_preview(
        &self,
        slot: u32,
        source: Option<Box<dyn AudioSource>>,
    ) -> Result<Option<Box<dyn AudioSource>>> {
        let previous = {
            let mut core = self.core.lock();
            let previews = core.previews_mut();
            let capacity = previews.capacity();
            previews
                .register(slot as usize, source)
                .ok_or(Error::PreviewSlot { slot, capacity })?
        };
        // Dropped here, outside the lock
        Ok(previous)
    }

    // Master stage and output

    pub fn set_master_gain(&self, gain: f32) {
        if !gain.is_nan() {
            self.shared.master.gain.set(gain.max(0.0));
        }
    }

    pub fn master_gain(&self) -> f32 {
        self.shared.master.gain.get()
    }

    /// DC blocker plus soft clipper on the master output.
    pub fn set_safety_processing(&self, enabled: bool) {
        self.shared.master.safety.set(enabled);
    }

    pub fn is_safety_processing(&self) -> bool {
        self.shared.master.safety.get()
    }

    /// `(left, right)` peak of the last period.
    pub fn peak_levels(&self) -> (f32, f32) {
        self.shared.master.meters.peak()
    }

    /// `(left, right)` RMS of the last period.
    pub fn rms_levels(&self) -> (f32, f32) {
        self.shared.master.meters.rms()
    }

    pub fn set_output_tap(&self, tap: impl OutputTap + 'static) {
        let previous = self.core.lock().replace_tap(Some(Box::new(tap)));
        drop(previous);
    }

    pub fn has_output_tap(&self) -> bool {
        self.shared.tap_installed.get()
    }

    pub fn clear_output_tap(&self) {
        let previous = self.core.lock().replace_tap(None);
        drop(previous);
    }

    /// Periods rendered since the engine was built.
    pub fn rendered_periods(&self) -> u64 {
        self.shared.periods.get()
    }

    // Transport

    pub fn is_playing(&self) -> bool {
        self.shared.playing.get()
    }

    pub fn position_samples(&self) -> u64 {
        self.shared.position.load(Ordering::Acquire)
    }

    pub fn position_seconds(&self) -> f64 {
        let rate = self.shared.sample_rate.load(Ordering::Acquire);
        if rate == 0 {
            return 0.0;
        }
        self.position_samples() as f64 / f64::from(rate)
    }

    // Devices and reconfiguration

    pub fn devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.manager.lock().devices()?)
    }

    pub fn default_output_device(&self) -> Option<DeviceInfo> {
        self.manager.lock().default_output_device()
    }

    pub fn default_input_device(&self) -> Option<DeviceInfo> {
        self.manager.lock().default_input_device()
    }

    pub fn validate_device_config(&self, device_id: u32, sample_rate: u32) -> bool {
        self.manager
            .lock()
            .validate_device_config(device_id, sample_rate)
    }

    pub fn switch_device(&self, device_id: u32) -> Result<()> {
        self.reconfigure(|manager| manager.switch_device(device_id))
    }

    pub fn set_sample_rate(&self, sample_rate: u32) -> Result<()> {
        self.reconfigure(|manager| manager.set_sample_rate(sample_rate))
    }

    pub fn set_buffer_size(&self, frames: u32) -> Result<()> {
        self.reconfigure(|manager| manager.set_buffer_size(frames))
    }

    fn reconfigure(
        &self,
        change: impl FnOnce(&mut DeviceManager) -> rondo_driver::Result<()>,
    ) -> Result<()> {
        let mut manager = self.manager.lock();
        let result = change(&mut manager);
        self.sync_latency(&manager);
        Ok(result?)
    }

    /// Push the manager's input/output latency into every track.
    fn sync_latency(&self, manager: &DeviceManager) {
        let (input_ms, output_ms) = manager.latency_compensation();
        for track in self.tracks.lock().iter() {
            track
                .params
                .set_latency_compensation(input_ms as f32, output_ms as f32);
        }
    }

    // Driver selection

    /// Takes effect on the next open.
    pub fn set_preferred_driver_type(&self, driver_type: DriverType) {
        self.manager.lock().set_preferred_driver_type(driver_type);
    }

    pub fn preferred_driver_type(&self) -> DriverType {
        self.manager.lock().preferred_driver_type()
    }

    pub fn is_driver_type_available(&self, driver_type: DriverType) -> bool {
        self.manager.lock().is_driver_type_available(driver_type)
    }

    pub fn is_using_fallback_driver(&self) -> bool {
        self.manager.lock().is_using_fallback_driver()
    }

    pub fn fallback_reason(&self) -> Option<String> {
        self.manager.lock().fallback_reason().map(str::to_string)
    }

    pub fn active_driver_type(&self) -> Option<DriverType> {
        self.manager.lock().active_driver_type()
    }

    pub fn available_driver_types(&self) -> Vec<DriverType> {
        self.manager.lock().available_driver_types()
    }

    pub fn set_driver_mode_change_callback(
        &self,
        callback: impl Fn(DriverType, DriverType, &str) + Send + Sync + 'static,
    ) {
        let callback: ModeChangeCallback = Box::new(callback);
        self.manager.lock().set_driver_mode_change_callback(callback);
    }

    // Auto buffer scaling

    pub fn set_auto_buffer_scaling(&self, enabled: bool, underrun_threshold: u32) {
        self.manager
            .lock()
            .set_auto_buffer_scaling(enabled, underrun_threshold);
    }

    /// Run one scaling check now instead of waiting for the watchdog.
    pub fn check_and_auto_scale_buffer(&self) -> Result<bool> {
        let mut manager = self.manager.lock();
        let scaled = manager.check_and_auto_scale_buffer()?;
        if scaled {
            self.sync_latency(&manager);
        }
        Ok(scaled)
    }

    // Suspend / resume

    pub fn suspend_audio(&self) -> Result<()> {
        Ok(self.manager.lock().suspend_audio()?)
    }

    pub fn resume_audio(&self) -> Result<()> {
        Ok(self.manager.lock().resume_audio()?)
    }

    pub fn is_suspended(&self) -> bool {
        self.manager.lock().is_suspended()
    }

    /// Host focus changed. Releases or reacquires the device when
    /// `release_in_background` is configured, otherwise does nothing.
    pub fn set_app_focused(&self, focused: bool) -> Result<()> {
        if !self.config.release_in_background {
            return Ok(());
        }
        if focused {
            self.resume_audio()
        } else {
            self.suspend_audio()
        }
    }

    // Errors

    /// Fired on the watchdog thread for fatal errors after start.
    pub fn set_stream_error_callback(
        &self,
        callback: impl Fn(DriverErrorKind, &str) + Send + Sync + 'static,
    ) {
        let callback: StreamErrorCallback = Arc::new(callback);
        self.manager.lock().set_stream_error_callback(callback);
    }

    /// Surface a deferred error now instead of waiting for the watchdog.
    pub fn poll_errors(&self) -> Option<(DriverErrorKind, String)> {
        self.manager.lock().poll_errors()
    }

    pub fn latched_error(&self) -> Option<(DriverErrorKind, String)> {
        self.manager.lock().latched_error()
    }

    pub fn clear_latched_error(&self) {
        self.manager.lock().clear_latched_error();
    }

    // Statistics and latency

    pub fn state(&self) -> DriverState {
        self.manager.lock().state()
    }

    pub fn statistics(&self) -> DriverStatistics {
        self.manager.lock().statistics()
    }

    pub fn reset_statistics(&self) {
        self.manager.lock().reset_statistics();
    }

    /// One-way output latency in seconds.
    pub fn stream_latency(&self) -> f64 {
        self.manager.lock().stream_latency()
    }

    pub fn latency_info(&self) -> Option<LatencyInfo> {
        self.manager.lock().latency_info()
    }

    /// `(input_ms, output_ms)`.
    pub fn latency_compensation(&self) -> (f64, f64) {
        self.manager.lock().latency_compensation()
    }

    pub fn sample_rate(&self) -> u32 {
        self.manager.lock().stream_sample_rate()
    }

    pub fn buffer_size(&self) -> u32 {
        self.manager.lock().stream_buffer_size()
    }
}

impl Drop for RondoEngine {
    fn drop(&mut self) {
        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.stop();
        }
        self.manager.lock().shutdown();
        debug!("engine dropped");
    }
}

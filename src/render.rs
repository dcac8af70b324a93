//! The engine's audio callback: command drain, transport, mixing, master stage.

use crate::master::{MasterControls, MasterStage};
use crate::preview::{PreviewSlots, DEFAULT_PREVIEW_SLOTS};
use crate::tap::{OutputTap, TapSlot};
use crate::Result;
use rondo_core::{
    AtomicCounter, AtomicFlag, AudioCallback, AudioCommand, CallbackControl, CommandKind,
    CommandReceiver, EngineConfig, StreamFormat,
};
use rondo_mixer::Mixer;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// State the audio thread publishes and the control side reads, lock-free.
#[derive(Debug)]
pub(crate) struct SharedState {
    pub master: MasterControls,
    pub playing: AtomicFlag,
    pub position: AtomicU64,
    pub sample_rate: AtomicU32,
    pub periods: AtomicCounter,
    pub parallel: AtomicFlag,
    pub tap_installed: AtomicFlag,
    /// Fixed when the core is built.
    pub preview_capacity: usize,
}

impl SharedState {
    fn new(safety: bool, preview_capacity: usize) -> Self {
        Self {
            master: MasterControls::new(safety),
            playing: AtomicFlag::new(false),
            position: AtomicU64::new(0),
            sample_rate: AtomicU32::new(0),
            periods: AtomicCounter::new(),
            parallel: AtomicFlag::new(false),
            tap_installed: AtomicFlag::new(false),
            preview_capacity,
        }
    }
}

/// Everything a command can touch.
struct RenderState {
    mixer: Mixer,
    previews: PreviewSlots,
    playing: bool,
    position: u64,
}

impl RenderState {
    #[inline]
    fn apply(&mut self, cmd: AudioCommand) {
        match cmd.kind {
            CommandKind::None => {}
            CommandKind::SetTransportState => {
                self.playing = cmd.flag();
                if let Some(pos) = cmd.seek_target() {
                    self.position = pos;
                    self.mixer.seek(pos);
                }
            }
            CommandKind::StartPreview => {
                self.previews.start(cmd.payload_index as usize);
            }
            CommandKind::StopPreview => self.previews.stop(),
            _ => {
                self.mixer.apply(&cmd);
            }
        }
    }
}

/// Audio callback installed by [`RondoEngine`](crate::RondoEngine).
///
/// Lives behind the engine lock; the audio thread only ever `try_lock`s it and
/// plays silence for a period in which a control thread holds it. Usable on
/// its own with any backend through
/// [`SharedCallback`](rondo_core::SharedCallback).
pub struct EngineCore {
    commands: CommandReceiver,
    state: RenderState,
    master: MasterStage,
    tap: TapSlot,
    shared: Arc<SharedState>,
    /// Mix buffer when the device has more channels than the mixer.
    scratch: Vec<f32>,
    device_channels: usize,
    channels: usize,
    sample_rate: u32,
    max_frames: usize,
}

impl EngineCore {
    pub fn new(config: &EngineConfig, commands: CommandReceiver) -> Result<Self> {
        Self::with_preview_slots(config, commands, DEFAULT_PREVIEW_SLOTS)
    }

    pub fn with_preview_slots(
        config: &EngineConfig,
        commands: CommandReceiver,
        preview_slots: usize,
    ) -> Result<Self> {
        config.validate()?;
        let channels = usize::from(config.output_channels).clamp(1, 2);

        #[allow(unused_mut)]
        let mut mixer = Mixer::new(channels);
        mixer.set_parallel_threshold(config.parallel_threshold);
        #[cfg(feature = "parallel")]
        if config.parallel_processing {
            mixer.enable_parallel(0)?;
        }

        let previews = PreviewSlots::new(preview_slots);
        let shared = Arc::new(SharedState::new(false, previews.capacity()));
        shared.parallel.set(mixer.is_parallel());

        Ok(Self {
            commands,
            state: RenderState {
                mixer,
                previews,
                playing: false,
                position: 0,
            },
            master: MasterStage::new(),
            tap: TapSlot::new(),
            shared,
            scratch: Vec::new(),
            device_channels: channels,
            channels,
            sample_rate: 0,
            max_frames: 0,
        })
    }

    pub fn mixer(&self) -> &Mixer {
        &self.state.mixer
    }

    /// Structural access. Hold the engine lock or keep the stream stopped.
    pub fn mixer_mut(&mut self) -> &mut Mixer {
        &mut self.state.mixer
    }

    pub fn is_prepared(&self) -> bool {
        self.sample_rate > 0
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_playing(&self) -> bool {
        self.state.playing
    }

    pub fn position_samples(&self) -> u64 {
        self.state.position
    }

    /// Apply queued commands now. For control threads flushing the queue
    /// before a structural edit while the stream is stopped.
    pub fn apply_pending_commands(&mut self) -> usize {
        let state = &mut self.state;
        let applied = self.commands.drain(|cmd| state.apply(cmd));
        self.publish();
        applied
    }

    pub(crate) fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub(crate) fn previews_mut(&mut self) -> &mut PreviewSlots {
        &mut self.state.previews
    }

    /// Install or remove the output tap, returning the previous one.
    pub(crate) fn replace_tap(
        &mut self,
        tap: Option<Box<dyn OutputTap>>,
    ) -> Option<Box<dyn OutputTap>> {
        let previous = self.tap.replace(tap);
        self.shared.tap_installed.set(self.tap.is_installed());
        previous
    }

    /// Republish control-visible flags after an edit through `mixer_mut`.
    pub(crate) fn publish_flags(&self) {
        self.shared.parallel.set(self.state.mixer.is_parallel());
        self.shared.tap_installed.set(self.tap.is_installed());
    }

    #[inline]
    fn publish(&self) {
        self.shared.playing.set(self.state.playing);
        self.shared
            .position
            .store(self.state.position, Ordering::Release);
    }
}

impl AudioCallback for EngineCore {
    fn prepare(&mut self, format: &StreamFormat) {
        self.sample_rate = format.sample_rate;
        self.device_channels = usize::from(format.output_channels).max(1);
        self.channels = self.device_channels.min(2);
        self.max_frames = (format.buffer_frames as usize).max(1);

        self.state
            .mixer
            .prepare(self.sample_rate, self.channels, self.max_frames);
        self.state
            .previews
            .prepare(self.sample_rate, self.channels, self.max_frames);
        self.master.prepare(self.sample_rate, &self.shared.master);
        self.tap.prepare(self.max_frames);

        self.scratch.clear();
        self.scratch.resize(self.max_frames * self.channels, 0.0);
        self.shared
            .sample_rate
            .store(self.sample_rate, Ordering::Release);

        tracing::debug!(
            rate = self.sample_rate,
            frames = self.max_frames,
            channels = self.device_channels,
            tracks = self.state.mixer.track_count(),
            "engine prepared"
        );
    }

    fn render(
        &mut self,
        output: &mut [f32],
        _input: Option<&[f32]>,
        frames: u32,
        stream_time: f64,
    ) -> CallbackControl {
        let state = &mut self.state;
        self.commands.drain(|cmd| state.apply(cmd));

        let frames = (frames as usize)
            .min(self.max_frames)
            .min(output.len() / self.device_channels.max(1));
        if frames == 0 || self.sample_rate == 0 {
            return CallbackControl::Continue;
        }

        let channels = self.channels;
        let len = frames * channels;
        let direct = self.device_channels == channels;
        let mix: &mut [f32] = if direct {
            &mut output[..len]
        } else {
            &mut self.scratch[..len]
        };
        mix.fill(0.0);

        let state = &mut self.state;
        state
            .mixer
            .render(mix, frames, stream_time, state.playing);
        state
            .previews
            .render(mix, channels, frames, stream_time, self.sample_rate);
        self.master
            .process(mix, frames, channels, &self.shared.master);
        self.tap.feed(mix, frames, channels, self.sample_rate);

        if !direct {
            for (dst, src) in output
                .chunks_exact_mut(self.device_channels)
                .zip(self.scratch.chunks_exact(channels))
                .take(frames)
            {
                dst[..channels].copy_from_slice(src);
                dst[channels..].fill(0.0);
            }
        }

        if self.state.playing {
            self.state.position += frames as u64;
        }
        self.publish();
        self.shared.periods.increment();
        CallbackControl::Continue
    }
}

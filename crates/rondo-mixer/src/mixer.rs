//! Track list, solo logic and rendering into the main bus.

use crate::bus::MixerBus;
#[cfg(feature = "parallel")]
use crate::pool::RenderPool;
use crate::track::{Track, TrackId, TrackParams};
use rondo_core::config::DEFAULT_PARALLEL_THRESHOLD;
use rondo_core::{AudioCommand, CommandKind};
use std::sync::Arc;

/// Owns the tracks and renders them into a single bus.
///
/// Structural edits (`add_track`, `remove_track`, `prepare`) allocate and must
/// happen while the stream is stopped or under the engine lock. `apply` and
/// `render` are real-time safe.
pub struct Mixer {
    tracks: Vec<Track>,
    bus: MixerBus,
    mix: Vec<f32>,
    next_id: u64,
    sample_rate: u32,
    channels: usize,
    max_frames: usize,
    any_soloed: bool,
    parallel_threshold: usize,
    #[cfg(feature = "parallel")]
    pool: Option<RenderPool>,
}

impl Mixer {
    pub fn new(channels: usize) -> Self {
        let channels = channels.clamp(1, 2);
        Self {
            tracks: Vec::new(),
            bus: MixerBus::new("Main", channels),
            mix: Vec::new(),
            next_id: 1,
            sample_rate: 0,
            channels,
            max_frames: 0,
            any_soloed: false,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
            #[cfg(feature = "parallel")]
            pool: None,
        }
    }

    /// Size every buffer for a stream. Not real-time safe.
    pub fn prepare(&mut self, sample_rate: u32, channels: usize, max_frames: usize) {
        self.sample_rate = sample_rate;
        self.channels = channels.clamp(1, 2);
        self.max_frames = max_frames;
        if self.bus.channels() != self.channels {
            let bus = MixerBus::new(self.bus.name().to_string(), self.channels);
            bus.set_gain(self.bus.gain());
            bus.set_pan(self.bus.pan());
            bus.set_muted(self.bus.is_muted());
            self.bus = bus;
        }
        self.mix.clear();
        self.mix.resize(max_frames * self.channels, 0.0);
        for track in &mut self.tracks {
            track.prepare(sample_rate, self.channels, max_frames);
        }
        tracing::debug!(
            sample_rate,
            channels = self.channels,
            max_frames,
            tracks = self.tracks.len(),
            "mixer prepared"
        );
    }

    pub fn is_prepared(&self) -> bool {
        self.max_frames > 0
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn bus(&self) -> &MixerBus {
        &self.bus
    }

    /// Add a track and return its id. Not real-time safe.
    pub fn add_track(&mut self, mut track: Track) -> TrackId {
        let id = TrackId(self.next_id);
        self.next_id += 1;
        track.assign_id(id);
        if self.is_prepared() {
            track.prepare(self.sample_rate, self.channels, self.max_frames);
        }
        self.tracks.push(track);
        self.recompute_solo();
        id
    }

    /// Remove a track. Later tracks shift down one index. Not real-time safe.
    pub fn remove_track(&mut self, id: TrackId) -> Option<Track> {
        let index = self.track_index(id)?;
        let track = self.tracks.remove(index);
        self.recompute_solo();
        Some(track)
    }

    pub fn track_index(&self, id: TrackId) -> Option<usize> {
        self.tracks.iter().position(|t| t.id() == id)
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id() == id)
    }

    pub fn track_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id() == id)
    }

    pub fn track_at(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn params(&self, id: TrackId) -> Option<Arc<TrackParams>> {
        self.track(id).map(|t| Arc::clone(t.params()))
    }

    pub fn any_soloed(&self) -> bool {
        self.any_soloed
    }

    /// Refresh every track's solo-mute from the solo flags.
    pub fn recompute_solo(&mut self) {
        self.any_soloed = self
            .tracks
            .iter()
            .any(|t| !t.is_system() && t.params().is_soloed());
        for track in &self.tracks {
            let params = track.params();
            params.set_solo_muted(self.any_soloed && !track.is_system() && !params.is_soloed());
        }
    }

    /// Apply a track-level command. Returns `false` for commands the mixer does
    /// not handle or an out-of-range track index.
    pub fn apply(&mut self, cmd: &AudioCommand) -> bool {
        match cmd.kind {
            CommandKind::LoadProjectState => {
                for track in &mut self.tracks {
                    if let Some(source) = track.source_mut() {
                        source.on_project_state(cmd.payload_index);
                    }
                }
                return true;
            }
            CommandKind::SetTrackVolume
            | CommandKind::SetTrackPan
            | CommandKind::SetTrackMute
            | CommandKind::SetTrackSolo
            | CommandKind::UpdateClipState => {}
            _ => return false,
        }

        let Some(track) = self.tracks.get_mut(cmd.track_index as usize) else {
            return false;
        };
        match cmd.kind {
            CommandKind::SetTrackVolume => track.params().set_gain(cmd.value1),
            CommandKind::SetTrackPan => track.params().set_pan(cmd.value1),
            CommandKind::SetTrackMute => track.params().set_muted(cmd.flag()),
            CommandKind::SetTrackSolo => {
                track.params().set_soloed(cmd.flag());
                self.recompute_solo();
            }
            CommandKind::UpdateClipState => {
                if let Some(source) = track.source_mut() {
                    source.on_clip_update(cmd.payload_index);
                }
            }
            _ => {}
        }
        true
    }

    pub fn seek(&mut self, sample_pos: u64) {
        for track in &mut self.tracks {
            track.seek(sample_pos);
        }
    }

    /// Threshold at or above which the worker pool is used.
    pub fn set_parallel_threshold(&mut self, threshold: usize) {
        self.parallel_threshold = threshold.max(1);
    }

    pub fn parallel_threshold(&self) -> usize {
        self.parallel_threshold
    }

    #[cfg(feature = "parallel")]
    pub fn enable_parallel(&mut self, threads: usize) -> Result<(), rayon::ThreadPoolBuildError> {
        if self.pool.is_none() {
            self.pool = Some(RenderPool::new(threads)?);
        }
        Ok(())
    }

    #[cfg(feature = "parallel")]
    pub fn disable_parallel(&mut self) {
        self.pool = None;
    }

    pub fn is_parallel(&self) -> bool {
        #[cfg(feature = "parallel")]
        {
            self.pool.is_some()
        }
        #[cfg(not(feature = "parallel"))]
        {
            false
        }
    }

    /// Render all tracks and sum the bus into `out`.
    ///
    /// `out` is summed into, not cleared. With the transport stopped only
    /// system tracks render.
    pub fn render(&mut self, out: &mut [f32], frames: usize, stream_time: f64, playing: bool) {
        let frames = frames.min(self.max_frames);
        let len = frames * self.channels;
        if len == 0 {
            return;
        }
        let channels = self.channels;
        let sample_rate = self.sample_rate;

        let mix = &mut self.mix[..len];
        mix.fill(0.0);

        #[cfg(feature = "parallel")]
        if let Some(pool) = self.pool.as_ref().filter(|_| self.tracks.len() >= self.parallel_threshold) {
            pool.render(&mut self.tracks, playing, channels, frames, stream_time, sample_rate);
            for track in self.tracks.iter().filter(|t| playing || t.is_system()) {
                for (m, s) in mix.iter_mut().zip(track.isolated_output(len)) {
                    *m += s;
                }
            }
            self.bus.mix_into(out, mix, frames);
            return;
        }

        for track in self.tracks.iter_mut().filter(|t| playing || t.is_system()) {
            track.process(mix, channels, frames, stream_time, sample_rate);
        }
        self.bus.mix_into(out, mix, frames);
    }
}

//! Tracks: atomic parameters written by the UI, smoothed and rendered by the
//! audio thread.

use crate::source::AudioSource;
use rondo_core::{constant_power_gains, AtomicFlag, AtomicFloat, SmoothedValue, DEFAULT_SMOOTHING_SECS};
use std::fmt;
use std::sync::Arc;

pub const MIN_GAIN: f32 = 0.0;
pub const MAX_GAIN: f32 = 2.0;

/// Stable track identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track#{}", self.0)
    }
}

/// Lock-free track parameters.
///
/// Written with release ordering by control threads (directly or through the
/// command queue), read with acquire ordering on the audio thread.
#[derive(Debug)]
pub struct TrackParams {
    gain: AtomicFloat,
    pan: AtomicFloat,
    muted: AtomicFlag,
    soloed: AtomicFlag,
    /// Another track is soloed and this one is not.
    solo_muted: AtomicFlag,
    input_latency_ms: AtomicFloat,
    output_latency_ms: AtomicFloat,
}

impl Default for TrackParams {
    fn default() -> Self {
        Self {
            gain: AtomicFloat::new(1.0),
            pan: AtomicFloat::new(0.0),
            muted: AtomicFlag::new(false),
            soloed: AtomicFlag::new(false),
            solo_muted: AtomicFlag::new(false),
            input_latency_ms: AtomicFloat::new(0.0),
            output_latency_ms: AtomicFloat::new(0.0),
        }
    }
}

impl TrackParams {
    #[inline]
    pub fn gain(&self) -> f32 {
        self.gain.get()
    }

    /// Clamped to `[0, 2]`. NaN is ignored.
    pub fn set_gain(&self, gain: f32) {
        if !gain.is_nan() {
            self.gain.set(gain.clamp(MIN_GAIN, MAX_GAIN));
        }
    }

    #[inline]
    pub fn pan(&self) -> f32 {
        self.pan.get()
    }

    /// Clamped to `[-1, 1]`. NaN is ignored.
    pub fn set_pan(&self, pan: f32) {
        if !pan.is_nan() {
            self.pan.set(pan.clamp(-1.0, 1.0));
        }
    }

    #[inline]
    pub fn is_muted(&self) -> bool {
        self.muted.get()
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.set(muted);
    }

    #[inline]
    pub fn is_soloed(&self) -> bool {
        self.soloed.get()
    }

    /// Solo goes through `Mixer::apply`, which recomputes solo-mute after it.
    pub(crate) fn set_soloed(&self, soloed: bool) {
        self.soloed.set(soloed);
    }

    #[inline]
    pub fn is_solo_muted(&self) -> bool {
        self.solo_muted.get()
    }

    pub(crate) fn set_solo_muted(&self, solo_muted: bool) {
        self.solo_muted.set(solo_muted);
    }

    /// `user-mute OR solo-mute`. System tracks ignore solo-mute.
    #[inline]
    pub fn is_silenced(&self, system: bool) -> bool {
        self.is_muted() || (!system && self.is_solo_muted())
    }

    pub fn set_latency_compensation(&self, input_ms: f32, output_ms: f32) {
        self.input_latency_ms.set(input_ms.max(0.0));
        self.output_latency_ms.set(output_ms.max(0.0));
    }

    /// Total delay applied when aligning recorded material.
    pub fn latency_compensation_ms(&self) -> f32 {
        self.input_latency_ms.get() + self.output_latency_ms.get()
    }
}

/// Audio-thread state of a track.
struct TrackDsp {
    source: Option<Box<dyn AudioSource>>,
    gain: SmoothedValue,
    pan: SmoothedValue,
    /// Source output, `max_frames * 2`.
    scratch: Vec<f32>,
}

impl TrackDsp {
    fn render(
        &mut self,
        params: &TrackParams,
        system: bool,
        out: &mut [f32],
        out_channels: usize,
        frames: usize,
        stream_time: f64,
        sample_rate: u32,
    ) {
        let Some(source) = self.source.as_mut() else {
            return;
        };
        let src_channels = source.channels().clamp(1, 2);
        let needed = frames * src_channels;
        if needed > self.scratch.len() {
            return;
        }

        let input = &mut self.scratch[..needed];
        input.fill(0.0);
        source.render(input, frames, stream_time, sample_rate);

        self.gain.set_target(params.gain());
        self.pan.set_target(params.pan());

        if params.is_silenced(system) {
            // Unmute fades in from zero
            self.gain.snap_to(0.0);
            self.gain.set_target(params.gain());
            self.pan.skip_to_target();
            return;
        }

        let input = &self.scratch[..needed];
        let (mut left, mut right) = constant_power_gains(self.pan.current());
        let pan_moving = self.pan.is_smoothing();

        match (src_channels, out_channels) {
            (1, 2) => {
                for (i, frame) in out.chunks_exact_mut(2).take(frames).enumerate() {
                    let g = self.gain.next_sample();
                    if pan_moving {
                        (left, right) = constant_power_gains(self.pan.next_sample());
                    }
                    let s = input[i] * g;
                    frame[0] += s * left;
                    frame[1] += s * right;
                }
            }
            (2, 2) => {
                for (i, frame) in out.chunks_exact_mut(2).take(frames).enumerate() {
                    let g = self.gain.next_sample();
                    if pan_moving {
                        (left, right) = constant_power_gains(self.pan.next_sample());
                    }
                    frame[0] += input[2 * i] * g * left;
                    frame[1] += input[2 * i + 1] * g * right;
                }
            }
            (1, _) => {
                for (o, s) in out.iter_mut().take(frames).zip(input.iter()) {
                    *o += s * self.gain.next_sample();
                }
                self.pan.skip_to_target();
            }
            _ => {
                for (i, o) in out.iter_mut().take(frames).enumerate() {
                    let s = 0.5 * (input[2 * i] + input[2 * i + 1]);
                    *o += s * self.gain.next_sample();
                }
                self.pan.skip_to_target();
            }
        }
    }
}

/// An independently processed audio source with gain, pan, mute and solo.
pub struct Track {
    id: TrackId,
    name: String,
    color: u32,
    system: bool,
    params: Arc<TrackParams>,
    dsp: TrackDsp,
    /// Private output for parallel rendering.
    output: Vec<f32>,
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("system", &self.system)
            .field("has_source", &self.dsp.source.is_some())
            .finish()
    }
}

impl Track {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TrackId(0),
            name: name.into(),
            color: 0,
            system: false,
            params: Arc::new(TrackParams::default()),
            dsp: TrackDsp {
                source: None,
                gain: SmoothedValue::new(1.0, DEFAULT_SMOOTHING_SECS, 48_000.0),
                pan: SmoothedValue::new(0.0, DEFAULT_SMOOTHING_SECS, 48_000.0),
                scratch: Vec::new(),
            },
            output: Vec::new(),
        }
    }

    /// Preview, metronome and test-tone tracks: excluded from solo logic and
    /// audible while the transport is stopped.
    pub fn system(mut self) -> Self {
        self.system = true;
        self
    }

    pub fn with_source(mut self, source: impl AudioSource + 'static) -> Self {
        self.dsp.source = Some(Box::new(source));
        self
    }

    pub fn with_boxed_source(mut self, source: Box<dyn AudioSource>) -> Self {
        self.dsp.source = Some(source);
        self
    }

    pub fn with_color(mut self, color: u32) -> Self {
        self.color = color;
        self
    }

    pub fn with_gain(self, gain: f32) -> Self {
        self.params.set_gain(gain);
        self
    }

    pub fn with_pan(self, pan: f32) -> Self {
        self.params.set_pan(pan);
        self
    }

    pub(crate) fn assign_id(&mut self, id: TrackId) {
        self.id = id;
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn color(&self) -> u32 {
        self.color
    }

    pub fn set_color(&mut self, color: u32) {
        self.color = color;
    }

    pub fn is_system(&self) -> bool {
        self.system
    }

    /// Shared parameter block; clone it to control the track from the UI.
    pub fn params(&self) -> &Arc<TrackParams> {
        &self.params
    }

    pub fn has_source(&self) -> bool {
        self.dsp.source.is_some()
    }

    /// Swap the source. Structural: call with the stream stopped or under the
    /// engine lock.
    pub fn set_source(&mut self, source: Option<Box<dyn AudioSource>>) -> Option<Box<dyn AudioSource>> {
        std::mem::replace(&mut self.dsp.source, source)
    }

    pub fn source_mut(&mut self) -> Option<&mut (dyn AudioSource + 'static)> {
        self.dsp.source.as_deref_mut()
    }

    pub fn set_latency_compensation(&self, input_ms: f32, output_ms: f32) {
        self.params.set_latency_compensation(input_ms, output_ms);
    }

    pub fn latency_compensation_ms(&self) -> f32 {
        self.params.latency_compensation_ms()
    }

    /// Size buffers and smoothing for a stream. Off the audio thread.
    pub fn prepare(&mut self, sample_rate: u32, out_channels: usize, max_frames: usize) {
        let rate = sample_rate as f32;
        self.dsp.gain.set_settle_time(DEFAULT_SMOOTHING_SECS, rate);
        self.dsp.pan.set_settle_time(DEFAULT_SMOOTHING_SECS, rate);
        self.dsp.gain.snap_to(self.params.gain());
        self.dsp.pan.snap_to(self.params.pan());

        // Stereo-sized so a source swapped in later still fits
        self.dsp.scratch.clear();
        self.dsp.scratch.resize(max_frames * 2, 0.0);
        self.output.clear();
        self.output.resize(max_frames * out_channels, 0.0);

        if let Some(source) = self.dsp.source.as_mut() {
            source.prepare(sample_rate, max_frames);
        }
    }

    /// Render `frames` frames and sum them into `out`.
    #[inline]
    pub fn process(
        &mut self,
        out: &mut [f32],
        out_channels: usize,
        frames: usize,
        stream_time: f64,
        sample_rate: u32,
    ) {
        self.dsp.render(
            &self.params,
            self.system,
            out,
            out_channels,
            frames,
            stream_time,
            sample_rate,
        );
    }

    /// Render into the track's private buffer (parallel mode).
    pub(crate) fn process_isolated(
        &mut self,
        out_channels: usize,
        frames: usize,
        stream_time: f64,
        sample_rate: u32,
    ) {
        let len = (frames * out_channels).min(self.output.len());
        let out = &mut self.output[..len];
        out.fill(0.0);
        self.dsp.render(
            &self.params,
            self.system,
            out,
            out_channels,
            frames,
            stream_time,
            sample_rate,
        );
    }

    pub(crate) fn isolated_output(&self, len: usize) -> &[f32] {
        &self.output[..len.min(self.output.len())]
    }

    pub fn seek(&mut self, sample_pos: u64) {
        if let Some(source) = self.dsp.source.as_mut() {
            source.seek(sample_pos);
        }
    }

    /// Current smoothed gain, as the audio thread last applied it.
    pub fn smoothed_gain(&self) -> f32 {
        self.dsp.gain.current()
    }
}

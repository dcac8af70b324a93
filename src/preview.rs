//! Preview slots played through a dedicated system track.
//!
//! Sources are registered into a fixed table off the audio thread.
//! `StartPreview` moves the chosen source into the preview track and
//! `StopPreview` moves it back, so the audio thread never allocates or drops.

use rondo_mixer::{AudioSource, Track};

pub const DEFAULT_PREVIEW_SLOTS: usize = 16;

pub(crate) struct PreviewSlots {
    slots: Vec<Option<Box<dyn AudioSource>>>,
    track: Track,
    active: Option<usize>,
    sample_rate: u32,
    max_frames: usize,
}

impl PreviewSlots {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            track: Track::new("Preview").system(),
            active: None,
            sample_rate: 0,
            max_frames: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub fn active(&self) -> Option<usize> {
        self.active
    }

    #[cfg(test)]
    pub fn track(&self) -> &Track {
        &self.track
    }

    /// Not real-time safe.
    pub fn prepare(&mut self, sample_rate: u32, channels: usize, max_frames: usize) {
        self.sample_rate = sample_rate;
        self.max_frames = max_frames;
        self.track.prepare(sample_rate, channels, max_frames);
        for source in self.slots.iter_mut().flatten() {
            source.prepare(sample_rate, max_frames);
        }
    }

    /// Install `source` in `slot`, returning the previous occupant. If the slot
    /// is playing, the new source takes over immediately. Not real-time safe.
    pub fn register(
        &mut self,
        slot: usize,
        mut source: Option<Box<dyn AudioSource>>,
    ) -> Option<Option<Box<dyn AudioSource>>> {
        if slot >= self.slots.len() {
            return None;
        }
        if self.sample_rate > 0 {
            if let Some(source) = source.as_mut() {
                source.prepare(self.sample_rate, self.max_frames);
            }
        }
        if self.active == Some(slot) {
            if source.is_none() {
                self.active = None;
            }
            return Some(self.track.set_source(source));
        }
        Some(std::mem::replace(&mut self.slots[slot], source))
    }

    /// Start the source in `slot` from the beginning. Real-time safe.
    pub fn start(&mut self, slot: usize) -> bool {
        if slot >= self.slots.len() {
            return false;
        }
        self.stop();
        let Some(mut source) = self.slots[slot].take() else {
            return false;
        };
        source.seek(0);
        self.track.set_source(Some(source));
        self.active = Some(slot);
        true
    }

    /// Return the playing source to its slot. Real-time safe.
    pub fn stop(&mut self) {
        if let Some(slot) = self.active.take() {
            self.slots[slot] = self.track.set_source(None);
        }
    }

    /// Sum the preview into `out`. Real-time safe.
    #[inline]
    pub fn render(
        &mut self,
        out: &mut [f32],
        channels: usize,
        frames: usize,
        stream_time: f64,
        sample_rate: u32,
    ) {
        if self.active.is_some() {
            self.track
                .process(out, channels, frames, stream_time, sample_rate);
        }
    }
}

//! Post-master output tap for meters and visualizers.

/// Receives the master output once per period, on the audio thread.
///
/// `left` and `right` point into engine-owned scratch and are only valid for
/// the call. Copy what you need (for example into a ring buffer drained by the
/// UI) and return promptly: no blocking, no allocation.
pub trait OutputTap: Send {
    fn process(&mut self, left: &[f32], right: &[f32], frames: usize, sample_rate: u32);
}

impl<F> OutputTap for F
where
    F: FnMut(&[f32], &[f32], usize, u32) + Send,
{
    fn process(&mut self, left: &[f32], right: &[f32], frames: usize, sample_rate: u32) {
        self(left, right, frames, sample_rate)
    }
}

/// Installed tap plus its de-interleave scratch.
pub(crate) struct TapSlot {
    tap: Option<Box<dyn OutputTap>>,
    left: Vec<f32>,
    right: Vec<f32>,
}

impl TapSlot {
    pub fn new() -> Self {
        Self {
            tap: None,
            left: Vec::new(),
            right: Vec::new(),
        }
    }

    pub fn prepare(&mut self, max_frames: usize) {
        self.left.clear();
        self.left.resize(max_frames, 0.0);
        self.right.clear();
        self.right.resize(max_frames, 0.0);
    }

    pub fn replace(&mut self, tap: Option<Box<dyn OutputTap>>) -> Option<Box<dyn OutputTap>> {
        std::mem::replace(&mut self.tap, tap)
    }

    pub fn is_installed(&self) -> bool {
        self.tap.is_some()
    }

    /// Split `buffer` into left/right and hand it to the tap. Mono feeds both sides.
    #[inline]
    pub fn feed(&mut self, buffer: &[f32], frames: usize, channels: usize, sample_rate: u32) {
        let Some(tap) = self.tap.as_mut() else {
            return;
        };
        let frames = frames.min(self.left.len());
        let channels = channels.max(1);
        for (i, frame) in buffer.chunks_exact(channels).take(frames).enumerate() {
            self.left[i] = frame[0];
            self.right[i] = if channels > 1 { frame[1] } else { frame[0] };
        }
        tap.process(&self.left[..frames], &self.right[..frames], frames, sample_rate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_deinterleaves_stereo() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut slot = TapSlot::new();
        slot.prepare(4);
        slot.replace(Some(Box::new(move |l: &[f32], r: &[f32], n: usize, sr: u32| {
            assert_eq!(sr, 48_000);
            sink.lock().push((l[..n].to_vec(), r[..n].to_vec()));
        })));

        slot.feed(&[1.0, -1.0, 2.0, -2.0], 2, 2, 48_000);
        let seen = seen.lock();
        assert_eq!(seen[0], (vec![1.0, 2.0], vec![-1.0, -2.0]));
    }

    #[test]
    fn test_mono_feeds_both_sides() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut slot = TapSlot::new();
        slot.prepare(8);
        slot.replace(Some(Box::new(move |l: &[f32], r: &[f32], _: usize, _: u32| {
            assert_eq!(l, r);
            counter.fetch_add(1, Ordering::Relaxed);
        })));
        slot.feed(&[0.5; 8], 8, 1, 44_100);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_frames_clamped_to_scratch() {
        let mut slot = TapSlot::new();
        slot.prepare(2);
        slot.replace(Some(Box::new(|l: &[f32], _: &[f32], n: usize, _: u32| {
            assert_eq!(n, 2);
            assert_eq!(l.len(), 2);
        })));
        slot.feed(&[0.0; 16], 8, 2, 48_000);
    }
}

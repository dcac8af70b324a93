//! The audio callback capability handed to backends.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Returned from every render call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallbackControl {
    #[default]
    Continue,
    /// Stop the stream after this buffer.
    Stop,
}

impl CallbackControl {
    /// Non-zero stops the stream.
    pub fn from_code(code: i32) -> Self {
        if code == 0 {
            Self::Continue
        } else {
            Self::Stop
        }
    }
}

/// Negotiated stream format, passed to [`AudioCallback::prepare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    /// Largest frame count a single render call will ask for.
    pub buffer_frames: u32,
    pub output_channels: u16,
    pub input_channels: u16,
}

impl StreamFormat {
    pub fn output_samples(&self) -> usize {
        self.buffer_frames as usize * self.output_channels as usize
    }

    pub fn input_samples(&self) -> usize {
        self.buffer_frames as usize * self.input_channels as usize
    }
}

/// Real-time render callback.
///
/// `render` runs on the audio thread: no allocation, no blocking locks, no I/O.
/// Buffers are interleaved f32. `input` is `None` for output-only streams.
pub trait AudioCallback: Send {
    /// Called off the audio thread after the format is negotiated and before
    /// the first `render`. Allocate scratch space here.
    fn prepare(&mut self, _format: &StreamFormat) {}

    fn render(
        &mut self,
        output: &mut [f32],
        input: Option<&[f32]>,
        frames: u32,
        stream_time: f64,
    ) -> CallbackControl;
}

impl<F> AudioCallback for F
where
    F: FnMut(&mut [f32], Option<&[f32]>, u32, f64) -> CallbackControl + Send,
{
    fn render(
        &mut self,
        output: &mut [f32],
        input: Option<&[f32]>,
        frames: u32,
        stream_time: f64,
    ) -> CallbackControl {
        self(output, input, frames, stream_time)
    }
}

/// Type-erased callback storage shared between its owner and a backend.
///
/// The audio thread only ever calls [`try_render`](Self::try_render), so an
/// owner holding the lock for a structural edit makes the thread output
/// silence instead of waiting.
#[derive(Clone)]
pub struct SharedCallback {
    inner: Arc<Mutex<dyn AudioCallback>>,
}

impl SharedCallback {
    pub fn new<C: AudioCallback + 'static>(callback: C) -> Self {
        Self {
            inner: Arc::new(Mutex::new(callback)),
        }
    }

    /// Wrap a closure; spelled out so the closure signature is inferred.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnMut(&mut [f32], Option<&[f32]>, u32, f64) -> CallbackControl + Send + 'static,
    {
        Self::new(f)
    }

    /// Share existing storage; the caller keeps typed access through its own `Arc`.
    pub fn from_arc<C: AudioCallback + 'static>(callback: Arc<Mutex<C>>) -> Self {
        Self { inner: callback }
    }

    /// Blocking. Never call from the audio thread.
    pub fn prepare(&self, format: &StreamFormat) {
        self.inner.lock().prepare(format);
    }

    /// `None` when the callback is locked elsewhere.
    #[inline]
    pub fn try_render(
        &self,
        output: &mut [f32],
        input: Option<&[f32]>,
        frames: u32,
        stream_time: f64,
    ) -> Option<CallbackControl> {
        let mut callback = self.inner.try_lock()?;
        Some(callback.render(output, input, frames, stream_time))
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SharedCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCallback")
            .field("strong", &Arc::strong_count(&self.inner))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        renders: u32,
        prepared: Option<StreamFormat>,
    }

    impl AudioCallback for Counter {
        fn prepare(&mut self, format: &StreamFormat) {
            self.prepared = Some(*format);
        }

        fn render(
            &mut self,
            output: &mut [f32],
            _input: Option<&[f32]>,
            _frames: u32,
            _stream_time: f64,
        ) -> CallbackControl {
            self.renders += 1;
            output.fill(0.5);
            CallbackControl::Continue
        }
    }

    #[test]
    fn test_closure_callback() {
        let cb = SharedCallback::from_fn(|out, _input, frames, _time| {
            assert_eq!(out.len(), frames as usize * 2);
            out.fill(1.0);
            CallbackControl::Stop
        });

        let mut buf = [0.0f32; 8];
        assert_eq!(cb.try_render(&mut buf, None, 4, 0.0), Some(CallbackControl::Stop));
        assert_eq!(buf, [1.0; 8]);
    }

    #[test]
    fn test_from_arc_keeps_typed_access() {
        let state = Arc::new(Mutex::new(Counter {
            renders: 0,
            prepared: None,
        }));
        let cb = SharedCallback::from_arc(Arc::clone(&state));

        let format = StreamFormat {
            sample_rate: 48_000,
            buffer_frames: 64,
            output_channels: 2,
            input_channels: 0,
        };
        cb.prepare(&format);

        let mut buf = vec![0.0f32; format.output_samples()];
        cb.try_render(&mut buf, None, 64, 0.0);
        cb.try_render(&mut buf, None, 64, 0.0);

        let guard = state.lock();
        assert_eq!(guard.renders, 2);
        assert_eq!(guard.prepared, Some(format));
    }

    #[test]
    fn test_try_render_skips_when_locked() {
        let state = Arc::new(Mutex::new(Counter {
            renders: 0,
            prepared: None,
        }));
        let cb = SharedCallback::from_arc(Arc::clone(&state));

        let guard = state.lock();
        let mut buf = [0.0f32; 4];
        assert!(cb.try_render(&mut buf, None, 2, 0.0).is_none());
        assert_eq!(guard.renders, 0);
    }

    #[test]
    fn test_control_from_code() {
        assert_eq!(CallbackControl::from_code(0), CallbackControl::Continue);
        assert_eq!(CallbackControl::from_code(-1), CallbackControl::Stop);
    }
}

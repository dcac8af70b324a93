//! The event-driven audio thread.
//!
//! Everything the loop touches is moved in at spawn time and handed back when
//! it exits, so the render client is never shared with a control thread while
//! audio is running.

use crate::convert::{encode, SampleFormat};
use crate::deferred::DeferredError;
use crate::endpoint::{CaptureClient, RenderClient};
use crate::event::{ReadyEvent, WaitOutcome};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use rondo_core::{CallbackControl, SharedCallback, StatisticsRecorder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thread_priority::ThreadPriority;

/// Bound on a single wait for the audio-ready event.
pub const EVENT_WAIT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Bound on joining the audio thread in `stop_stream`.
pub const JOIN_TIMEOUT: Duration = Duration::from_millis(2000);

/// State owned by the audio thread for one running session.
pub(crate) struct RenderContext {
    pub render: Box<dyn RenderClient>,
    pub capture: Option<Box<dyn CaptureClient>>,
    pub event: Arc<dyn ReadyEvent>,
    pub callback: SharedCallback,
    pub stats: Arc<StatisticsRecorder>,
    pub deferred: Arc<DeferredError>,
    pub should_stop: Arc<AtomicBool>,
    /// Cleared by the thread when its loop ends for any reason.
    pub active: Arc<AtomicBool>,
    pub sample_rate: u32,
    pub sample_format: SampleFormat,
    pub output_channels: usize,
    pub input_channels: usize,
    pub buffer_frames: u32,
    pub scratch: Vec<f32>,
    pub input_scratch: Vec<f32>,
    pub wait_timeout: Duration,
}

pub(crate) struct AudioThread {
    handle: JoinHandle<RenderContext>,
    exited: Receiver<()>,
}

impl AudioThread {
    pub(crate) fn spawn(name: &str, ctx: RenderContext) -> std::io::Result<Self> {
        let (exit_tx, exited) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || run(ctx, exit_tx))?;
        Ok(Self { handle, exited })
    }

    /// Join with a timeout. `None` means the thread was detached.
    pub(crate) fn join(self, timeout: Duration) -> Option<RenderContext> {
        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => self.handle.join().ok(),
            Err(RecvTimeoutError::Timeout) => {
                tracing::error!(
                    "audio thread did not exit within {} ms, detaching",
                    timeout.as_millis()
                );
                None
            }
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

fn run(mut ctx: RenderContext, exit_tx: Sender<()>) -> RenderContext {
    if let Err(err) = thread_priority::set_current_thread_priority(ThreadPriority::Max) {
        tracing::debug!("audio thread priority not raised: {err:?}");
    }
    tracing::debug!(
        rate = ctx.sample_rate,
        frames = ctx.buffer_frames,
        "audio thread started"
    );

    render_loop(&mut ctx);

    ctx.active.store(false, Ordering::Release);
    tracing::debug!("audio thread exiting");
    drop(exit_tx);
    ctx
}

fn render_loop(ctx: &mut RenderContext) {
    let mut frames_rendered: u64 = 0;
    let rate = ctx.sample_rate as f64;

    loop {
        if ctx.should_stop.load(Ordering::Acquire) {
            break;
        }

        match ctx.event.wait(ctx.wait_timeout) {
            WaitOutcome::Signaled => {}
            WaitOutcome::TimedOut => {
                if ctx.should_stop.load(Ordering::Acquire) {
                    break;
                }
                ctx.stats.record_underrun();
                continue;
            }
            WaitOutcome::Closed => break,
        }

        if ctx.should_stop.load(Ordering::Acquire) {
            break;
        }

        let started = Instant::now();

        let frames = match ctx.render.available_frames() {
            Ok(frames) => frames.min(ctx.buffer_frames),
            Err(err) => {
                ctx.deferred.report(err.kind, err.code);
                break;
            }
        };
        if frames == 0 {
            continue;
        }

        let out_len = frames as usize * ctx.output_channels;
        let in_len = frames as usize * ctx.input_channels;

        let input = match ctx.capture.as_mut() {
            Some(capture) => {
                let dest = &mut ctx.input_scratch[..in_len];
                if let Err(err) = capture.read(dest, frames) {
                    ctx.deferred.report(err.kind, err.code);
                    break;
                }
                Some(&ctx.input_scratch[..in_len])
            }
            None => None,
        };

        let output = &mut ctx.scratch[..out_len];
        output.fill(0.0);

        let stream_time = frames_rendered as f64 / rate;
        // A locked callback is mid-edit; play silence this period.
        let control = ctx
            .callback
            .try_render(output, input, frames, stream_time)
            .unwrap_or(CallbackControl::Continue);

        match ctx.render.get_buffer(frames) {
            Ok(native) => {
                encode(output, native, ctx.sample_format);
            }
            Err(err) => {
                ctx.deferred.report(err.kind, err.code);
                break;
            }
        }
        if let Err(err) = ctx.render.release_buffer(frames, false) {
            ctx.deferred.report(err.kind, err.code);
            break;
        }

        frames_rendered += frames as u64;
        ctx.stats
            .record_callback(started.elapsed(), frames, ctx.sample_rate);

        if control == CallbackControl::Stop {
            break;
        }
    }
}

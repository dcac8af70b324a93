//! Worker pool for parallel track rendering.

use crate::track::Track;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use thread_priority::ThreadPriority;

/// Dedicated rayon pool whose workers run at the audio thread's priority.
/// Separate from rayon's global pool.
pub struct RenderPool {
    pool: ThreadPool,
}

impl RenderPool {
    /// `threads == 0` picks one worker per available core, minus one for the
    /// audio thread.
    pub fn new(threads: usize) -> Result<Self, ThreadPoolBuildError> {
        let threads = if threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1).max(1))
                .unwrap_or(2)
        } else {
            threads
        };

        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("rondo-mix-{i}"))
            .start_handler(|_| {
                if let Err(err) = thread_priority::set_current_thread_priority(ThreadPriority::Max)
                {
                    tracing::debug!("mix worker priority not raised: {err:?}");
                }
            })
            .build()?;

        tracing::debug!(threads, "render pool started");
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Render every track into its private buffer. Returns once all are done.
    pub fn render(
        &self,
        tracks: &mut [Track],
        playing: bool,
        out_channels: usize,
        frames: usize,
        stream_time: f64,
        sample_rate: u32,
    ) {
        self.pool.install(|| {
            tracks
                .par_iter_mut()
                .filter(|track| playing || track.is_system())
                .for_each(|track| {
                    track.process_isolated(out_channels, frames, stream_time, sample_rate)
                });
        });
    }
}

//! Housekeeping thread: deferred-error polling and auto buffer scaling.

use crate::engine::TrackRegistry;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rondo_driver::DeviceManager;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_millis(100);

/// Runs off the audio path at ordinary priority.
///
/// Each tick locks the device manager, surfaces any deferred error from the
/// active backend (which fires the stream-error callback) and lets the manager
/// raise the buffer size if underruns crossed the threshold.
pub(crate) struct Watchdog {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn(
        manager: Arc<Mutex<DeviceManager>>,
        tracks: TrackRegistry,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("rondo-watchdog".to_string())
            .spawn(move || {
                debug!(?interval, "watchdog started");
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => tick(&manager, &tracks),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("watchdog stopped");
            })?;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        // Dropping the sender wakes the thread
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("watchdog thread panicked");
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn tick(manager: &Mutex<DeviceManager>, tracks: &TrackRegistry) {
    let mut manager = manager.lock();

    if let Some((kind, message)) = manager.poll_errors() {
        error!(%kind, state = ?manager.state(), "stream error: {message}");
    }

    match manager.check_and_auto_scale_buffer() {
        Ok(true) => {
            info!(
                frames = manager.stream_buffer_size(),
                "buffer size raised after underruns"
            );
            let (input_ms, output_ms) = manager.latency_compensation();
            for track in tracks.lock().iter() {
                track
                    .params
                    .set_latency_compensation(input_ms as f32, output_ms as f32);
            }
        }
        Ok(false) => {}
        Err(err) => warn!("auto buffer scaling failed: {err}"),
    }
}

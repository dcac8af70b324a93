//! Audio-ready events.
//!
//! The audio thread sleeps on a [`ReadyEvent`] between periods. Endpoints signal
//! it when the device wants data; `stop_stream` signals it to wake the thread
//! immediately.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
    /// The event source is gone; the thread should exit.
    Closed,
}

/// An auto-reset wake-up event.
pub trait ReadyEvent: Send + Sync {
    fn wait(&self, timeout: Duration) -> WaitOutcome;

    fn signal(&self);

    /// OS handle for endpoints that register the event with the driver.
    fn raw_handle(&self) -> Option<isize> {
        None
    }
}

/// In-process auto-reset event.
///
/// A bounded(1) channel: signals coalesce while nobody waits, and a wait
/// consumes the pending signal.
#[derive(Debug, Clone)]
pub struct AudioEvent {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl AudioEvent {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    /// Drop a pending signal without waiting.
    pub fn reset(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

impl Default for AudioEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyEvent for AudioEvent {
    #[inline]
    fn wait(&self, timeout: Duration) -> WaitOutcome {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => WaitOutcome::Signaled,
            Err(RecvTimeoutError::Timeout) => WaitOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => WaitOutcome::Closed,
        }
    }

    #[inline]
    fn signal(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) | Err(TrySendError::Disconnected(())) => {}
        }
    }
}

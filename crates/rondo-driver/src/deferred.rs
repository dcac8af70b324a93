//! Deferred error slot.
//!
//! The audio thread stores a fatal `(kind, native code)` pair with plain atomic
//! writes and raises a flag. A control thread takes it later and does the
//! formatting, logging and listener dispatch there.

use rondo_core::DriverErrorKind;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

#[derive(Debug, Default)]
pub struct DeferredError {
    pending: AtomicBool,
    kind: AtomicU32,
    native_code: AtomicI64,
}

impl DeferredError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait-free; safe on the audio thread.
    #[inline]
    pub fn report(&self, kind: DriverErrorKind, native_code: i64) {
        self.kind.store(kind.code(), Ordering::Relaxed);
        self.native_code.store(native_code, Ordering::Relaxed);
        self.pending.store(true, Ordering::Release);
    }

    /// Returns the pending error once; later calls see `None` until the next report.
    pub fn take(&self) -> Option<(DriverErrorKind, i64)> {
        if self
            .pending
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        let kind = DriverErrorKind::from_code(self.kind.load(Ordering::Relaxed));
        let code = self.native_code.load(Ordering::Relaxed);
        Some((kind, code))
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.pending.store(false, Ordering::Release);
    }
}

/// User-facing message for a deferred error.
pub fn format_message(kind: DriverErrorKind, native_code: i64) -> String {
    if native_code == 0 {
        format!("{} (reported by audio thread)", kind.description())
    } else {
        format!(
            "{} (native error 0x{:08X})",
            kind.description(),
            native_code as u32
        )
    }
}

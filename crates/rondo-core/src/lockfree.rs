//! Lock-free primitives shared between control threads and the audio thread.
//!
//! Writers publish with `Release`, readers observe with `Acquire`. Every type is
//! padded to a cache line so two parameters written by different threads never
//! share one.

use atomic_float::{AtomicF32, AtomicF64};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Cache-line aligned atomic f32 (gain, pan, meter levels).
#[derive(Debug)]
#[repr(align(64))]
pub struct AtomicFloat {
    value: AtomicF32,
}

impl AtomicFloat {
    pub fn new(value: f32) -> Self {
        Self {
            value: AtomicF32::new(value),
        }
    }

    #[inline]
    pub fn get(&self) -> f32 {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: f32) {
        self.value.store(value, Ordering::Release);
    }

    #[inline]
    pub fn swap(&self, value: f32) -> f32 {
        self.value.swap(value, Ordering::AcqRel)
    }
}

impl Clone for AtomicFloat {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

impl Default for AtomicFloat {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Cache-line aligned atomic bool (mute, solo, stop requests).
#[derive(Debug)]
#[repr(align(64))]
pub struct AtomicFlag {
    value: AtomicBool,
}

impl AtomicFlag {
    pub fn new(value: bool) -> Self {
        Self {
            value: AtomicBool::new(value),
        }
    }

    #[inline]
    pub fn get(&self) -> bool {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: bool) {
        self.value.store(value, Ordering::Release);
    }

    /// Returns the previous value.
    #[inline]
    pub fn swap(&self, value: bool) -> bool {
        self.value.swap(value, Ordering::AcqRel)
    }
}

impl Clone for AtomicFlag {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

impl Default for AtomicFlag {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Cache-line aligned atomic f64 (timings, latencies, positions in seconds).
#[derive(Debug)]
#[repr(align(64))]
pub struct AtomicDouble {
    value: AtomicF64,
}

impl AtomicDouble {
    pub fn new(value: f64) -> Self {
        Self {
            value: AtomicF64::new(value),
        }
    }

    #[inline]
    pub fn get(&self) -> f64 {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: f64) {
        self.value.store(value, Ordering::Release);
    }

    /// Store `value` if it is larger than the current one.
    #[inline]
    pub fn raise(&self, value: f64) {
        let mut current = self.value.load(Ordering::Relaxed);
        while value > current {
            match self.value.compare_exchange_weak(
                current,
                value,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

impl Clone for AtomicDouble {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

impl Default for AtomicDouble {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Monotonic event counter. Only `reset` moves it backwards.
#[derive(Debug, Default)]
#[repr(align(64))]
pub struct AtomicCounter {
    value: AtomicU64,
}

impl AtomicCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value before the increment.
    #[inline]
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel)
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_atomic_float() {
        let val = AtomicFloat::new(1.0);
        assert_eq!(val.get(), 1.0);
        val.set(0.25);
        assert_eq!(val.swap(2.0), 0.25);
        assert_eq!(val.get(), 2.0);
    }

    #[test]
    fn test_atomic_flag_swap_returns_previous() {
        let flag = AtomicFlag::new(false);
        assert!(!flag.swap(true));
        assert!(flag.swap(false));
        assert!(!flag.get());
    }

    #[test]
    fn test_atomic_double_raise_keeps_maximum() {
        let peak = AtomicDouble::new(10.0);
        peak.raise(5.0);
        assert_eq!(peak.get(), 10.0);
        peak.raise(12.5);
        assert_eq!(peak.get(), 12.5);
    }

    #[test]
    fn test_atomic_double_raise_concurrent() {
        let peak = Arc::new(AtomicDouble::new(0.0));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let peak = Arc::clone(&peak);
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        peak.raise((t * 1000 + i) as f64);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(peak.get(), 3999.0);
    }

    #[test]
    fn test_counter_is_monotonic_until_reset() {
        let counter = AtomicCounter::new();
        assert_eq!(counter.increment(), 0);
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.get(), 2);
        counter.reset();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_alignment() {
        assert_eq!(std::mem::align_of::<AtomicFloat>(), 64);
        assert_eq!(std::mem::align_of::<AtomicCounter>(), 64);
    }
}

//! Driver statistics, recorded from the audio thread.

use crate::latency::buffer_period_us;
use crate::lockfree::{AtomicCounter, AtomicDouble};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smoothing factor for the callback-time moving average.
pub const STATS_EMA_ALPHA: f64 = 0.1;

/// Statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DriverStatistics {
    pub callback_count: u64,
    pub underrun_count: u64,
    /// Callbacks that ran past the buffer deadline.
    pub overrun_count: u64,
    pub actual_latency_ms: f64,
    pub cpu_load_percent: f64,
    pub average_cpu_load_percent: f64,
    pub max_cpu_load_percent: f64,
    pub average_callback_time_us: f64,
    pub max_callback_time_us: f64,
}

/// Lock-free statistics sink.
///
/// Single writer (the audio thread), any number of readers. Counters only
/// move forward until [`reset`](Self::reset).
#[derive(Debug, Default)]
pub struct StatisticsRecorder {
    callbacks: AtomicCounter,
    underruns: AtomicCounter,
    overruns: AtomicCounter,
    latency_ms: AtomicDouble,
    cpu_load: AtomicDouble,
    average_cpu_load: AtomicDouble,
    max_cpu_load: AtomicDouble,
    average_callback_us: AtomicDouble,
    max_callback_us: AtomicDouble,
}

impl StatisticsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed callback. Wait-free.
    #[inline]
    pub fn record_callback(&self, elapsed: Duration, frames: u32, sample_rate: u32) {
        let callback_us = elapsed.as_secs_f64() * 1_000_000.0;
        let budget_us = buffer_period_us(frames, sample_rate);
        let load = if budget_us > 0.0 {
            callback_us / budget_us * 100.0
        } else {
            0.0
        };

        let previous = self.callbacks.increment();
        if previous == 0 {
            self.average_callback_us.set(callback_us);
            self.average_cpu_load.set(load);
        } else {
            let avg = self.average_callback_us.get();
            self.average_callback_us
                .set(avg + STATS_EMA_ALPHA * (callback_us - avg));
            let avg = self.average_cpu_load.get();
            self.average_cpu_load.set(avg + STATS_EMA_ALPHA * (load - avg));
        }

        self.cpu_load.set(load);
        self.max_cpu_load.raise(load);
        self.max_callback_us.raise(callback_us);

        if callback_us > budget_us {
            self.overruns.increment();
        }
    }

    #[inline]
    pub fn record_underrun(&self) {
        self.underruns.increment();
    }

    #[inline]
    pub fn record_overrun(&self) {
        self.overruns.increment();
    }

    pub fn set_latency_ms(&self, latency_ms: f64) {
        self.latency_ms.set(latency_ms);
    }

    pub fn callback_count(&self) -> u64 {
        self.callbacks.get()
    }

    pub fn underrun_count(&self) -> u64 {
        self.underruns.get()
    }

    pub fn snapshot(&self) -> DriverStatistics {
        DriverStatistics {
            callback_count: self.callbacks.get(),
            underrun_count: self.underruns.get(),
            overrun_count: self.overruns.get(),
            actual_latency_ms: self.latency_ms.get(),
            cpu_load_percent: self.cpu_load.get(),
            average_cpu_load_percent: self.average_cpu_load.get(),
            max_cpu_load_percent: self.max_cpu_load.get(),
            average_callback_time_us: self.average_callback_us.get(),
            max_callback_time_us: self.max_callback_us.get(),
        }
    }

    /// Clear counters and averages. The latency figure is kept.
    pub fn reset(&self) {
        self.callbacks.reset();
        self.underruns.reset();
        self.overruns.reset();
        self.cpu_load.set(0.0);
        self.average_cpu_load.set(0.0);
        self.max_cpu_load.set(0.0);
        self.average_callback_us.set(0.0);
        self.max_callback_us.set(0.0);
    }
}

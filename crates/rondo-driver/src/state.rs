//! Backend lifecycle state.

use std::sync::atomic::{AtomicU8, Ordering};

/// `Uninitialized → Initialized → StreamOpen ⇄ StreamRunning`, with `Error`
/// reachable from anywhere and `shutdown` always returning to `Uninitialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum DriverState {
    #[default]
    Uninitialized = 0,
    Initialized = 1,
    StreamOpen = 2,
    StreamRunning = 3,
    Error = 4,
}

impl DriverState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Initialized,
            2 => Self::StreamOpen,
            3 => Self::StreamRunning,
            _ => Self::Error,
        }
    }

    /// Native handles exist.
    pub fn has_stream(self) -> bool {
        matches!(self, Self::StreamOpen | Self::StreamRunning)
    }
}

/// Lock-free cell so readers on any thread can observe the state.
#[derive(Debug, Default)]
pub struct AtomicDriverState(AtomicU8);

impl AtomicDriverState {
    pub fn new(state: DriverState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    #[inline]
    pub fn get(&self) -> DriverState {
        DriverState::from_u8(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, state: DriverState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cell() {
        let state = AtomicDriverState::default();
        assert_eq!(state.get(), DriverState::Uninitialized);
        state.set(DriverState::StreamRunning);
        assert_eq!(state.get(), DriverState::StreamRunning);
        assert!(state.get().has_stream());
        assert!(!DriverState::Initialized.has_stream());
    }
}

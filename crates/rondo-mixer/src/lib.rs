//! Tracks, mixer buses and track rendering for the rondo engine.
//!
//! # Primary API
//!
//! - [`Mixer`]: Track list, solo logic, sequential or parallel rendering
//! - [`Track`] / [`TrackParams`]: Per-track source, smoothing and atomic parameters
//! - [`MixerBus`]: Summing node with the constant-power pan law
//! - [`AudioSource`]: Collaborator trait that feeds a track
//!
//! # Feature-gated APIs
//!
//! - `"parallel"`: [`RenderPool`], a priority-raised rayon pool (enabled by default)

mod bus;
pub use bus::MixerBus;

mod source;
pub use source::{AudioSource, SineSource};

mod track;
pub use track::{Track, TrackId, TrackParams, MAX_GAIN, MIN_GAIN};

mod mixer;
pub use mixer::Mixer;

#[cfg(feature = "parallel")]
mod pool;
#[cfg(feature = "parallel")]
pub use pool::RenderPool;

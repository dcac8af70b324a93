//! Integration test modules for rondo
//!
//! Test categories:
//! - engine: Engine lifecycle, track edits, suspend/resume, teardown
//! - transport: Play/pause/seek, system tracks, preview slots, payload hooks
//! - metering: Meters, master stage, output tap, driver statistics
//! - drivers: Enumeration, reconfiguration and rollback, latency
//! - scenarios: End-to-end timing scenarios on the virtual device

pub mod drivers;
pub mod engine;
pub mod metering;
pub mod scenarios;
pub mod transport;

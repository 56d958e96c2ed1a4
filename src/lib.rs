//! Scripted load generation for IBM 3270 terminal applications.
//!
//! A workflow is an ordered list of steps (connect, fill fields, press
//! keys, check values, capture screens) executed against a pool of
//! terminal emulator sessions driven over their TCP script ports. The
//! engine runs workflows on a fixed worker pool under a wall-clock
//! deadline with ramped release, and publishes per-process metrics
//! snapshots for the dashboard.

pub mod config;
pub mod dashboard;
pub mod engine;
pub mod journal;
pub mod metrics;
pub mod session;
pub mod telemetry;
pub mod workflow;

//! Affiliate-fraud detection service for checkout attribution.
//!
//! The library is split into the engine (evidence capture, scoring,
//! evaluation, backfill) and the ambient service plumbing: environment
//! configuration, telemetry, and the top-level error type the binary
//! reports.

pub mod config;
pub mod engine;
pub mod error;
pub mod telemetry;

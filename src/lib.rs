//! Spotlight – control plane for live-debugging instrumentation
//!
//! This crate implements the platform side of a live-debugging system:
//! - Live instruments (conditional breakpoints, structured log points)
//!   attached to code running in production processes, without redeploying
//! - A lifecycle state machine tracking pending/applied/removed state
//!   across unreliable, asynchronously-connecting remote agents
//! - Reconstruction of structured variable data from loosely-typed
//!   capture payloads
//! - A view subscription cache fanning the internal metric/trace/log
//!   stream out to the correct subscribers
//! - An NDJSON operator service and daemon for driving all of the above

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bus;
pub mod error;
pub mod instrument;
pub mod platform;
pub mod service;
pub mod view;

// Re-export key types for convenience
pub use platform::{Platform, PlatformConfig};

/// Current version of the Spotlight platform
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version for operator-service communication
pub const PROTOCOL_VERSION: &str = "1.0.0";

//! # Utility Modules
//!
//! Supporting utilities for logging, metrics, and timing.
//!
//! ## Components
//! - **Logging**: `tracing-subscriber` setup from `LoggingConfig`
//! - **Metrics**: per-session atomic counters and snapshots
//! - **Timeout**: default durations and async timeout wrappers

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{Metrics, MetricsSnapshot};

//! Operations and observability.
//!
//! - `telemetry` - JSON tracing setup with a reloadable level
//! - `metrics` - Protocol counters and gauges

pub mod metrics;
pub mod telemetry;

pub use metrics::*;
pub use telemetry::*;

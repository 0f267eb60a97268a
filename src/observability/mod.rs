//! Observability for the reporting agent
//!
//! Structured logging setup and process-wide report outcome counters.

pub mod logging;
pub mod stats;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use stats::{stats, ReportStats, StatsSnapshot};

pub use logging::{cycle_span, lifecycle_span, mqtt_span};

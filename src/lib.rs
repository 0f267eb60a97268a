//! Device Defender reporting agent
//!
//! Collects network metrics from the device, encodes them as a compact CBOR
//! report and publishes it over MQTT on a fixed interval, then correlates the
//! service's accepted/rejected answer with the report that caused it.
//!
//! # Overview
//!
//! - [`protocol`] - topic names, report assembly, response validation
//! - [`agent`] - subscription handshake, publish/response correlation, the run loop
//! - [`transport`] - the [`transport::Transport`] seam and its rumqttc implementation
//! - [`encoding`] and [`collectors`] - the structured writer and the metrics feeding it
//! - [`store`] and [`config`] - device identity and runtime settings
//!
//! # Quick Start
//!
//! ```rust
//! use defender_agent::protocol::{build_report, DefenderTopics};
//! use defender_agent::testing::StaticCollector;
//!
//! let topics = DefenderTopics::build("thing-42").unwrap();
//! assert_eq!(topics.publish(), "$aws/things/thing-42/defender/metrics/cbor");
//!
//! let mut buf = [0u8; 1024];
//! let len = build_report(&mut buf, 1_700_000_000, &StaticCollector::sample()).unwrap();
//! assert!(len > 0 && len <= buf.len());
//! ```

pub mod agent;
pub mod collectors;
pub mod config;
pub mod encoding;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod store;
pub mod sync;
pub mod testing;
pub mod transport;

pub use agent::{AgentOutcome, AgentState, DefenderAgent};
pub use config::{AgentConfig, AgentTiming, ConfigError};
pub use error::{AgentError, AgentResult};
pub use protocol::{DefenderTopics, ReportStatus};

//! The reporting agent
//!
//! [`DefenderAgent`] owns an [`AgentContext`] for its whole run: it builds the
//! topics once, subscribes to the response topics, then repeats build,
//! publish and wait until shutdown.

pub mod context;
pub mod correlator;
pub mod lifecycle;
pub mod report_id;
pub mod subscription;

pub use context::AgentContext;
pub use correlator::{publish_and_await, ReportResponseHandler};
pub use lifecycle::{AgentOutcome, AgentState, DefenderAgent};
pub use report_id::{PersistentReportId, ReportIdSource};
pub use subscription::{subscribe_or_unsubscribe, SubscriptionError, SubscriptionOp};

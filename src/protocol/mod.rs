//! Device Defender wire protocol
//!
//! Topic names, the report document and the response documents the service
//! sends back.

pub mod report;
pub mod response;
pub mod topics;

pub use report::{build_report, REPORT_VERSION};
pub use response::{
    decode_response, validate_response, ReportResponse, ReportStatus, ResponseKind,
    StatusDetails, ValidationError,
};
pub use topics::{DefenderTopic, DefenderTopics, TopicError};

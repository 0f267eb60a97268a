//! Report response decoding and validation
//!
//! The service answers each report on the accepted or rejected topic with a
//! document carrying the report id it refers to. Responses arrive as CBOR on
//! the CBOR topics; JSON is accepted as a fallback.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Outcome of one report cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    NotReceived,
    Accepted,
    Rejected,
    Invalid,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::NotReceived => "not_received",
            ReportStatus::Accepted => "accepted",
            ReportStatus::Rejected => "rejected",
            ReportStatus::Invalid => "invalid",
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which response topic a message arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Accepted,
    Rejected,
}

impl ResponseKind {
    fn expected_status(&self) -> &'static str {
        match self {
            ResponseKind::Accepted => "ACCEPTED",
            ResponseKind::Rejected => "REJECTED",
        }
    }

    /// Status reported for a response that passed validation
    pub fn status(&self) -> ReportStatus {
        match self {
            ResponseKind::Accepted => ReportStatus::Accepted,
            ResponseKind::Rejected => ReportStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportResponse {
    #[serde(default)]
    pub thing_name: Option<String>,
    #[serde(default)]
    pub report_id: Option<u64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub status_details: Option<StatusDetails>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDetails {
    #[serde(rename = "ErrorCode", default)]
    pub error_code: Option<String>,
    #[serde(rename = "ErrorMessage", default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Response payload is empty")]
    Empty,
    #[error("Response payload is not a response document: {0}")]
    Malformed(String),
    #[error("Response carries no reportId")]
    MissingReportId,
    #[error("Response is for report {found}, expected {expected}")]
    ReportIdMismatch { expected: u64, found: u64 },
    #[error("Response is for thing '{found}', expected '{expected}'")]
    ThingNameMismatch { expected: String, found: String },
    #[error("Status '{status}' does not match the {expected} topic")]
    StatusMismatch {
        status: String,
        expected: &'static str,
    },
}

/// Decode a response document, trying CBOR before JSON
pub fn decode_response(payload: &[u8]) -> Result<ReportResponse, ValidationError> {
    if payload.is_empty() {
        return Err(ValidationError::Empty);
    }

    match serde_cbor::from_slice::<ReportResponse>(payload) {
        Ok(response) => Ok(response),
        Err(cbor_err) => serde_json::from_slice::<ReportResponse>(payload).map_err(|json_err| {
            ValidationError::Malformed(format!("cbor: {cbor_err}; json: {json_err}"))
        }),
    }
}

/// Check that `payload` answers report `expected_id` for `thing_name`
pub fn validate_response(
    payload: &[u8],
    kind: ResponseKind,
    expected_id: u64,
    thing_name: &str,
) -> Result<ReportResponse, ValidationError> {
    let response = decode_response(payload)?;

    let found = response.report_id.ok_or(ValidationError::MissingReportId)?;
    if found != expected_id {
        return Err(ValidationError::ReportIdMismatch {
            expected: expected_id,
            found,
        });
    }

    if let Some(name) = &response.thing_name {
        if name != thing_name {
            return Err(ValidationError::ThingNameMismatch {
                expected: thing_name.to_string(),
                found: name.clone(),
            });
        }
    }

    if let Some(status) = &response.status {
        if !status.eq_ignore_ascii_case(kind.expected_status()) {
            return Err(ValidationError::StatusMismatch {
                status: status.clone(),
                expected: kind.expected_status(),
            });
        }
    }

    Ok(response)
}

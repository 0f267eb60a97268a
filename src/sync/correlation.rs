//! In-flight report gate shared between the agent task and response handlers
//!
//! Only the agent task opens and closes the gate. Handlers running on the
//! transport's dispatch task read the in-flight report id and answer through
//! the outcome notification.

use super::Notification;
use crate::observability::stats;
use crate::protocol::{validate_response, ReportStatus, ResponseKind, ValidationError};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct ResponseCorrelation {
    thing_name: String,
    // Report id awaiting an answer; `None` while the gate is closed
    in_flight: Mutex<Option<u64>>,
    outcome: Notification<ReportStatus>,
}

impl ResponseCorrelation {
    pub fn new<S: Into<String>>(thing_name: S) -> Self {
        Self {
            thing_name: thing_name.into(),
            in_flight: Mutex::new(None),
            outcome: Notification::new(),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, Option<u64>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn thing_name(&self) -> &str {
        &self.thing_name
    }

    pub fn is_waiting(&self) -> bool {
        self.in_flight().is_some()
    }

    /// Report id awaiting an answer, if any
    pub fn report_id(&self) -> Option<u64> {
        *self.in_flight()
    }

    /// Open the gate for `report_id`, discarding any outcome left from an earlier cycle
    pub fn begin(&self, report_id: u64) {
        self.outcome.clear();
        *self.in_flight() = Some(report_id);
    }

    /// Close the gate; responses arriving after this are stale
    pub fn finish(&self) {
        *self.in_flight() = None;
    }

    /// Classify a response and wake the agent
    ///
    /// Returns `None` when the message is stale: no report is in flight, or
    /// the response answers a different report. Stale messages are dropped.
    pub fn resolve(&self, kind: ResponseKind, payload: &[u8]) -> Option<ReportStatus> {
        let Some(expected) = self.report_id() else {
            debug!(?kind, "Ignoring response received outside a report cycle");
            stats().stale_response();
            return None;
        };

        let status = match validate_response(payload, kind, expected, &self.thing_name) {
            Ok(response) => {
                if let (ResponseKind::Rejected, Some(details)) = (kind, &response.status_details) {
                    info!(
                        report_id = expected,
                        error_code = details.error_code.as_deref().unwrap_or(""),
                        error_message = details.error_message.as_deref().unwrap_or(""),
                        "Report rejected by service"
                    );
                }
                kind.status()
            }
            Err(ValidationError::ReportIdMismatch { found, .. }) => {
                info!(
                    report_id = expected,
                    response_report_id = found,
                    ?kind,
                    "Ignoring response for another report"
                );
                stats().stale_response();
                return None;
            }
            Err(e) => {
                warn!(report_id = expected, ?kind, error = %e, "Response failed validation");
                ReportStatus::Invalid
            }
        };

        self.outcome.notify(status);
        Some(status)
    }

    /// Wait for the handlers to classify the in-flight report
    pub async fn wait_outcome(&self, timeout: Duration) -> Option<ReportStatus> {
        self.outcome.wait(timeout).await
    }
}

//! Report outcome counters
//!
//! Process-wide atomic counters updated by the agent loop and the response
//! handlers. A snapshot is logged when the agent shuts down.

use crate::protocol::ReportStatus;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Global report statistics instance
pub static STATS: Lazy<ReportStats> = Lazy::new(ReportStats::new);

/// Get reference to global report statistics
pub fn stats() -> &'static ReportStats {
    &STATS
}

pub struct ReportStats {
    cycles: AtomicU64,
    build_failures: AtomicU64,
    publish_failures: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    invalid: AtomicU64,
    not_received: AtomicU64,
    stale_responses: AtomicU64,
    last_report_id: AtomicU64,

    mqtt_connected: AtomicBool,
    reconnects: AtomicU64,

    agent_state: Mutex<String>,
    state_transitions: AtomicU64,
    started_at: AtomicU64,
}

/// Point-in-time copy of [`ReportStats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub cycles: u64,
    pub build_failures: u64,
    pub publish_failures: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub invalid: u64,
    pub not_received: u64,
    pub stale_responses: u64,
    pub last_report_id: u64,
    pub mqtt_connected: bool,
    pub reconnects: u64,
    pub agent_state: String,
    pub state_transitions: u64,
    pub uptime_secs: u64,
}

impl Default for ReportStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportStats {
    pub fn new() -> Self {
        Self {
            cycles: AtomicU64::new(0),
            build_failures: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            invalid: AtomicU64::new(0),
            not_received: AtomicU64::new(0),
            stale_responses: AtomicU64::new(0),
            last_report_id: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            agent_state: Mutex::new("init".to_string()),
            state_transitions: AtomicU64::new(0),
            started_at: AtomicU64::new(current_timestamp()),
        }
    }

    pub fn cycle_started(&self, report_id: u64) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.last_report_id.store(report_id, Ordering::Relaxed);
    }

    pub fn build_failed(&self) {
        self.build_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, status: ReportStatus) {
        let counter = match status {
            ReportStatus::Accepted => &self.accepted,
            ReportStatus::Rejected => &self.rejected,
            ReportStatus::Invalid => &self.invalid,
            ReportStatus::NotReceived => &self.not_received,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stale_response(&self) {
        self.stale_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connected(&self) {
        self.mqtt_connected.store(true, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        if self.mqtt_connected.swap(false, Ordering::Relaxed) {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_agent_state(&self, state: &str) {
        let mut current = self
            .agent_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *current != state {
            self.state_transitions.fetch_add(1, Ordering::Relaxed);
            *current = state.to_string();
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let agent_state = self
            .agent_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string());

        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            build_failures: self.build_failures.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            not_received: self.not_received.load(Ordering::Relaxed),
            stale_responses: self.stale_responses.load(Ordering::Relaxed),
            last_report_id: self.last_report_id.load(Ordering::Relaxed),
            mqtt_connected: self.mqtt_connected.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            agent_state,
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
            uptime_secs: current_timestamp()
                .saturating_sub(self.started_at.load(Ordering::Relaxed)),
        }
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

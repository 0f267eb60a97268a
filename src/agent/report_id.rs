//! Report identifier allocation
//!
//! The service silently drops reports whose id it has already seen, so ids
//! must keep increasing across restarts. The persistent source takes the
//! larger of the stored sequence plus one and the wall clock in seconds, and
//! writes the id back before it is used.

use crate::store::{KvKey, KvStore, StoreError};
use std::sync::{Arc, Mutex};

pub trait ReportIdSource: Send + Sync {
    fn next_id(&self) -> Result<u64, StoreError>;
}

/// Seconds since the Unix epoch; zero if the clock is before it
pub fn unix_seconds() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

pub struct PersistentReportId {
    store: Arc<KvStore>,
    clock: fn() -> u64,
    // Serializes read-increment-write on the stored sequence
    guard: Mutex<()>,
}

impl PersistentReportId {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self::with_clock(store, unix_seconds)
    }

    pub fn with_clock(store: Arc<KvStore>, clock: fn() -> u64) -> Self {
        Self {
            store,
            clock,
            guard: Mutex::new(()),
        }
    }
}

impl ReportIdSource for PersistentReportId {
    fn next_id(&self) -> Result<u64, StoreError> {
        let _guard = self
            .guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let last = self.store.get_u64(KvKey::ReportSequence)?;
        let id = last.saturating_add(1).max((self.clock)());
        self.store.set_u64(KvKey::ReportSequence, id)?;
        Ok(id)
    }
}

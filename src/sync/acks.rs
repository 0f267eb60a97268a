//! Acknowledgment channel for transport commands
//!
//! Each command gets a sequence number baked into its completion callback, so
//! an acknowledgment that arrives after its waiter gave up cannot satisfy the
//! next command's wait.

use super::Notification;
use crate::transport::{CommandStatus, CompletionCallback};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
pub struct CommandAcks {
    next_seq: AtomicU64,
    slot: Notification<(u64, CommandStatus)>,
}

impl CommandAcks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a sequence number and the callback that completes it
    pub fn completion(self: &Arc<Self>) -> (u64, CompletionCallback) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.slot.clear();

        let acks = Arc::clone(self);
        let callback: CompletionCallback = Box::new(move |status| acks.slot.notify((seq, status)));
        (seq, callback)
    }

    /// Wait up to `timeout` for command `seq` to complete
    pub async fn wait(&self, seq: u64, timeout: Duration) -> Option<CommandStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.slot.wait(remaining).await {
                None => return None,
                Some((got, status)) if got == seq => return Some(status),
                Some((got, status)) => {
                    debug!(expected = seq, got, ?status, "Discarding late acknowledgment");
                }
            }
        }
    }
}

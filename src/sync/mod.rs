//! Wait primitives connecting the agent task to transport callbacks

pub mod acks;
pub mod correlation;
pub mod notification;

pub use acks::CommandAcks;
pub use correlation::ResponseCorrelation;
pub use notification::Notification;

use std::time::Duration;
use tokio::sync::watch;

/// Resolve once the exit flag is set
///
/// Never resolves if the sender is dropped without setting it.
pub async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sleep for `duration` unless shutdown is requested first
///
/// Returns true if the sleep completed, false if shutdown was requested.
pub async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown_requested(shutdown_rx) => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

//! Single-slot notification used to wake one waiting task with a result

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// Holds at most one pending value; a later `notify` overwrites an unread one
#[derive(Debug)]
pub struct Notification<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
}

impl<T: Send> Default for Notification<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Notification<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `value` and wake the waiter, if any
    pub fn notify(&self, value: T) {
        *self.lock() = Some(value);
        self.notify.notify_one();
    }

    pub fn take(&self) -> Option<T> {
        self.lock().take()
    }

    /// Drop any value left over from an earlier wait
    pub fn clear(&self) {
        self.lock().take();
    }

    /// Wait up to `timeout` for a value; `None` on timeout
    pub async fn wait(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if let Some(value) = self.take() {
                    return value;
                }
                // A permit left by a cleared value wakes us once; the slot
                // check above absorbs it.
                notified.await;
            }
        })
        .await
        .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_value_before_wait_is_returned() {
        let n = Notification::new();
        n.notify(5u8);
        assert_eq!(n.wait(Duration::from_millis(10)).await, Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let n: Notification<u8> = Notification::new();
        assert_eq!(n.wait(Duration::from_secs(30)).await, None);
    }

    #[tokio::test]
    async fn test_notify_from_other_task_wakes_waiter() {
        let n = Arc::new(Notification::new());
        let notifier = Arc::clone(&n);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            notifier.notify("done");
        });
        assert_eq!(n.wait(Duration::from_secs(5)).await, Some("done"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_value_is_not_delivered() {
        let n = Notification::new();
        n.notify(1u8);
        n.clear();
        assert_eq!(n.wait(Duration::from_secs(1)).await, None);
    }

    #[tokio::test]
    async fn test_latest_value_wins() {
        let n = Notification::new();
        n.notify(1u8);
        n.notify(2u8);
        assert_eq!(n.wait(Duration::from_millis(10)).await, Some(2));
        assert_eq!(n.take(), None);
    }
}

//! Cancellation flag shared between a run and whoever may stop it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::debug;

/// A cooperative cancellation flag.
///
/// The engines poll [`is_cancelled`](Self::is_cancelled) between scheduling
/// iterations; the step executor awaits [`cancelled`](Self::cancelled) to
/// abandon an in-flight attempt. Only the first reason is kept.
#[derive(Default)]
pub struct CancellationToken {
    flag: AtomicBool,
    reason: Mutex<Option<String>>,
    waiters: Notify,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Returns true if this call flipped the flag.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let mut slot = self.reason.lock();
        if self.flag.swap(true, Ordering::SeqCst) {
            return false;
        }
        let reason = reason.into();
        debug!(reason = %reason, "Cancellation requested");
        *slot = Some(reason);
        drop(slot);

        self.waiters.notify_waiters();
        true
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// The reason given to the first [`cancel`](Self::cancel) call.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Completes once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.waiters.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel
            // cannot slip between the check and the wait.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_first_reason_wins() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());

        assert!(token.cancel("operator request"));
        assert!(!token.cancel("sibling failed"));

        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("operator request"));
    }

    #[test]
    fn test_cancelled_future_is_pending_until_cancel() {
        let token = CancellationToken::new();
        let mut waiter = tokio_test::task::spawn(token.cancelled());
        tokio_test::assert_pending!(waiter.poll());

        token.cancel("stop");
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn test_cancel_wakes_every_waiter() {
        let token = Arc::new(CancellationToken::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let token = token.clone();
                tokio::spawn(async move { token.cancelled().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel("stop");

        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_already_cancelled_returns_immediately() {
        let token = CancellationToken::new();
        token.cancel("done");
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .unwrap();
    }
}

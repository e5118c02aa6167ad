//! Task spawning seam and cooperative cancellation.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Abstraction for spawning engine tasks on a runtime.
pub trait Spawn {
    /// Spawn a detached future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

#[derive(Debug, Default)]
struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

/// Cooperative stop flag shared between an owner and a running loop.
///
/// Loops check [`StopToken::is_stopped`] at their own safe points; timers can
/// also await [`StopToken::stopped`] to wake up early.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    inner: Arc<StopInner>,
}

impl StopToken {
    /// Fresh, unstopped token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Idempotent.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Resolves once a stop is requested.
    pub async fn stopped(&self) {
        loop {
            // Registered before the flag check so a concurrent stop() is not missed.
            let notified = self.inner.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn stop_is_shared_between_clones() {
        let token = StopToken::new();
        let clone = token.clone();
        assert!(!clone.is_stopped());
        token.stop();
        token.stop();
        assert!(clone.is_stopped());
    }

    #[tokio::test]
    async fn stopped_wakes_waiter() {
        let token = StopToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.stopped().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter woke")
            .expect("task joined");
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Cooperative cancellation token shared between a task's executor, its
/// provider calls, and sandboxed subprocesses.
///
/// Cancellation is idempotent: calling [`cancel`](CancelToken::cancel) more
/// than once is a no-op, and waiters that subscribe after cancellation
/// resolve immediately.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Safe to call from any task, any number of times.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve when the token is cancelled. Resolves immediately if the
    /// token was already cancelled before the call.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        // Re-check after registering the waiter to close the race with cancel()
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

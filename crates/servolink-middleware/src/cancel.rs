//! Cooperative cancellation shared between an owner and its worker thread.
//!
//! The same token serves both kinds of loop in the workspace: async receive
//! loops race [`CancelToken::cancelled`] against their next message, and
//! plain scheduling threads park in [`CancelToken::sleep_until`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

struct CancelState {
    cancelled: AtomicBool,
    // Async waiters.
    notify: Notify,
    // Blocking sleepers.
    gate: Mutex<()>,
    wake: Condvar,
}

/// Cloneable cancellation flag. All clones observe the same state.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            state: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                gate: Mutex::new(()),
                wake: Condvar::new(),
            }),
        }
    }

    /// Cancel the token and wake every waiter. Idempotent.
    pub fn cancel(&self) {
        {
            let _gate = self.state.gate.lock();
            if self.state.cancelled.swap(true, Ordering::SeqCst) {
                return;
            }
            self.state.wake.notify_all();
        }
        self.state.notify.notify_waiters();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel()
            // cannot slip between the check and the await.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Block the calling thread until `deadline` or cancellation.
    ///
    /// Returns `true` when the deadline was reached, `false` when the token
    /// was cancelled first.
    pub fn sleep_until(&self, deadline: Instant) -> bool {
        let mut gate = self.state.gate.lock();
        loop {
            if self.is_cancelled() {
                return false;
            }
            if Instant::now() >= deadline {
                return true;
            }
            self.state.wake.wait_until(&mut gate, deadline);
        }
    }

    /// [`sleep_until`](Self::sleep_until) relative to now.
    pub fn sleep_cancellable(&self, total: Duration) -> bool {
        self.sleep_until(Instant::now() + total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn cancel_is_idempotent_and_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn sleep_runs_to_deadline_when_not_cancelled() {
        let token = CancelToken::new();
        let start = Instant::now();
        assert!(token.sleep_cancellable(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn cancel_wakes_blocking_sleeper() {
        let token = CancelToken::new();
        let sleeper = token.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || sleeper.sleep_cancellable(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        let reached_deadline = handle.join().unwrap();
        assert!(!reached_deadline);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancel_wakes_async_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("waiter must wake")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already-cancelled token must not wait");
    }
}

//! A cloneable handle for poking a session from external code.

use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio_util::sync::CancellationToken;

/// A cloneable handle for poking a session from external code.
///
/// All fields are `Arc`-wrapped, so cloning is cheap.
#[derive(Clone)]
pub struct SessionHandle {
    pub(crate) cancel: Arc<Mutex<CancellationToken>>,
    pub(crate) idle_notify: Arc<tokio::sync::Notify>,
    pub(crate) is_running: Arc<AtomicBool>,
}

impl SessionHandle {
    pub(crate) fn new() -> Self {
        Self {
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            idle_notify: Arc::new(tokio::sync::Notify::new()),
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel the current run; it stops at the next cancellation point.
    pub fn cancel(&self) {
        self.cancel.lock().cancel();
    }

    /// Whether the session token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.lock().is_cancelled()
    }

    /// The session-level token (cloned; cancelling it cancels the session).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Install a fresh token so the session can run again after a cancel.
    pub fn reset(&self) {
        *self.cancel.lock() = CancellationToken::new();
    }

    pub(crate) fn set_running(&self) {
        self.is_running.store(true, Ordering::Release);
    }

    pub(crate) fn set_idle(&self) {
        self.is_running.store(false, Ordering::Release);
        self.idle_notify.notify_waiters();
    }

    /// Wait until the session becomes idle (finishes running).
    pub async fn wait_for_idle(&self) {
        let notified = self.idle_notify.notified();
        if !self.is_running.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    /// Wait until the session becomes idle, with a timeout.
    /// Returns `true` if idle was reached, `false` on timeout.
    pub async fn wait_for_idle_timeout(&self, timeout: std::time::Duration) -> bool {
        if !self.is_running.load(Ordering::Acquire) {
            return true;
        }
        tokio::time::timeout(timeout, self.wait_for_idle())
            .await
            .is_ok()
    }

    /// Whether a run is currently in progress.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }
}

/// Keeps the session marked as running until dropped.
///
/// Dropping a run future midway still leaves the session idle.
pub(crate) struct RunningGuard(SessionHandle);

impl RunningGuard {
    pub(crate) fn new(handle: &SessionHandle) -> Self {
        handle.set_running();
        Self(handle.clone())
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.set_idle();
    }
}

/// Links the session token with the caller's token for one run.
///
/// Work is cancelled when either side is.
#[derive(Clone)]
pub(crate) struct CancelScope {
    session: CancellationToken,
    caller: CancellationToken,
}

impl CancelScope {
    pub(crate) fn new(session: CancellationToken, caller: CancellationToken) -> Self {
        Self { session, caller }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.session.is_cancelled() || self.caller.is_cancelled()
    }

    /// Resolves once either token is cancelled.
    pub(crate) async fn cancelled(&self) {
        tokio::select! {
            _ = self.session.cancelled() => {}
            _ = self.caller.cancelled() => {}
        }
    }

    /// A token to hand to one provider or tool call.
    pub(crate) fn child_token(&self) -> CancellationToken {
        self.session.child_token()
    }

    /// Run `fut` unless the scope is cancelled first.
    ///
    /// On cancellation `token` is cancelled and the in-flight future is dropped.
    pub(crate) async fn guard<F: std::future::Future>(
        &self,
        token: &CancellationToken,
        fut: F,
    ) -> Option<F::Output> {
        if self.is_cancelled() {
            token.cancel();
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => {
                token.cancel();
                None
            }
            out = fut => Some(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_idle_when_not_running() {
        let handle = SessionHandle::new();
        assert!(!handle.is_running());
        assert!(handle.wait_for_idle_timeout(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_wait_for_idle_wakes_on_set_idle() {
        let handle = SessionHandle::new();
        handle.set_running();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_for_idle_timeout(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        handle.set_idle();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_running_guard_sets_idle_on_drop() {
        let handle = SessionHandle::new();
        let guard = RunningGuard::new(&handle);
        assert!(handle.is_running());

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_for_idle_timeout(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        drop(guard);
        assert!(!handle.is_running());
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_and_reset() {
        let handle = SessionHandle::new();
        let token = handle.cancel_token();
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(handle.is_cancelled());

        handle.reset();
        assert!(!handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_guard_drops_future_on_caller_cancel() {
        let caller = CancellationToken::new();
        let scope = CancelScope::new(CancellationToken::new(), caller.clone());
        let token = scope.child_token();

        let cancel_soon = {
            let caller = caller.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                caller.cancel();
            }
        };
        tokio::spawn(cancel_soon);

        let out = scope
            .guard(&token, tokio::time::sleep(Duration::from_secs(30)))
            .await;
        assert!(out.is_none());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_guard_passes_output_through() {
        let scope = CancelScope::new(CancellationToken::new(), CancellationToken::new());
        let token = scope.child_token();
        assert_eq!(scope.guard(&token, async { 7 }).await, Some(7));
    }
}

//! Linked, one-way cancellation scopes.
//!
//! A [`CancellationScope`] is triggered either directly through
//! [`cancel`](CancellationScope::cancel) or when any scope it was derived
//! from is triggered. Once triggered it stays triggered.
//!
//! Consumers derive a child scope from the caller's scope at start time and
//! trigger only that child on stop, so stopping one consumer never cancels
//! the caller or its siblings.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::select_all;
use tokio::sync::watch;

use crate::{BusError, Result};

/// Cancellation signal shared by a consumer, its loop and its handler calls.
///
/// Cloning is cheap; clones observe and trigger the same scope.
#[derive(Clone, Debug)]
pub struct CancellationScope {
    // ---
    trigger: Arc<watch::Sender<bool>>,

    /// Own receiver first, then one receiver per ancestor.
    chain: Arc<[watch::Receiver<bool>]>,
}

impl CancellationScope {
    // ---

    /// Create a root scope.
    pub fn new() -> Self {
        // ---
        let (tx, rx) = watch::channel(false);
        Self {
            trigger: Arc::new(tx),
            chain: Arc::from(vec![rx]),
        }
    }

    /// Derive a scope that is triggered whenever `self` (or any of its
    /// ancestors) is, and that can be triggered independently.
    pub fn child(&self) -> Self {
        // ---
        let (tx, rx) = watch::channel(false);

        let mut chain = Vec::with_capacity(self.chain.len() + 1);
        chain.push(rx);
        chain.extend(self.chain.iter().cloned());

        Self {
            trigger: Arc::new(tx),
            chain: Arc::from(chain),
        }
    }

    /// Trigger this scope and all scopes derived from it.
    pub fn cancel(&self) {
        self.trigger.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.chain.iter().any(|rx| *rx.borrow())
    }

    /// Resolves once the scope is triggered.
    pub async fn cancelled(&self) {
        // ---
        if self.is_cancelled() {
            return;
        }

        let waits = self.chain.iter().map(|rx| {
            let mut rx = rx.clone();
            Box::pin(async move {
                // A dropped, never-triggered ancestor must not fire.
                let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
                if closed {
                    std::future::pending::<()>().await;
                }
            })
        });

        select_all(waits).await;
    }

    /// Run `fut` to completion unless the scope fires first.
    ///
    /// Returns [`BusError::Cancelled`] when the scope wins; `fut` is dropped
    /// at its current suspension point.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        // ---
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(BusError::Cancelled),
            out = fut => Ok(out),
        }
    }

    /// Sleep for `period`, returning early with `Cancelled` if the scope fires.
    pub async fn sleep(&self, period: std::time::Duration) -> Result<()> {
        self.run(tokio::time::sleep(period)).await
    }
}

impl Default for CancellationScope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn child_follows_parent() {
        // ---
        let parent = CancellationScope::new();
        let child = parent.child();
        let grandchild = child.child();

        parent.cancel();

        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        timeout(Duration::from_millis(100), grandchild.cancelled())
            .await
            .expect("grandchild should observe parent cancellation");
    }

    #[tokio::test]
    async fn child_cancel_does_not_reach_parent() {
        // ---
        let parent = CancellationScope::new();
        let child = parent.child();
        let sibling = parent.child();

        child.cancel();

        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(!sibling.is_cancelled());
    }

    #[tokio::test]
    async fn cancellation_is_sticky() {
        // ---
        let scope = CancellationScope::new();
        scope.cancel();
        scope.cancel();

        assert!(scope.is_cancelled());
        assert!(scope.clone().is_cancelled());
        assert!(scope.child().is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_wakes_waiter() {
        // ---
        let scope = CancellationScope::new();
        let waiter = {
            let scope = scope.clone();
            tokio::spawn(async move { scope.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        scope.cancel();

        timeout(Duration::from_millis(100), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_parent_does_not_cancel_child() {
        // ---
        let parent = CancellationScope::new();
        let child = parent.child();
        drop(parent);

        assert!(!child.is_cancelled());
        let res = timeout(Duration::from_millis(50), child.cancelled()).await;
        assert!(res.is_err(), "child fired after parent was dropped");
    }

    #[tokio::test]
    async fn run_returns_cancelled_when_scope_fires() {
        // ---
        let scope = CancellationScope::new();
        let runner = {
            let scope = scope.clone();
            tokio::spawn(async move { scope.run(std::future::pending::<()>()).await })
        };

        scope.cancel();
        let res = timeout(Duration::from_millis(100), runner)
            .await
            .expect("run did not observe cancellation")
            .unwrap();
        assert!(matches!(res, Err(BusError::Cancelled)));
    }

    #[tokio::test]
    async fn run_passes_output_through() {
        // ---
        let scope = CancellationScope::new();
        assert_eq!(scope.run(async { 42 }).await.unwrap(), 42);
    }
}

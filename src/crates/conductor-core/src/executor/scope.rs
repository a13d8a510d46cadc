//! Cooperative cancellation scopes
//!
//! Every task the scheduler dispatches runs under a [`CancelScope`] tied to
//! its enclosing block: `parallel{waitFor:any}` cancels losing siblings,
//! `try` cancels remaining children before running `catch`, a timeout
//! cancels the step's scope before marking it failed.
//!
//! Scopes form a tree. Cancelling a scope cancels everything below it;
//! cancelling a child never affects the parent. Cancellation is
//! cooperative - members observe it through the scope handed to them in
//! their context and are expected to wind down promptly; the engine never
//! forcibly interrupts work, it only refuses to start new work and rejects
//! state commits from cancelled tasks.

use tokio::sync::watch;
use std::sync::Arc;

/// A node in the cancellation tree.
///
/// Cloning a scope shares the same cancellation flag; use [`child`] to
/// create a subordinate scope.
///
/// [`child`]: CancelScope::child
#[derive(Debug, Clone)]
pub struct CancelScope {
    /// Receivers for every ancestor plus this scope (last entry)
    channels: Vec<watch::Receiver<bool>>,
    own: Arc<watch::Sender<bool>>,
}

impl CancelScope {
    /// A fresh root scope.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            channels: vec![rx],
            own: Arc::new(tx),
        }
    }

    /// Derive a subordinate scope: cancelled when this scope is cancelled,
    /// cancellable on its own without affecting this scope.
    pub fn child(&self) -> Self {
        let (tx, rx) = watch::channel(false);
        let mut channels = self.channels.clone();
        channels.push(rx);
        Self {
            channels,
            own: Arc::new(tx),
        }
    }

    /// Cancel this scope and, transitively, every scope derived from it.
    pub fn cancel(&self) {
        let _ = self.own.send(true);
    }

    /// Non-blocking poll.
    pub fn is_cancelled(&self) -> bool {
        self.channels.iter().any(|rx| *rx.borrow())
    }

    /// Resolve when this scope (or any ancestor) is cancelled. If every
    /// ancestor sender is gone without firing, the future pends forever -
    /// callers always race it against real work.
    pub async fn cancelled(&self) {
        let mut receivers = self.channels.clone();
        loop {
            if receivers.iter().any(|rx| *rx.borrow()) {
                return;
            }
            if receivers.is_empty() {
                // No live senders left; nothing can ever cancel us.
                std::future::pending::<()>().await;
            }
            let waits = receivers
                .iter_mut()
                .map(|rx| Box::pin(rx.changed()))
                .collect::<Vec<_>>();
            let (result, index, rest) = futures::future::select_all(waits).await;
            drop(rest);
            if result.is_err() {
                // That sender is gone; it can no longer fire.
                receivers.remove(index);
            }
        }
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_propagates_to_children() {
        let root = CancelScope::new();
        let child = root.child();
        let grandchild = child.child();

        assert!(!grandchild.is_cancelled());
        root.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_cancel_does_not_affect_parent() {
        let root = CancelScope::new();
        let child = root.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let root = CancelScope::new();
        let child = root.child();

        let waiter = tokio::spawn(async move {
            child.cancelled().await;
            true
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        root.cancel();

        let resolved = tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("cancellation observed")
            .unwrap();
        assert!(resolved);
    }

    #[tokio::test]
    async fn test_clone_shares_flag() {
        let scope = CancelScope::new();
        let other = scope.clone();
        other.cancel();
        assert!(scope.is_cancelled());
    }
}

//! Cooperative cancellation shared by election loops, gossip tasks and
//! websocket sessions.

use futures_util::future::select_all;
use std::sync::Arc;
use tokio::sync::watch;

/// A cloneable cancellation scope.
///
/// Clones share one flag. A token created with [`CancelToken::child`] is
/// cancelled when it or any of its ancestors is cancelled; cancelling the
/// child leaves the parent untouched.
#[derive(Clone, Debug)]
pub struct CancelToken {
    /// This scope's flag first, then every ancestor's.
    chain: Vec<Arc<watch::Sender<bool>>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            chain: vec![Arc::new(tx)],
        }
    }

    /// Create a nested scope.
    pub fn child(&self) -> Self {
        let (tx, _rx) = watch::channel(false);
        let mut chain = Vec::with_capacity(self.chain.len() + 1);
        chain.push(Arc::new(tx));
        chain.extend(self.chain.iter().cloned());
        Self { chain }
    }

    pub fn cancel(&self) {
        self.chain[0].send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.chain.iter().any(|tx| *tx.borrow())
    }

    /// Resolve once this scope (or an ancestor) is cancelled.
    pub async fn cancelled(&self) {
        let waits = self.chain.iter().map(|tx| {
            let mut rx = tx.subscribe();
            Box::pin(async move {
                // The sender lives as long as `self`, so this only resolves on cancel.
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            })
        });
        select_all(waits).await;
    }
}

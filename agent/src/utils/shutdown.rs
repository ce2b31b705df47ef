//! Cooperative cancellation shared by every producer and the upload scan loop.
//!
//! The signal is a thin wrapper over a [`tokio::sync::watch`] channel holding
//! a single boolean. Cloning is cheap; every clone observes the same state.
//! Once triggered it stays triggered.

use std::sync::Arc;

use tokio::sync::watch;

/// A clonable, one-shot cancellation signal.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Creates a signal in the not-triggered state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Signals cancellation to every holder of this signal.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Returns true once [`trigger`](Self::trigger) has been called.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once the signal has been triggered.
    ///
    /// Returns immediately if it already was.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of self, so this cannot fail
        // while we hold `self`.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

//! Process-wide shutdown signal.
//!
//! The coordinator is created once and hands a [`ShutdownToken`] to every
//! evaluator at construction. Signalling is one-shot: the first
//! [`ShutdownCoordinator::initiate`] flips the flag and wakes every waiter;
//! later calls change nothing.

use std::sync::OnceLock;
use tokio::sync::watch;
use tracing::{debug, info, instrument};

/// Owner of the shutdown signal.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    sender: watch::Sender<bool>,
    reason: OnceLock<String>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    /// Create a coordinator in the running state.
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(false);
        Self {
            sender,
            reason: OnceLock::new(),
        }
    }

    /// Token observing this coordinator.
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            receiver: self.sender.subscribe(),
        }
    }

    /// Signal shutdown.
    ///
    /// Returns `true` only for the call that actually flipped the signal.
    #[instrument(skip(self))]
    pub fn initiate(&self, reason: &str) -> bool {
        let first = self.sender.send_if_modified(|initiated| {
            if *initiated {
                false
            } else {
                *initiated = true;
                true
            }
        });

        if first {
            let _ = self.reason.set(reason.to_owned());
            info!(reason, waiters = self.sender.receiver_count(), "Shutdown initiated");
        } else {
            debug!(
                reason,
                original_reason = self.reason().unwrap_or_default(),
                "Shutdown already initiated"
            );
        }
        first
    }

    /// True once shutdown has been signalled.
    pub fn is_initiated(&self) -> bool {
        *self.sender.borrow()
    }

    /// Reason given by the initiating call.
    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }
}

/// Cloneable, read-only view of the shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    receiver: watch::Receiver<bool>,
}

impl ShutdownToken {
    /// Non-blocking check.
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once shutdown is signalled or the coordinator is dropped.
    ///
    /// Resolves immediately if either already happened. Cancel safe.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // An error means the coordinator is gone, which also ends the run.
        let _ = receiver.wait_for(|initiated| *initiated).await;
    }
}

//! Cancellation token threaded through every blocking build call.
//!
//! The orchestrator owns the only writer; the OS signal handler and normal
//! teardown both cancel through it. Conveyors, packers, script execution and
//! the FUSE helpers observe the token and abort in-flight work.

use tokio::sync::watch;

/// Cloneable cancellation token.
///
/// Built on a `watch` channel so observers can either poll `is_cancelled`
/// inside loops or `await` the flip inside `tokio::select!`.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Signal cancellation to every clone of this token.
    pub fn cancel(&self) {
        // Receivers may all be gone during teardown; that is fine.
        let _ = self.tx.send(true);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        // The sender lives inside self, so the channel cannot close early.
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

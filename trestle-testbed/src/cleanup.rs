//! Ordered reversal callbacks for end-of-run cleanup.
//!
//! Everything the harness creates against the cluster (deployments, node
//! labels, isolation rules) registers a reversal callback here. The stack
//! is drained in reverse registration order so dependents are removed
//! before the things they depend on, and one failing callback never stops
//! the rest. The CLI drains it on normal completion and on Ctrl-C.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

type CleanupFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send>;

/// Handle returned by [`CleanupStack::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupToken(u64);

struct Entry {
    id: u64,
    label: String,
    callback: CleanupFn,
}

/// One ordered list of pending cleanups for a test run.
///
/// A callback runs at most once: either when the stack is drained or never,
/// if it was unregistered first (the normal path for a fault that was
/// reversed explicitly).
#[derive(Default)]
pub struct CleanupStack {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl CleanupStack {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cleanup callback, returning a token for unregistration.
    ///
    /// The label shows up in logs when the callback runs or fails.
    pub async fn register<F, Fut>(&self, label: impl Into<String>, callback: F) -> CleanupToken
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            id,
            label: label.into(),
            callback: Box::new(move || Box::pin(callback())),
        };
        self.entries.lock().await.push(entry);
        CleanupToken(id)
    }

    /// Remove a pending callback without running it.
    ///
    /// Returns false when the token was already unregistered or drained.
    pub async fn unregister(&self, token: CleanupToken) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.iter().position(|e| e.id == token.0) {
            Some(pos) => {
                entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Number of callbacks still pending.
    pub async fn pending(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Run every pending callback in reverse registration order.
    ///
    /// Failures are logged and skipped. Callbacks registered while the
    /// drain is in progress are drained too.
    pub async fn drain(&self) {
        let total = self.pending().await;
        if total > 0 {
            tracing::info!("Draining {} pending cleanups", total);
        }

        loop {
            let entry = self.entries.lock().await.pop();
            let Some(entry) = entry else { break };

            tracing::debug!("Running cleanup: {}", entry.label);
            if let Err(e) = (entry.callback)().await {
                tracing::warn!("Cleanup '{}' failed: {}", entry.label, e);
            }
        }
    }
}

//! Unique name generation for labels and isolation rules.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use uuid::Uuid;

/// Generates run-tagged unique names of the form `{prefix}-{run}-{seq}`.
///
/// The run tag is the first 8 hex chars of a v4 UUID, so concurrent
/// harness runs against a shared namespace cannot collide; the sequence
/// number is monotonic within the run. Clones share the counter. The
/// output is valid both as a Kubernetes label key and as an object name.
#[derive(Debug, Clone)]
pub struct NameSource {
    run: Arc<str>,
    counter: Arc<AtomicU64>,
}

impl NameSource {
    /// Create a source with a fresh run tag.
    pub fn new() -> Self {
        let tag = Uuid::new_v4().as_simple().to_string();
        Self {
            run: tag[..8].into(),
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Next unique name under `prefix`.
    pub fn next(&self, prefix: &str) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", prefix, self.run, seq)
    }

    /// The run tag shared by every name from this source.
    pub fn run_tag(&self) -> &str {
        &self.run
    }
}

impl Default for NameSource {
    fn default() -> Self {
        Self::new()
    }
}

//! Reverse-order cleanup stack for scoped resources.
//!
//! Actions are pushed as resources are acquired and run in reverse order when
//! the stack is drained or dropped, on success and failure alike. Failing
//! actions are logged and never interrupt the remaining ones.

use std::fmt;

use tempfile::TempPath;
use tracing::{debug, warn};

type CleanupAction = Box<dyn FnOnce() -> std::io::Result<()> + Send + Sync>;

/// Stack of deferred cleanup actions.
#[derive(Default)]
pub struct CleanupStack {
    actions: Vec<(String, CleanupAction)>,
}

impl CleanupStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defers `action`, labelled for diagnostics.
    pub fn defer<F>(&mut self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> std::io::Result<()> + Send + Sync + 'static,
    {
        self.actions.push((label.into(), Box::new(action)));
    }

    /// Defers deletion of a temporary file.
    pub fn defer_remove(&mut self, path: TempPath) {
        let label = format!("remove {}", path.display());
        self.defer(label, move || path.close());
    }

    /// Number of pending actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns `true` when nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Runs every pending action, newest first.
    pub fn run(&mut self) {
        while let Some((label, action)) = self.actions.pop() {
            match action() {
                Ok(()) => debug!(action = %label, "cleanup action completed"),
                Err(err) => warn!(action = %label, error = %err, "cleanup action failed"),
            }
        }
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupStack")
            .field(
                "pending",
                &self.actions.iter().map(|(label, _)| label).collect::<Vec<_>>(),
            )
            .finish()
    }
}

//! Scoped release of run-owned resources.
//!
//! Actions registered on a [`CleanupStack`] run exactly once, newest first,
//! either when [`CleanupStack::run_all`] is called or when the stack is
//! dropped, whichever comes first.

use tracing::{debug, info};

type CleanupAction = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct CleanupStack {
    actions: Vec<(String, CleanupAction)>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, action: impl FnOnce() + Send + 'static) {
        let name = name.into();
        debug!(cleanup = %name, "Registered cleanup action");
        self.actions.push((name, Box::new(action)));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every pending action, newest first. Returns the names that ran.
    pub fn run_all(&mut self) -> Vec<String> {
        let mut ran = Vec::with_capacity(self.actions.len());
        while let Some((name, action)) = self.actions.pop() {
            info!(cleanup = %name, "Running cleanup action");
            action();
            ran.push(name);
        }
        ran
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        self.run_all();
    }
}

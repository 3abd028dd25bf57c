//! Bounded-window replay cache for signal outcomes.
//!
//! Owned by a single account's worker task, so no locking is needed beyond
//! the worker's own serialization.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Remembers each correlation id's outcome for the dedupe window, replaying
/// it verbatim on duplicates.
pub struct DedupeCache<T> {
    window: Duration,
    entries: HashMap<String, (Instant, T)>,
}

impl<T: Clone> DedupeCache<T> {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
        }
    }

    /// Prior outcome for `correlation_id`, if it is still inside the window.
    pub fn get(&mut self, correlation_id: &str) -> Option<T> {
        self.prune();
        self.entries
            .get(correlation_id)
            .map(|(_, outcome)| outcome.clone())
    }

    pub fn put(&mut self, correlation_id: &str, outcome: T) {
        self.entries
            .insert(correlation_id.to_string(), (Instant::now(), outcome));
    }

    fn prune(&mut self) {
        let window = self.window;
        self.entries
            .retain(|_, (inserted, _)| inserted.elapsed() <= window);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

//! Detects tracked processes disappearing between ticks

use crate::model::{ProcessHandle, ProcessKey};
use std::collections::HashMap;

/// Result of comparing two consecutive ticks.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LivenessDiff {
    /// Present last tick, gone now. Sorted by key.
    pub disappeared: Vec<ProcessHandle>,
    /// Present now, not last tick. Sorted by key.
    pub newly_seen: Vec<ProcessHandle>,
}

impl LivenessDiff {
    pub fn is_empty(&self) -> bool {
        self.disappeared.is_empty() && self.newly_seen.is_empty()
    }
}

/// Remembers the identities seen on the previous tick.
///
/// Identities are `(pid, start_time)`, so a pid recycled by an unrelated
/// process shows up as one disappearance plus one new handle.
#[derive(Debug, Default)]
pub struct LivenessTracker {
    previous: HashMap<ProcessKey, ProcessHandle>,
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, current: impl IntoIterator<Item = ProcessHandle>) -> LivenessDiff {
        let current: HashMap<ProcessKey, ProcessHandle> =
            current.into_iter().map(|h| (h.key(), h)).collect();

        let mut disappeared: Vec<ProcessHandle> = self
            .previous
            .iter()
            .filter(|(key, _)| !current.contains_key(key))
            .map(|(_, handle)| handle.clone())
            .collect();
        let mut newly_seen: Vec<ProcessHandle> = current
            .iter()
            .filter(|(key, _)| !self.previous.contains_key(key))
            .map(|(_, handle)| handle.clone())
            .collect();
        disappeared.sort_by_key(ProcessHandle::key);
        newly_seen.sort_by_key(ProcessHandle::key);

        self.previous = current;
        LivenessDiff {
            disappeared,
            newly_seen,
        }
    }

    /// Handles seen on the last tick, sorted by key.
    pub fn handles(&self) -> Vec<ProcessHandle> {
        let mut handles: Vec<ProcessHandle> = self.previous.values().cloned().collect();
        handles.sort_by_key(ProcessHandle::key);
        handles
    }

    pub fn len(&self) -> usize {
        self.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }
}

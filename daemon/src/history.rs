//! Bounded per-process snapshot history

use crate::model::{ProcessKey, Snapshot};
use chrono::Duration;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Recent snapshots for one process, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryWindow {
    snapshots: VecDeque<Snapshot>,
}

impl HistoryWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a window from already-ordered snapshots.
    pub fn from_snapshots(snapshots: impl IntoIterator<Item = Snapshot>) -> Self {
        Self {
            snapshots: snapshots.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.back()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Snapshot> + ExactSizeIterator {
        self.snapshots.iter()
    }

    /// Wall-clock time between the oldest and newest snapshot.
    pub fn span(&self) -> Duration {
        match (self.snapshots.front(), self.snapshots.back()) {
            (Some(first), Some(last)) => last.timestamp - first.timestamp,
            _ => Duration::zero(),
        }
    }

    /// Append, keeping at most `capacity` entries while still covering
    /// `retention`. Returns false if the timestamp does not move forward.
    fn push(&mut self, snapshot: Snapshot, capacity: usize, retention: Duration) -> bool {
        if let Some(last) = self.snapshots.back() {
            if snapshot.timestamp <= last.timestamp {
                return false;
            }
        }
        self.snapshots.push_back(snapshot);
        while self.snapshots.len() > capacity {
            self.snapshots.pop_front();
        }
        // Drop the oldest entry only while the rest still spans the retention.
        while self.snapshots.len() >= 2 {
            let newest = self.snapshots[self.snapshots.len() - 1].timestamp;
            if newest - self.snapshots[1].timestamp >= retention {
                self.snapshots.pop_front();
            } else {
                break;
            }
        }
        true
    }
}

/// Snapshot windows for every tracked process.
#[derive(Debug)]
pub struct HistoryBuffer {
    capacity: usize,
    retention: Duration,
    windows: HashMap<ProcessKey, HistoryWindow>,
}

impl HistoryBuffer {
    pub fn new(max_snapshots: usize, window_seconds: u64) -> Self {
        Self {
            capacity: max_snapshots.max(1),
            retention: Duration::seconds(window_seconds as i64),
            windows: HashMap::new(),
        }
    }

    pub fn record(&mut self, key: ProcessKey, snapshot: Snapshot) {
        let window = self.windows.entry(key).or_default();
        if !window.push(snapshot, self.capacity, self.retention) {
            debug!("Dropping out-of-order snapshot for {}", key);
        }
    }

    /// Copy of the current evidence for `key`; empty if never recorded.
    pub fn window_for(&self, key: &ProcessKey) -> HistoryWindow {
        self.windows.get(key).cloned().unwrap_or_default()
    }

    pub fn latest(&self, key: &ProcessKey) -> Option<&Snapshot> {
        self.windows.get(key).and_then(|w| w.latest())
    }

    pub fn snapshot_count(&self, key: &ProcessKey) -> usize {
        self.windows.get(key).map_or(0, HistoryWindow::len)
    }

    pub fn purge(&mut self, key: &ProcessKey) {
        self.windows.remove(key);
    }
}

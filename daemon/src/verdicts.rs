//! Append-only verdict log with monotonically increasing sequence numbers

use crate::model::{SequencedVerdict, Verdict};
use std::collections::VecDeque;

/// Verdicts are never mutated once appended. Only the most recent
/// `retain` entries stay in memory; sequence numbers keep counting.
#[derive(Debug)]
pub struct VerdictLog {
    entries: VecDeque<SequencedVerdict>,
    retain: usize,
    last_sequence: u64,
}

impl VerdictLog {
    pub fn new(retain: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            retain: retain.max(1),
            last_sequence: 0,
        }
    }

    /// Continue numbering after `sequence`, e.g. the last one persisted
    /// before a restart. Never moves the sequence backwards.
    pub fn resume_from(&mut self, sequence: u64) {
        self.last_sequence = self.last_sequence.max(sequence);
    }

    pub fn append(&mut self, verdict: Verdict) -> SequencedVerdict {
        self.last_sequence += 1;
        let entry = SequencedVerdict {
            sequence: self.last_sequence,
            verdict,
        };
        self.entries.push_back(entry.clone());
        while self.entries.len() > self.retain {
            self.entries.pop_front();
        }
        entry
    }

    /// Entries with a sequence strictly greater than `since`, oldest first.
    pub fn since(&self, since: u64, limit: usize) -> Vec<SequencedVerdict> {
        self.entries
            .iter()
            .filter(|e| e.sequence > since)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

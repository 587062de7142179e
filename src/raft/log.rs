//! In-memory raft log.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One replicated log entry. Indices are monotonically increasing from 1;
/// index 0 denotes the empty log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log, starting at 1.
    pub index: u64,

    /// Term in which the entry was created.
    pub term: u64,

    /// Opaque command payload. Empty for the no-op a fresh leader appends.
    pub payload: Bytes,
}

/// The log owned by the raft actor.
#[derive(Debug, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the last entry, or 0 when empty.
    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Term of the last entry, or 0 when empty.
    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of the entry at `index`; `Some(0)` for index 0, `None` past the
    /// end of the log.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.entries.get(index as usize - 1).map(|e| e.term)
    }

    /// Entry at `index`, if present.
    pub fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Append a new entry created in `term`, returning its index.
    pub fn append(&mut self, term: u64, payload: Bytes) -> u64 {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry {
            index,
            term,
            payload,
        });
        index
    }

    /// Up to `max` entries starting at `from` (1-based, inclusive).
    pub fn entries_from(&self, from: u64, max: usize) -> Vec<LogEntry> {
        if from == 0 || from > self.last_index() {
            return Vec::new();
        }
        let start = from as usize - 1;
        let end = (start + max).min(self.entries.len());
        self.entries[start..end].to_vec()
    }

    /// Follower-side append: verify the entry preceding `prev_log_index`
    /// matches `prev_log_term`, truncate any conflicting suffix and append
    /// what is missing. Returns false on a consistency mismatch.
    pub fn try_append(
        &mut self,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
    ) -> bool {
        match self.term_at(prev_log_index) {
            Some(term) if term == prev_log_term => {}
            _ => return false,
        }
        for entry in entries {
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => {
                    // Already present, duplicate delivery.
                }
                Some(_) => {
                    // Conflicting suffix from a deposed leader.
                    self.entries.truncate(entry.index as usize - 1);
                    self.entries.push(entry);
                }
                None => {
                    if entry.index == self.last_index() + 1 {
                        self.entries.push(entry);
                    } else {
                        // Gap: the leader will retry from an earlier index.
                        return false;
                    }
                }
            }
        }
        true
    }
}

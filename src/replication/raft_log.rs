//! In-memory Raft log with snapshot compaction
//!
//! Indexes start at 1. Everything up to `snapshot_index` has been folded
//! into a state-machine snapshot and is no longer stored.

use serde::{Deserialize, Serialize};

use super::{LogIndex, Term};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    /// Encoded request; empty for the no-op a new leader appends.
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct RaftLog {
    snapshot_index: LogIndex,
    snapshot_term: Term,
    /// `entries[i].index == snapshot_index + 1 + i`.
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    pub fn last_index(&self) -> LogIndex {
        self.snapshot_index + self.entries.len() as LogIndex
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    /// Term of the entry at `index`, if it is known.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.entry(index).map(|e| e.term)
    }

    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.entries.get((index - self.snapshot_index - 1) as usize)
    }

    /// Append a new entry at the end of the log.
    pub fn append(&mut self, term: Term, payload: Vec<u8>) -> LogIndex {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry {
            term,
            index,
            payload,
        });
        index
    }

    /// Merge entries received from a leader after a successful consistency
    /// check. Conflicting suffixes are truncated; matching entries are kept.
    pub fn merge(&mut self, entries: Vec<LogEntry>) {
        for entry in entries {
            if entry.index <= self.snapshot_index {
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_from(entry.index);
                    self.entries.push(entry);
                }
                None => self.entries.push(entry),
            }
        }
    }

    /// Up to `max` entries starting at `start`.
    pub fn entries_from(&self, start: LogIndex, max: usize) -> Vec<LogEntry> {
        if start <= self.snapshot_index {
            return Vec::new();
        }
        let offset = (start - self.snapshot_index - 1) as usize;
        self.entries.iter().skip(offset).take(max).cloned().collect()
    }

    fn truncate_from(&mut self, index: LogIndex) {
        if index <= self.snapshot_index {
            self.entries.clear();
            return;
        }
        self.entries.truncate((index - self.snapshot_index - 1) as usize);
    }

    /// Drop entries up to and including `index`, which a snapshot now covers.
    pub fn compact_to(&mut self, index: LogIndex) {
        if index <= self.snapshot_index || index > self.last_index() {
            return;
        }
        let term = self.term_at(index).unwrap_or(self.snapshot_term);
        let drop = (index - self.snapshot_index) as usize;
        self.entries.drain(..drop);
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Replace the whole log with an installed snapshot.
    pub fn reset_to_snapshot(&mut self, index: LogIndex, term: Term) {
        if self.term_at(index) == Some(term) && index <= self.last_index() {
            // Keep the suffix that already agrees with the snapshot.
            self.compact_to(index);
            return;
        }
        self.entries.clear();
        self.snapshot_index = index;
        self.snapshot_term = term;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: Term, index: LogIndex) -> LogEntry {
        LogEntry {
            term,
            index,
            payload: vec![index as u8],
        }
    }

    #[test]
    fn merge_truncates_conflicting_suffix() {
        let mut log = RaftLog::new();
        log.append(1, vec![]);
        log.append(1, vec![]);
        log.append(2, vec![]);

        log.merge(vec![entry(1, 2), entry(3, 3), entry(3, 4)]);
        assert_eq!(log.last_index(), 4);
        assert_eq!(log.term_at(2), Some(1));
        assert_eq!(log.term_at(3), Some(3));
        assert_eq!(log.last_term(), 3);
    }

    #[test]
    fn compaction_keeps_indexes_stable() {
        let mut log = RaftLog::new();
        for _ in 0..5 {
            log.append(1, vec![]);
        }
        log.compact_to(3);

        assert_eq!(log.snapshot_index(), 3);
        assert_eq!(log.term_at(3), Some(1));
        assert!(log.entry(3).is_none());
        assert_eq!(log.entry(4).map(|e| e.index), Some(4));
        assert_eq!(log.entries_from(4, 10).len(), 2);
        assert!(log.entries_from(2, 10).is_empty());
        assert_eq!(log.append(2, vec![]), 6);
    }

    #[test]
    fn installing_a_newer_snapshot_discards_the_log() {
        let mut log = RaftLog::new();
        log.append(1, vec![]);
        log.reset_to_snapshot(10, 4);
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.last_term(), 4);
        assert_eq!(log.append(4, vec![]), 11);
    }
}

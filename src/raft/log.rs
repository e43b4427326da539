use crate::delta::StateDelta;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical time. A server's view of the current term never decreases once
/// persisted.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Term(pub u64);

impl Term {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of an entry in the replicated log. The log is 1-indexed to stay
/// consistent with the Raft paper; 0 means "no entry".
pub type LogIndex = u64;

/// One replication unit: the deltas of a single transaction, or a leader
/// no-op with no deltas, stamped with the term in which it was first
/// appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub deltas: Vec<StateDelta>,
}

impl LogEntry {
    pub fn no_op(term: Term) -> Self {
        LogEntry {
            term,
            deltas: Vec::new(),
        }
    }
}

/// In-memory image of the replicated log. The durable copy lives in the
/// metadata store; every mutation here is persisted by the caller before any
/// message depending on it leaves the server.
#[derive(Debug, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new(entries: Vec<LogEntry>) -> Self {
        RaftLog { entries }
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`; `Term(0)` for index 0 (the empty
    /// prefix), `None` when the index is past the end of the log.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(Term(0));
        }
        self.entry(index).map(|e| e.term)
    }

    /// Returns `(last_log_index, last_log_term)`, `(0, Term(0))` when empty.
    pub fn last_entry_data(&self) -> (LogIndex, Term) {
        match self.entries.last() {
            Some(entry) => (self.last_index(), entry.term),
            None => (0, Term(0)),
        }
    }

    pub fn append(&mut self, entry: LogEntry) -> LogIndex {
        self.entries.push(entry);
        self.last_index()
    }

    /// Deletes every entry with index >= `from`.
    pub fn truncate_suffix(&mut self, from: LogIndex) {
        let keep = from.saturating_sub(1) as usize;
        self.entries.truncate(keep);
    }

    /// Clones every entry with index >= `from`; empty when `from` is past
    /// the end of the log.
    pub fn suffix(&self, from: LogIndex) -> Vec<LogEntry> {
        let start = from.saturating_sub(1) as usize;
        if start >= self.entries.len() {
            return Vec::new();
        }
        self.entries[start..].to_vec()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::StateDelta;

    fn entry(term: u64, tx_id: u64) -> LogEntry {
        LogEntry {
            term: Term(term),
            deltas: vec![StateDelta::begin(tx_id), StateDelta::commit(tx_id)],
        }
    }

    #[test]
    fn empty_log() {
        let log = RaftLog::default();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_entry_data(), (0, Term(0)));
        assert_eq!(log.term_at(0), Some(Term(0)));
        assert_eq!(log.term_at(1), None);
    }

    #[test]
    fn append_is_one_indexed() {
        let mut log = RaftLog::default();
        assert_eq!(log.append(entry(1, 10)), 1);
        assert_eq!(log.append(entry(1, 11)), 2);
        assert_eq!(log.term_at(2), Some(Term(1)));
        assert_eq!(log.last_entry_data(), (2, Term(1)));
    }

    #[test]
    fn truncate_deletes_suffix() {
        let mut log = RaftLog::default();
        log.append(entry(1, 10));
        log.append(entry(1, 11));
        log.append(entry(2, 12));

        log.truncate_suffix(3);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term_at(2), Some(Term(1)));

        // Truncating past the end is a no-op.
        log.truncate_suffix(10);
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn suffix_clones_tail() {
        let mut log = RaftLog::default();
        log.append(entry(1, 10));
        log.append(entry(2, 11));

        assert_eq!(log.suffix(1).len(), 2);
        assert_eq!(log.suffix(2).len(), 1);
        assert_eq!(log.suffix(2)[0].term, Term(2));
        assert!(log.suffix(3).is_empty());
        assert!(log.suffix(40).is_empty());
    }
}

//! The node's view of its durable log
//!
//! `RaftLog` keeps the log, the current term and the vote in memory and writes
//! every change through to the `PersistentStore` before updating memory, so
//! nothing in memory is ever ahead of what has been made durable.

use crate::rpc::entry_wire_len;
use crate::state::PersistentState;
use crate::storage::PersistentStore;
use crate::types::{Entry, LogIndex, NodeId, Term};
use crate::{RaftError, Result};
use tracing::debug;

pub struct RaftLog {
    store: Box<dyn PersistentStore>,
    entries: Vec<Entry>,
    term: Term,
    voted_for: Option<NodeId>,
}

impl RaftLog {
    /// Recover the durable state from `store`
    pub fn open(store: Box<dyn PersistentStore>) -> Result<Self> {
        let PersistentState {
            current_term,
            voted_for,
            log,
        } = store.read_all()?;

        for (pos, entry) in log.iter().enumerate() {
            if entry.index != LogIndex(pos as u64 + 1) {
                return Err(RaftError::Internal(format!(
                    "recovered log is not contiguous at {}",
                    entry.index
                )));
            }
            if pos > 0 && entry.term < log[pos - 1].term {
                return Err(RaftError::Internal(format!(
                    "recovered log has decreasing term at {}",
                    entry.index
                )));
            }
        }

        Ok(Self {
            store,
            entries: log,
            term: current_term,
            voted_for,
        })
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    /// Durably record a term and vote. Terms never go backwards.
    pub fn set_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        if term < self.term {
            return Err(RaftError::Internal(format!(
                "term regression from {} to {}",
                self.term, term
            )));
        }
        if term == self.term && self.voted_for.is_some() && voted_for != self.voted_for {
            return Err(RaftError::Internal(format!(
                "vote change within {}",
                term
            )));
        }
        self.store.set_term_and_vote(term, voted_for)?;
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries.last().map(|e| e.index).unwrap_or(LogIndex::ZERO)
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(Term::ZERO)
    }

    pub fn get(&self, index: LogIndex) -> Option<&Entry> {
        if index == LogIndex::ZERO {
            return None;
        }
        self.entries.get(index.0 as usize - 1)
    }

    /// Term of the entry at `index`; index 0 has term 0
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == LogIndex::ZERO {
            return Some(Term::ZERO);
        }
        self.get(index).map(|e| e.term)
    }

    /// True if the log holds an entry at `index` written in `term`
    pub fn matches(&self, index: LogIndex, term: Term) -> bool {
        self.term_at(index) == Some(term)
    }

    /// Entries starting at `start`: at most `max` of them, and no more than
    /// `max_bytes` on the wire unless the first entry alone exceeds it
    pub fn entries_from(&self, start: LogIndex, max: usize, max_bytes: usize) -> Vec<Entry> {
        let start = start.0.max(1) as usize - 1;
        let Some(available) = self.entries.get(start..) else {
            return vec![];
        };

        let mut batch = Vec::new();
        let mut bytes = 0;
        for entry in available.iter().take(max) {
            bytes += entry_wire_len(entry);
            if !batch.is_empty() && bytes > max_bytes {
                break;
            }
            batch.push(entry.clone());
        }
        batch
    }

    /// Entries in `(after, through]`
    pub fn committed_range(&self, after: LogIndex, through: LogIndex) -> &[Entry] {
        let start = (after.0 as usize).min(self.entries.len());
        let end = (through.0 as usize).min(self.entries.len());
        if start >= end {
            return &[];
        }
        &self.entries[start..end]
    }

    /// Whether a candidate's log is at least as up-to-date as ours
    pub fn is_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let our_term = self.last_term();
        last_log_term > our_term
            || (last_log_term == our_term && last_log_index >= self.last_index())
    }

    /// First index holding `term`, scanning back from `from`. Used as the
    /// conflict hint that lets a leader skip a whole term at once.
    pub fn first_index_of_term(&self, term: Term, from: LogIndex) -> LogIndex {
        let mut index = from;
        while index > LogIndex(1) && self.term_at(index.prev()) == Some(term) {
            index = index.prev();
        }
        index
    }

    /// Last index holding `term`, if any
    pub fn last_index_of_term(&self, term: Term) -> Option<LogIndex> {
        self.entries
            .iter()
            .rev()
            .skip_while(|e| e.term > term)
            .find(|e| e.term == term)
            .map(|e| e.index)
    }

    /// Leader path: append a new command at the end of the log
    pub fn append_command(&mut self, term: Term, command: Vec<u8>) -> Result<LogIndex> {
        let index = self.last_index().next();
        let entry = Entry::new(term, index, command);
        self.store.append_entries(std::slice::from_ref(&entry), None)?;
        self.entries.push(entry);
        Ok(index)
    }

    /// Follower path: merge entries received from the leader
    ///
    /// Entries already present with the same term are skipped. At the first
    /// entry whose term differs, everything from there on is replaced. Entries
    /// at or below `commit_index` are never removed.
    pub fn splice(&mut self, entries: Vec<Entry>, commit_index: LogIndex) -> Result<()> {
        let Some(first_new) = entries
            .iter()
            .position(|e| !self.matches(e.index, e.term))
        else {
            return Ok(());
        };

        let new_entries = &entries[first_new..];
        let start = new_entries[0].index;
        let truncate_after = if start <= self.last_index() {
            let after = start.prev();
            if after < commit_index {
                return Err(RaftError::Internal(format!(
                    "refusing to truncate committed entries after {} (commit index {})",
                    after, commit_index
                )));
            }
            debug!(after = %after, removed = self.last_index().0 - after.0, "Truncating conflicting log suffix");
            Some(after)
        } else if start > self.last_index().next() {
            return Err(RaftError::Internal(format!(
                "gap in log: last {} but received {}",
                self.last_index(),
                start
            )));
        } else {
            None
        };

        self.store.append_entries(new_entries, truncate_after)?;
        if let Some(after) = truncate_after {
            self.entries.truncate(after.0 as usize);
        }
        self.entries.extend_from_slice(new_entries);
        Ok(())
    }

    /// Snapshot of the durable state, as it would be recovered after a crash
    pub fn persistent_state(&self) -> PersistentState {
        PersistentState {
            current_term: self.term,
            voted_for: self.voted_for,
            log: self.entries.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn log_with(terms: &[u64]) -> (RaftLog, MemoryStore) {
        let store = MemoryStore::new();
        let mut log = RaftLog::open(Box::new(store.clone())).unwrap();
        for &t in terms {
            log.append_command(Term(t), format!("t{}", t).into_bytes())
                .unwrap();
        }
        (log, store)
    }

    fn entry(term: u64, index: u64) -> Entry {
        Entry::new(Term(term), LogIndex(index), vec![index as u8])
    }

    #[test]
    fn test_append_and_get() {
        let (log, store) = log_with(&[1, 1, 2]);

        assert_eq!(log.last_index(), LogIndex(3));
        assert_eq!(log.last_term(), Term(2));
        assert_eq!(log.term_at(LogIndex::ZERO), Some(Term::ZERO));
        assert_eq!(log.get(LogIndex(2)).unwrap().term, Term(1));
        assert!(log.get(LogIndex(4)).is_none());
        assert_eq!(store.read_all().unwrap().log.len(), 3);
    }

    #[test]
    fn test_entries_from_is_bounded() {
        let (log, _) = log_with(&[1, 1, 1, 1, 1]);
        let batch = log.entries_from(LogIndex(2), 2, usize::MAX);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].index, LogIndex(2));
        assert!(log.entries_from(LogIndex(6), 10, usize::MAX).is_empty());
        assert!(log.entries_from(LogIndex(9), 10, usize::MAX).is_empty());
    }

    #[test]
    fn test_entries_from_respects_byte_budget() {
        let mut log = RaftLog::open(Box::new(MemoryStore::new())).unwrap();
        for _ in 0..5 {
            log.append_command(Term(1), vec![0; 100]).unwrap();
        }
        let per_entry = entry_wire_len(log.get(LogIndex(1)).unwrap());

        let batch = log.entries_from(LogIndex(1), 100, 2 * per_entry + 1);
        assert_eq!(batch.len(), 2);

        let batch = log.entries_from(LogIndex(3), 100, 3 * per_entry);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[2].index, LogIndex(5));

        // An entry larger than the budget still goes out on its own
        let batch = log.entries_from(LogIndex(4), 100, 10);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].index, LogIndex(4));
    }

    #[test]
    fn test_up_to_date_compares_term_then_index() {
        let (log, _) = log_with(&[1, 2, 2]);
        assert!(log.is_up_to_date(LogIndex(1), Term(3)));
        assert!(log.is_up_to_date(LogIndex(3), Term(2)));
        assert!(!log.is_up_to_date(LogIndex(2), Term(2)));
        assert!(!log.is_up_to_date(LogIndex(10), Term(1)));
    }

    #[test]
    fn test_splice_skips_duplicates() {
        let (mut log, store) = log_with(&[1, 1]);
        log.splice(vec![entry(1, 1), entry(1, 2)], LogIndex::ZERO)
            .unwrap();
        assert_eq!(log.last_index(), LogIndex(2));

        log.splice(vec![entry(1, 2), entry(1, 3)], LogIndex::ZERO)
            .unwrap();
        assert_eq!(log.last_index(), LogIndex(3));
        assert_eq!(store.read_all().unwrap().log.len(), 3);
    }

    #[test]
    fn test_splice_replaces_conflicting_suffix() {
        let (mut log, store) = log_with(&[1, 1, 1, 1]);
        log.splice(vec![entry(1, 2), entry(2, 3)], LogIndex(1))
            .unwrap();

        assert_eq!(log.last_index(), LogIndex(3));
        assert_eq!(log.term_at(LogIndex(3)), Some(Term(2)));
        assert_eq!(store.read_all().unwrap().log, log.persistent_state().log);
    }

    #[test]
    fn test_splice_never_truncates_committed() {
        let (mut log, _) = log_with(&[1, 1, 1]);
        let err = log.splice(vec![entry(2, 2)], LogIndex(2)).unwrap_err();
        assert!(matches!(err, RaftError::Internal(_)));
        assert_eq!(log.last_index(), LogIndex(3));
    }

    #[test]
    fn test_stale_duplicate_does_not_truncate() {
        // An old AppendEntries carrying a prefix must not cut newer entries
        let (mut log, _) = log_with(&[1, 1, 1]);
        log.splice(vec![entry(1, 1)], LogIndex::ZERO).unwrap();
        assert_eq!(log.last_index(), LogIndex(3));
    }

    #[test]
    fn test_term_lookups() {
        let (log, _) = log_with(&[1, 1, 2, 2, 2, 4]);
        assert_eq!(log.first_index_of_term(Term(2), LogIndex(5)), LogIndex(3));
        assert_eq!(log.first_index_of_term(Term(1), LogIndex(2)), LogIndex(1));
        assert_eq!(log.last_index_of_term(Term(2)), Some(LogIndex(5)));
        assert_eq!(log.last_index_of_term(Term(3)), None);
    }

    #[test]
    fn test_term_and_vote_rules() {
        let (mut log, store) = log_with(&[]);
        log.set_term_and_vote(Term(2), Some(NodeId(1))).unwrap();
        assert!(log.set_term_and_vote(Term(2), Some(NodeId(3))).is_err());
        assert!(log.set_term_and_vote(Term(1), None).is_err());

        let state = store.read_all().unwrap();
        assert_eq!(state.current_term, Term(2));
        assert_eq!(state.voted_for, Some(NodeId(1)));
    }

    #[test]
    fn test_failed_write_leaves_memory_untouched() {
        let (mut log, store) = log_with(&[1]);
        store.fail_writes(true);
        assert!(log.append_command(Term(1), b"x".to_vec()).is_err());
        assert!(log.set_term_and_vote(Term(5), None).is_err());
        assert_eq!(log.last_index(), LogIndex(1));
        assert_eq!(log.term(), Term::ZERO);
    }
}

//! Core types used throughout the consensus core

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// Election term number
///
/// Terms are used to detect stale leaders and messages. A node increments
/// its term when it starts an election and adopts any higher term it sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Term({})", self.0)
    }
}

/// Index into the replicated log. The first entry has index 1; index 0 means
/// "before the first entry".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn increment(&mut self) {
        self.0 += 1;
    }

    /// Saturating predecessor; `LogIndex(0).prev()` stays at zero.
    pub fn prev(self) -> LogIndex {
        LogIndex(self.0.saturating_sub(1))
    }

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogIndex({})", self.0)
    }
}

impl std::ops::Add<u64> for LogIndex {
    type Output = LogIndex;

    fn add(self, rhs: u64) -> Self::Output {
        LogIndex(self.0 + rhs)
    }
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// The log index for this entry
    pub index: LogIndex,

    /// The leader's term when this entry was created
    pub term: Term,

    /// Opaque command handed to the command applier once committed
    pub command: Vec<u8>,
}

impl Entry {
    pub fn new(term: Term, index: LogIndex, command: Vec<u8>) -> Self {
        Self {
            index,
            term,
            command,
        }
    }
}

//! Leader-side replication progress and commit index computation

use crate::log::RaftLog;
use crate::types::{LogIndex, NodeId, Term};
use std::collections::BTreeMap;

/// Votes or acknowledgements needed out of `cluster_size` members
pub fn quorum_size(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

/// Replication state of one follower, as tracked by the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Index of the next entry to send
    pub next_index: LogIndex,

    /// Highest index known to be replicated on the follower
    pub match_index: LogIndex,
}

/// Volatile leader state, reinitialized after every election
#[derive(Debug, Clone)]
pub struct ReplicationProgress {
    peers: BTreeMap<NodeId, Progress>,
}

impl ReplicationProgress {
    pub fn new(peers: &[NodeId], last_log_index: LogIndex) -> Self {
        Self {
            peers: peers
                .iter()
                .map(|&id| {
                    (
                        id,
                        Progress {
                            next_index: last_log_index.next(),
                            match_index: LogIndex::ZERO,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn get(&self, peer: NodeId) -> Option<Progress> {
        self.peers.get(&peer).copied()
    }

    /// Record that `peer` holds the leader's log through `match_index`.
    ///
    /// Stale or duplicated acknowledgements never move progress backwards.
    /// Returns true if the match index advanced.
    pub fn on_acknowledge(&mut self, peer: NodeId, match_index: LogIndex) -> bool {
        let Some(progress) = self.peers.get_mut(&peer) else {
            return false;
        };
        if match_index.next() > progress.next_index {
            progress.next_index = match_index.next();
        }
        if match_index > progress.match_index {
            progress.match_index = match_index;
            return true;
        }
        false
    }

    /// Move `next_index` back after a log mismatch, using the follower's hint.
    ///
    /// The result always stays above the known match index, so a stale
    /// rejection can never make the leader skip or resend acknowledged state
    /// below the matched point. Returns true if `next_index` changed.
    pub fn on_reject(
        &mut self,
        peer: NodeId,
        conflict_term: Option<Term>,
        conflict_index: Option<LogIndex>,
        log: &RaftLog,
    ) -> bool {
        let Some(progress) = self.peers.get_mut(&peer) else {
            return false;
        };

        let hinted = match (conflict_term, conflict_index) {
            // Skip the follower's whole conflicting term unless we hold it too,
            // in which case resume right after our last entry of that term.
            (Some(term), Some(index)) => match log.last_index_of_term(term) {
                Some(ours) => ours.next(),
                None => index,
            },
            (None, Some(index)) => index,
            _ => progress.next_index.prev(),
        };

        let next = hinted
            .min(progress.next_index.prev().max(progress.match_index.next()))
            .max(progress.match_index.next())
            .max(LogIndex(1));

        if next != progress.next_index {
            progress.next_index = next;
            return true;
        }
        false
    }

    /// Highest index replicated on a majority, counting the leader's own log
    pub fn quorum_match_index(&self, leader_last_index: LogIndex) -> LogIndex {
        let mut indexes: Vec<LogIndex> = self
            .peers
            .values()
            .map(|p| p.match_index)
            .chain(std::iter::once(leader_last_index))
            .collect();
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        indexes[quorum_size(indexes.len()) - 1]
    }

    /// The new commit index, if it can advance.
    ///
    /// An index only commits by counting replicas when its entry was written
    /// in the leader's current term; earlier-term entries commit indirectly
    /// once a current-term entry above them does.
    pub fn commit_index(
        &self,
        leader_last_index: LogIndex,
        current_term: Term,
        commit_index: LogIndex,
        term_at: impl Fn(LogIndex) -> Option<Term>,
    ) -> Option<LogIndex> {
        let candidate = self.quorum_match_index(leader_last_index);
        if candidate > commit_index && term_at(candidate) == Some(current_term) {
            Some(candidate)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use proptest::prelude::*;

    fn log_with(terms: &[u64]) -> RaftLog {
        let mut log = RaftLog::open(Box::new(MemoryStore::new())).unwrap();
        for &t in terms {
            log.append_command(Term(t), vec![]).unwrap();
        }
        log
    }

    #[test]
    fn test_quorum_size() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(2), 2);
        assert_eq!(quorum_size(3), 2);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(5), 3);
    }

    #[test]
    fn test_initial_progress() {
        let progress = ReplicationProgress::new(&[NodeId(2), NodeId(3)], LogIndex(10));
        let p = progress.get(NodeId(2)).unwrap();
        assert_eq!(p.next_index, LogIndex(11));
        assert_eq!(p.match_index, LogIndex::ZERO);
        assert!(progress.get(NodeId(9)).is_none());
    }

    #[test]
    fn test_acknowledge_is_monotonic() {
        let mut progress = ReplicationProgress::new(&[NodeId(2)], LogIndex(5));
        assert!(progress.on_acknowledge(NodeId(2), LogIndex(5)));
        assert!(!progress.on_acknowledge(NodeId(2), LogIndex(3)));

        let p = progress.get(NodeId(2)).unwrap();
        assert_eq!(p.match_index, LogIndex(5));
        assert_eq!(p.next_index, LogIndex(6));
    }

    #[test]
    fn test_reject_uses_conflict_hints() {
        let log = log_with(&[1, 1, 2, 2, 3, 3]);
        let mut progress = ReplicationProgress::new(&[NodeId(2)], log.last_index());

        // Follower log too short
        assert!(progress.on_reject(NodeId(2), None, Some(LogIndex(3)), &log));
        assert_eq!(progress.get(NodeId(2)).unwrap().next_index, LogIndex(3));

        // Follower has term 2 which we also hold: resume after our last term-2 entry
        let mut progress = ReplicationProgress::new(&[NodeId(2)], log.last_index());
        progress.on_reject(NodeId(2), Some(Term(2)), Some(LogIndex(3)), &log);
        assert_eq!(progress.get(NodeId(2)).unwrap().next_index, LogIndex(5));

        // Follower has a term we never saw: jump to its first index of that term
        let mut progress = ReplicationProgress::new(&[NodeId(2)], log.last_index());
        progress.on_reject(NodeId(2), Some(Term(4)), Some(LogIndex(2)), &log);
        assert_eq!(progress.get(NodeId(2)).unwrap().next_index, LogIndex(2));
    }

    #[test]
    fn test_reject_never_drops_below_match() {
        let log = log_with(&[1, 1, 1, 1]);
        let mut progress = ReplicationProgress::new(&[NodeId(2)], log.last_index());
        progress.on_acknowledge(NodeId(2), LogIndex(3));

        // A stale rejection from before the acknowledgement
        progress.on_reject(NodeId(2), None, Some(LogIndex(1)), &log);
        assert_eq!(progress.get(NodeId(2)).unwrap().next_index, LogIndex(4));
    }

    #[test]
    fn test_reject_without_hint_steps_back_one() {
        let log = log_with(&[1, 1, 1, 1]);
        let mut progress = ReplicationProgress::new(&[NodeId(2)], log.last_index());
        progress.on_reject(NodeId(2), None, None, &log);
        assert_eq!(progress.get(NodeId(2)).unwrap().next_index, LogIndex(4));
        progress.on_reject(NodeId(2), None, None, &log);
        assert_eq!(progress.get(NodeId(2)).unwrap().next_index, LogIndex(3));
    }

    #[test]
    fn test_commit_requires_current_term() {
        let log = log_with(&[1, 1, 2]);
        let mut progress = ReplicationProgress::new(&[NodeId(2), NodeId(3)], log.last_index());
        progress.on_acknowledge(NodeId(2), LogIndex(2));

        // Index 2 is on a majority but was written in term 1
        let term_at = |i| log.term_at(i);
        assert_eq!(
            progress.commit_index(log.last_index(), Term(2), LogIndex::ZERO, term_at),
            None
        );

        progress.on_acknowledge(NodeId(2), LogIndex(3));
        assert_eq!(
            progress.commit_index(log.last_index(), Term(2), LogIndex::ZERO, |i| log.term_at(i)),
            Some(LogIndex(3))
        );
    }

    #[test]
    fn test_single_node_commits_alone() {
        let log = log_with(&[1, 1]);
        let progress = ReplicationProgress::new(&[], log.last_index());
        assert_eq!(
            progress.commit_index(log.last_index(), Term(1), LogIndex::ZERO, |i| log.term_at(i)),
            Some(LogIndex(2))
        );
    }

    proptest! {
        #[test]
        fn quorum_index_is_held_by_a_majority(
            matches in proptest::collection::vec(0u64..50, 0..8),
            leader_last in 0u64..50,
        ) {
            let peers: Vec<NodeId> = (0..matches.len() as u64).map(|i| NodeId(i + 2)).collect();
            let mut progress = ReplicationProgress::new(&peers, LogIndex(leader_last));
            for (peer, m) in peers.iter().zip(&matches) {
                progress.on_acknowledge(*peer, LogIndex(*m));
            }

            let q = progress.quorum_match_index(LogIndex(leader_last));
            let cluster = peers.len() + 1;
            let holding = matches.iter().filter(|&&m| LogIndex(m) >= q).count()
                + usize::from(LogIndex(leader_last) >= q);
            prop_assert!(holding >= quorum_size(cluster));

            // No higher index is held by a majority
            let above = matches.iter().filter(|&&m| LogIndex(m) > q).count()
                + usize::from(LogIndex(leader_last) > q);
            prop_assert!(above < quorum_size(cluster));
        }
    }
}

//! Node role and per-node state

use crate::types::{Entry, LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The role a node can be in. Every node starts as a follower and cycles
/// between roles for its entire lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    /// Follower - accepts log entries from leader
    Follower,
    /// Candidate - attempting to become leader
    Candidate,
    /// Leader - accepts client commands and replicates log
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "Follower"),
            RaftRole::Candidate => write!(f, "Candidate"),
            RaftRole::Leader => write!(f, "Leader"),
        }
    }
}

/// Durable state, as recovered from the persistent store on startup
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistentState {
    /// Latest term this node has seen (initialized to 0, increases monotonically)
    pub current_term: Term,

    /// Candidate that received this node's vote in the current term
    pub voted_for: Option<NodeId>,

    /// The full log, ordered by index starting at 1
    pub log: Vec<Entry>,
}

/// Volatile state on all nodes, rebuilt after a restart
#[derive(Debug, Clone, Default)]
pub struct VolatileState {
    /// Index of highest log entry known to be committed
    pub commit_index: LogIndex,

    /// Index of highest log entry handed to the command applier
    pub last_applied: LogIndex,
}

/// Candidate-specific state
#[derive(Debug, Clone, Default)]
pub struct CandidateState {
    /// Nodes that granted a vote in this election, including self
    pub votes_received: HashSet<NodeId>,

    /// Nodes that answered the vote request (granted or not)
    pub responded: HashSet<NodeId>,
}

impl CandidateState {
    pub fn new(self_id: NodeId) -> Self {
        let mut state = Self::default();
        state.votes_received.insert(self_id);
        state.responded.insert(self_id);
        state
    }

    pub fn record_response(&mut self, node: NodeId, granted: bool) {
        self.responded.insert(node);
        if granted {
            self.votes_received.insert(node);
        }
    }

    pub fn has_majority(&self, cluster_size: usize) -> bool {
        self.votes_received.len() >= crate::replication::quorum_size(cluster_size)
    }
}

/// Role and volatile bookkeeping of a single node. Term and vote live in the
/// durable log; this struct only mirrors what the event loop needs in memory.
#[derive(Debug)]
pub struct NodeState {
    /// Current role of this node
    pub role: RaftRole,

    /// This node's ID
    pub id: NodeId,

    /// Current leader (if known)
    pub leader_id: Option<NodeId>,

    pub volatile: VolatileState,

    /// Candidate-specific state (only valid when role == Candidate)
    pub candidate_state: Option<CandidateState>,

    /// All other nodes in the cluster
    pub peers: Vec<NodeId>,
}

impl NodeState {
    pub fn new(id: NodeId, peers: Vec<NodeId>) -> Self {
        Self {
            role: RaftRole::Follower,
            id,
            leader_id: None,
            volatile: VolatileState::default(),
            candidate_state: None,
            peers: peers.into_iter().filter(|&p| p != id).collect(),
        }
    }

    /// Number of voting members including self
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn become_follower(&mut self, leader: Option<NodeId>) {
        self.role = RaftRole::Follower;
        self.leader_id = leader;
        self.candidate_state = None;
    }

    pub fn become_candidate(&mut self) {
        self.role = RaftRole::Candidate;
        self.leader_id = None;
        self.candidate_state = Some(CandidateState::new(self.id));
    }

    pub fn become_leader(&mut self) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.id);
        self.candidate_state = None;
    }
}

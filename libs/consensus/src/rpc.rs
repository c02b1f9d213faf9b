//! Peer protocol messages

use crate::types::{Entry, LogIndex, NodeId, Term};
use crate::{RaftError, Result};
use serde::{Deserialize, Serialize};

/// RequestVote - sent by candidates to gather votes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term
    pub term: Term,

    /// Candidate requesting vote
    pub candidate_id: NodeId,

    /// Index of candidate's last log entry
    pub last_log_index: LogIndex,

    /// Term of candidate's last log entry
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Voter's current term, for the candidate to update itself
    pub term: Term,

    /// True if the candidate received the vote
    pub vote_granted: bool,
}

/// AppendEntries - sent by the leader to replicate log entries and as heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,

    /// So followers can redirect clients
    pub leader_id: NodeId,

    /// Index of log entry immediately preceding new ones
    pub prev_log_index: LogIndex,

    /// Term of prev_log_index entry
    pub prev_log_term: Term,

    /// Log entries to store (empty for heartbeat)
    pub entries: Vec<Entry>,

    /// Leader's commit index
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    /// Create a heartbeat message (no entries)
    pub fn heartbeat(
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        leader_commit: LogIndex,
    ) -> Self {
        Self {
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            entries: vec![],
            leader_commit,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the last entry covered by this request
    pub fn last_index(&self) -> LogIndex {
        self.prev_log_index + self.entries.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Follower's current term, for the leader to update itself
    pub term: Term,

    /// True if follower contained entry matching prev_log_index and prev_log_term
    pub success: bool,

    /// On success, the highest index known to match the leader's log.
    /// Carried so duplicated or reordered responses stay idempotent.
    pub match_index: LogIndex,

    /// On mismatch, the term of the follower's conflicting entry at
    /// prev_log_index (None if the follower's log is too short)
    pub conflict_term: Option<Term>,

    /// On mismatch, the first index the leader should try next
    pub conflict_index: Option<LogIndex>,
}

impl AppendEntriesResponse {
    pub fn accepted(term: Term, match_index: LogIndex) -> Self {
        Self {
            term,
            success: true,
            match_index,
            conflict_term: None,
            conflict_index: None,
        }
    }

    pub fn rejected(term: Term) -> Self {
        Self {
            term,
            success: false,
            match_index: LogIndex::ZERO,
            conflict_term: None,
            conflict_index: None,
        }
    }

    pub fn conflict(term: Term, conflict_term: Option<Term>, conflict_index: LogIndex) -> Self {
        Self {
            term,
            success: false,
            match_index: LogIndex::ZERO,
            conflict_term,
            conflict_index: Some(conflict_index),
        }
    }
}

/// Every message exchanged between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    RequestVote(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
}

impl Message {
    /// The sender's term carried by every message
    pub fn term(&self) -> Term {
        match self {
            Message::RequestVote(m) => m.term,
            Message::RequestVoteResponse(m) => m.term,
            Message::AppendEntries(m) => m.term,
            Message::AppendEntriesResponse(m) => m.term,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::RequestVote(_) => "RequestVote",
            Message::RequestVoteResponse(_) => "RequestVoteResponse",
            Message::AppendEntries(_) => "AppendEntries",
            Message::AppendEntriesResponse(_) => "AppendEntriesResponse",
        }
    }
}

/// Encoded size of an entry beyond its command: index, term and the
/// command's length prefix
const ENTRY_OVERHEAD: usize = 24;

/// Upper bound on an encoded AppendEntries envelope with no entries
const APPEND_ENTRIES_OVERHEAD: usize = 128;

/// Bytes `entry` adds to an encoded AppendEntries message
pub fn entry_wire_len(entry: &Entry) -> usize {
    ENTRY_OVERHEAD + entry.command.len()
}

/// Entry bytes one AppendEntries may carry within `max_frame_bytes`
pub fn append_entries_budget(max_frame_bytes: usize) -> usize {
    max_frame_bytes.saturating_sub(APPEND_ENTRIES_OVERHEAD)
}

/// Largest command that fits in a frame on its own
pub fn max_command_len(max_frame_bytes: usize) -> usize {
    append_entries_budget(max_frame_bytes).saturating_sub(ENTRY_OVERHEAD)
}

/// A routed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: Message,
}

impl Envelope {
    pub fn new(from: NodeId, to: NodeId, message: Message) -> Self {
        Self { from, to, message }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| RaftError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| RaftError::Codec(e.to_string()))
    }
}

//! Single-leader replicated log consensus core
//!
//! A cluster of nodes agrees on one ordered log of opaque commands. One node
//! is elected leader per term, accepts commands, and replicates them; an
//! entry is committed once a majority holds it, after which every node hands
//! it to its [`CommandApplier`] in index order.
//!
//! # Features
//!
//! - Leader election with randomized timeouts
//! - Log replication with conflict hints for fast follower catch-up
//! - Commit only through entries of the leader's current term
//! - Durable term, vote and log through a pluggable [`PersistentStore`]
//! - In-memory network with fault injection, and a TCP transport
//!
//! # Example
//!
//! ```no_run
//! use quorum_consensus::{
//!     ClusterConfig, CommandApplier, InMemoryNetwork, LogIndex, MemoryStore, NodeId, RaftNode,
//! };
//!
//! struct Printer;
//!
//! impl CommandApplier for Printer {
//!     fn apply(&mut self, index: LogIndex, command: &[u8]) {
//!         println!("{} -> {:?}", index, command);
//!     }
//! }
//!
//! # async fn example() -> quorum_consensus::Result<()> {
//! let members = [NodeId(1), NodeId(2), NodeId(3)];
//! let network = InMemoryNetwork::new();
//!
//! for &id in &members {
//!     let cluster = ClusterConfig::new(id, &members);
//!     let node = RaftNode::start(
//!         &cluster,
//!         Box::new(MemoryStore::new()),
//!         network.transport(id),
//!         Printer,
//!     )?;
//!     network.connect(node);
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod log;
mod node;
mod replication;
mod rpc;
mod state;
mod storage;
mod timer;
mod transport;
mod types;

pub use config::{ClusterConfig, RaftConfig, RaftConfigBuilder};
pub use log::RaftLog;
pub use node::{CommandApplier, NodeStatus, RaftNode, SubmitOutcome};
pub use replication::{quorum_size, Progress, ReplicationProgress};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, Envelope, Message, RequestVoteRequest,
    RequestVoteResponse,
};
pub use state::{PersistentState, RaftRole};
pub use storage::{FileStore, MemoryStore, PersistentStore};
pub use timer::random_election_timeout;
pub use transport::{InMemoryNetwork, TcpTransport, Transport};
pub use types::{Entry, LogIndex, NodeId, Term};

/// Result type for consensus operations
pub type Result<T> = std::result::Result<T, RaftError>;

/// Errors that can occur in the consensus core
///
/// Protocol-level rejections (stale terms, log mismatches) never surface
/// here; they are answered on the wire and recovered by retry.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("Not the leader (current leader: {0:?})")]
    NotLeader(Option<NodeId>),

    #[error("Node is shutting down")]
    ShuttingDown,

    /// Empty, or too large to replicate in one frame
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// The node stopped after its durable state could not be written
    #[error("Node halted: {0}")]
    Halted(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

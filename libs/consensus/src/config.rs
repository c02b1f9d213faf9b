//! Node and cluster configuration

use crate::rpc::{append_entries_budget, max_command_len};
use crate::types::NodeId;
use crate::{RaftError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a consensus node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Minimum election timeout
    ///
    /// This is the minimum time a follower waits before starting an election.
    /// The actual timeout is drawn uniformly from `[min, max]` on every reset
    /// to avoid split votes.
    pub election_timeout_min: Duration,

    /// Maximum election timeout
    pub election_timeout_max: Duration,

    /// Heartbeat interval (how often the leader sends AppendEntries)
    ///
    /// Must be well below the election timeout so followers do not time out.
    /// Candidates use the same interval to resend unanswered vote requests.
    pub heartbeat_interval: Duration,

    /// Maximum number of entries to send in a single AppendEntries message
    pub max_append_entries: usize,

    /// Capacity of each per-peer outbound queue in network transports.
    /// Sends to a full queue are dropped.
    pub outbound_queue_depth: usize,

    /// Largest frame the TCP transport will accept. AppendEntries batches
    /// and submitted commands are sized to fit.
    pub max_frame_bytes: usize,

    /// Initial delay before reconnecting to an unreachable peer
    pub reconnect_backoff_min: Duration,

    /// Upper bound on the reconnect delay
    pub reconnect_backoff_max: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            // T = 150ms, drawn from [T, 2T]
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),

            // T / 3, comfortably below the election timeout minimum
            heartbeat_interval: Duration::from_millis(50),

            max_append_entries: 100,

            outbound_queue_depth: 1024,

            // 16MB
            max_frame_bytes: 16 * 1024 * 1024,

            reconnect_backoff_min: Duration::from_millis(50),
            reconnect_backoff_max: Duration::from_secs(2),
        }
    }
}

impl RaftConfig {
    pub fn builder() -> RaftConfigBuilder {
        RaftConfigBuilder::new()
    }

    /// Check the timing and sizing invariants the node relies on
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(RaftError::Config(
                "election_timeout_min must be less than election_timeout_max".into(),
            ));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::Config(
                "heartbeat_interval must be less than election_timeout_min".into(),
            ));
        }
        if self.max_append_entries == 0 {
            return Err(RaftError::Config(
                "max_append_entries must be greater than 0".into(),
            ));
        }
        if self.max_command_bytes() == 0 {
            return Err(RaftError::Config(
                "max_frame_bytes is too small to carry any command".into(),
            ));
        }
        if self.outbound_queue_depth == 0 {
            return Err(RaftError::Config(
                "outbound_queue_depth must be greater than 0".into(),
            ));
        }
        if self.reconnect_backoff_min > self.reconnect_backoff_max {
            return Err(RaftError::Config(
                "reconnect_backoff_min must not exceed reconnect_backoff_max".into(),
            ));
        }
        Ok(())
    }

    /// Entry bytes one AppendEntries may carry
    pub fn max_batch_bytes(&self) -> usize {
        append_entries_budget(self.max_frame_bytes)
    }

    /// Largest command `submit_command` accepts
    pub fn max_command_bytes(&self) -> usize {
        max_command_len(self.max_frame_bytes)
    }
}

/// Builder for RaftConfig
pub struct RaftConfigBuilder {
    config: RaftConfig,
}

impl RaftConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RaftConfig::default(),
        }
    }

    pub fn election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.config.election_timeout_min = min;
        self.config.election_timeout_max = max;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn max_append_entries(mut self, max: usize) -> Self {
        self.config.max_append_entries = max;
        self
    }

    pub fn outbound_queue_depth(mut self, depth: usize) -> Self {
        self.config.outbound_queue_depth = depth;
        self
    }

    pub fn max_frame_bytes(mut self, max: usize) -> Self {
        self.config.max_frame_bytes = max;
        self
    }

    pub fn reconnect_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.config.reconnect_backoff_min = min;
        self.config.reconnect_backoff_max = max;
        self
    }

    pub fn build(self) -> Result<RaftConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for RaftConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Static cluster membership as seen from one node
///
/// Membership is fixed at startup. `peers` maps every *other* node to the
/// address its transport listens on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub node_id: NodeId,

    #[serde(default)]
    pub listen_addr: Option<String>,

    #[serde(default)]
    pub peers: BTreeMap<NodeId, String>,

    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub raft: RaftConfig,
}

impl ClusterConfig {
    /// Membership without network addresses, for in-process clusters
    pub fn new(node_id: NodeId, members: &[NodeId]) -> Self {
        Self {
            node_id,
            listen_addr: None,
            peers: members
                .iter()
                .filter(|&&id| id != node_id)
                .map(|&id| (id, String::new()))
                .collect(),
            data_dir: None,
            raft: RaftConfig::default(),
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: ClusterConfig =
            serde_json::from_str(&raw).map_err(|e| RaftError::Codec(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.peers.contains_key(&self.node_id) {
            return Err(RaftError::Config(format!(
                "{} must not list itself as a peer",
                self.node_id
            )));
        }
        self.raft.validate()
    }

    /// Ids of the other members
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }

    /// Number of voting members including this node
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }
}

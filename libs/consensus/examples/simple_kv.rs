//! Simple replicated key-value store
//!
//! Three nodes run in one process over the in-memory network. Commands are
//! submitted to whichever node is leader, and every node applies them to its
//! own copy of the map.
//!
//! Run with: cargo run --example simple_kv

use anyhow::{bail, Context};
use parking_lot::Mutex;
use quorum_consensus::{
    ClusterConfig, CommandApplier, InMemoryNetwork, LogIndex, MemoryStore, NodeId, RaftNode,
    RaftRole,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
enum Command {
    Set { key: String, value: String },
    Delete { key: String },
}

/// Key-value map shared with `main` so it can print the result
#[derive(Clone, Default)]
struct KvStore {
    data: Arc<Mutex<BTreeMap<String, String>>>,
    last_applied: Arc<Mutex<LogIndex>>,
}

impl CommandApplier for KvStore {
    fn apply(&mut self, index: LogIndex, command: &[u8]) {
        let mut last = self.last_applied.lock();
        if index <= *last {
            return;
        }
        *last = index;

        match serde_json::from_slice::<Command>(command) {
            Ok(Command::Set { key, value }) => {
                self.data.lock().insert(key, value);
            }
            Ok(Command::Delete { key }) => {
                self.data.lock().remove(&key);
            }
            Err(e) => tracing::warn!(%index, error = %e, "Skipping malformed command"),
        }
    }
}

async fn wait_for_leader(nodes: &[RaftNode]) -> anyhow::Result<RaftNode> {
    for _ in 0..100 {
        if let Some(leader) = nodes.iter().find(|n| n.status().role == RaftRole::Leader) {
            return Ok(leader.clone());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    bail!("no leader elected within 5s")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let members = [NodeId(1), NodeId(2), NodeId(3)];
    let network = InMemoryNetwork::new();
    let mut nodes = Vec::new();
    let mut stores = Vec::new();

    for &id in &members {
        let kv = KvStore::default();
        let node = RaftNode::start(
            &ClusterConfig::new(id, &members),
            Box::new(MemoryStore::new()),
            network.transport(id),
            kv.clone(),
        )?;
        network.connect(node.clone());
        nodes.push(node);
        stores.push(kv);
    }

    let leader = wait_for_leader(&nodes).await?;
    println!("Leader is {} at {}", leader.id(), leader.status().term);

    let commands = [
        Command::Set {
            key: "username".into(),
            value: "alice".into(),
        },
        Command::Set {
            key: "role".into(),
            value: "admin".into(),
        },
        Command::Delete {
            key: "username".into(),
        },
    ];

    let mut last = LogIndex::ZERO;
    for command in &commands {
        let outcome = leader.submit_command(serde_json::to_vec(command)?).await?;
        last = outcome.into_index().context("leader changed during demo")?;
        println!("Submitted {:?} at {}", command, last);
    }

    for node in &nodes {
        tokio::time::timeout(Duration::from_secs(5), node.wait_for_commit(last))
            .await
            .context("commit timed out")??;
    }

    for (node, kv) in nodes.iter().zip(&stores) {
        let status = node.status();
        println!(
            "{} ({}) commit={} state={:?}",
            status.id,
            status.role,
            status.commit_index,
            kv.data.lock()
        );
    }

    for node in &nodes {
        node.shutdown();
        node.stopped().await;
    }
    Ok(())
}

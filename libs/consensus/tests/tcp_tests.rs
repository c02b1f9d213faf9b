//! A real cluster: TCP between nodes, file-backed storage.


use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use quorum_consensus::{
    ClusterConfig, FileStore, LogIndex, NodeId, PersistentStore, RaftNode, RaftRole, TcpTransport,
};
use tempfile::TempDir;
use test_harness::{init_tracing, Recorder};
use tokio::net::TcpListener;

struct TcpNode {
    node: RaftNode,
    transport: Arc<TcpTransport>,
    recorder: Recorder,
    dir: TempDir,
}

async fn start_cluster(members: &[NodeId]) -> Vec<TcpNode> {
    let mut listeners = Vec::new();
    let mut addrs = BTreeMap::new();
    for &id in members {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        addrs.insert(id, listener.local_addr().unwrap().to_string());
        listeners.push(listener);
    }

    let mut nodes = Vec::new();
    for (&id, listener) in members.iter().zip(listeners) {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = ClusterConfig::new(id, members);
        cluster.listen_addr = Some(addrs[&id].clone());
        cluster.peers = addrs
            .iter()
            .filter(|(peer, _)| **peer != id)
            .map(|(peer, addr)| (*peer, addr.clone()))
            .collect();
        cluster.data_dir = Some(dir.path().to_path_buf());

        let transport = TcpTransport::connect(id, &cluster.peers, &cluster.raft);
        let recorder = Recorder::default();
        let node = RaftNode::start(
            &cluster,
            Box::new(FileStore::open(dir.path()).unwrap()),
            transport.clone(),
            recorder.clone(),
        )
        .unwrap();
        transport.serve(listener, node.clone());

        nodes.push(TcpNode {
            node,
            transport,
            recorder,
            dir,
        });
    }
    nodes
}

const COMMANDS: [&str; 3] = ["set a 1", "set b 2", "del a"];

/// Submit to whichever node currently leads, retrying across elections
async fn submit(nodes: &[TcpNode], command: &[u8]) -> LogIndex {
    for _ in 0..500 {
        if let Some(leader) = nodes
            .iter()
            .find(|n| n.node.status().role == RaftRole::Leader)
        {
            if let Ok(index) = leader
                .node
                .submit_command(command.to_vec())
                .await
                .and_then(|outcome| outcome.into_index())
            {
                return index;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no leader accepted the command over TCP");
}

#[tokio::test]
async fn test_tcp_cluster_replicates_to_disk() {
    init_tracing();
    let members = [NodeId(1), NodeId(2), NodeId(3)];
    let nodes = start_cluster(&members).await;

    let mut last = LogIndex::ZERO;
    for command in COMMANDS {
        last = submit(&nodes, command.as_bytes()).await;
    }

    for n in &nodes {
        tokio::time::timeout(Duration::from_secs(10), n.node.wait_for_commit(last))
            .await
            .expect("commit should reach every node")
            .unwrap();
    }

    let mut dirs = Vec::new();
    for n in nodes {
        n.node.shutdown();
        n.node.stopped().await;
        n.transport.close();
        let applied: Vec<Vec<u8>> = n
            .recorder
            .applied()
            .into_iter()
            .filter(|(index, _)| *index <= last)
            .map(|(_, command)| command)
            .collect();
        let expected: Vec<Vec<u8>> = COMMANDS.iter().map(|c| c.as_bytes().to_vec()).collect();
        assert_eq!(applied, expected);
        dirs.push(n.dir);
    }

    // Everything committed is on disk and reads back identically everywhere
    let states: Vec<_> = dirs
        .iter()
        .map(|dir| FileStore::open(dir.path()).unwrap().read_all().unwrap())
        .collect();
    let committed = last.0 as usize;
    for state in &states {
        assert!(state.log.len() >= committed);
        let commands: Vec<&[u8]> = state.log[..committed]
            .iter()
            .map(|e| e.command.as_slice())
            .filter(|c| !c.is_empty())
            .collect();
        let expected: Vec<&[u8]> = COMMANDS.iter().map(|c| c.as_bytes()).collect();
        assert_eq!(commands, expected);
    }
    assert!(states
        .iter()
        .all(|s| s.log[..committed] == states[0].log[..committed]));
}

//! The three-node walkthrough: commit with one follower, lose the leader,
//! and check that only the follower holding the entry can take over.


use std::time::Duration;

use quorum_consensus::{
    LogIndex, NodeId, PersistentStore, RaftConfig, RaftRole, SubmitOutcome, Term,
};
use test_harness::TestCluster;

const A: NodeId = NodeId(1);
const B: NodeId = NodeId(2);
const C: NodeId = NodeId(3);

/// A times out long before B and C, so it wins the first election
fn a_first(id: NodeId) -> RaftConfig {
    let builder = RaftConfig::builder().heartbeat_interval(Duration::from_millis(50));
    let builder = if id == A {
        builder.election_timeout(Duration::from_millis(100), Duration::from_millis(120))
    } else {
        builder.election_timeout(Duration::from_millis(300), Duration::from_millis(600))
    };
    builder.build().expect("valid config")
}

#[tokio::test(start_paused = true)]
async fn test_entry_holder_wins_after_leader_crash() {
    let mut cluster = TestCluster::with_configs(3, a_first);

    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("a leader should be elected");
    assert_eq!(leader, A);
    assert_eq!(cluster.node(A).status().term, Term(1));

    // C never hears about "x"
    cluster.network.block(A, C);

    let outcome = cluster
        .node(A)
        .submit_command(b"x".to_vec())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        SubmitOutcome::Accepted {
            index: LogIndex(1),
            term: Term(1)
        }
    );

    assert!(cluster
        .wait_for_commit(&[A], LogIndex(1), Duration::from_secs(1))
        .await);
    assert_eq!(
        cluster.recorder(A).applied(),
        vec![(LogIndex(1), b"x".to_vec())]
    );
    assert_eq!(cluster.stores[&B].read_all().unwrap().log.len(), 1);
    assert!(cluster.stores[&C].read_all().unwrap().log.is_empty());

    let crashed = cluster.crash(A).await;
    assert_eq!(crashed.recorder.count_at(LogIndex(1)), 1);

    let new_leader = cluster
        .wait_for_leader(Duration::from_secs(10))
        .await
        .expect("B should take over");
    assert_eq!(new_leader, B);
    assert!(cluster.leader_terms(C).is_empty(), "C must never lead");

    // "x" is from an older term; it commits beneath an entry of B's own
    let index = cluster
        .submit(b"y", Duration::from_secs(5))
        .await
        .expect("B should commit");
    assert!(index > LogIndex(1));
    assert!(cluster
        .wait_for_commit(&[B, C], index, Duration::from_secs(5))
        .await);
    assert_eq!(
        cluster.recorder(C).applied(),
        vec![(LogIndex(1), b"x".to_vec()), (index, b"y".to_vec())]
    );

    cluster.assert_election_safety();
    cluster.assert_log_matching();
    cluster.assert_state_machine_safety();
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_follower_redirects_to_leader() {
    let cluster = TestCluster::with_configs(3, a_first);
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("a leader should be elected");

    // Let a heartbeat tell the followers who leads
    tokio::time::sleep(Duration::from_millis(100)).await;

    let outcome = cluster.node(B).submit_command(b"x".to_vec()).await.unwrap();
    assert_eq!(outcome, SubmitOutcome::Rejected { leader_hint: Some(A) });
    assert!(!outcome.is_accepted());

    let status = cluster.node(B).status();
    assert_eq!(status.role, RaftRole::Follower);
    assert_eq!(status.leader_id, Some(A));
    assert_eq!(status.term, Term(1));
    assert_eq!(status.voted_for, Some(A));

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_commit_notifications_reach_followers() {
    let cluster = TestCluster::with_configs(3, a_first);
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("a leader should be elected");

    let mut commits = cluster.node(C).subscribe_commits();
    for command in ["a", "b", "c"] {
        cluster
            .submit(command.as_bytes(), Duration::from_secs(5))
            .await
            .expect("command should commit");
    }

    tokio::time::timeout(
        Duration::from_secs(5),
        commits.wait_for(|&index| index >= LogIndex(3)),
    )
    .await
    .expect("follower commit should advance")
    .unwrap();

    let status = cluster.node(C).status();
    assert_eq!(status.commit_index, LogIndex(3));
    assert_eq!(status.last_applied, LogIndex(3));
    assert_eq!(status.last_log_index, LogIndex(3));

    cluster.assert_state_machine_safety();
    cluster.shutdown().await;
}

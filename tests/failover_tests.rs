//! Failover tests for Raft leader failure and recovery.
//!
//! These tests verify cluster behavior when leaders fail, including
//! new leader election, log persistence, and client request handling.


use std::time::Duration;

use queue_raft::error::RaftError;
use queue_raft::raft::RaftRole;
use test_harness::{assert_eventually, TestCluster};

/// Test 1: New leader is elected after leader shutdown
#[tokio::test]
async fn test_new_leader_election_after_shutdown() {
    let mut cluster = TestCluster::new(3).await;

    let initial_leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");
    let initial_term = cluster.get_node(initial_leader).unwrap().current_term();

    assert!(
        cluster.shutdown_node(initial_leader).await,
        "Should successfully shutdown leader"
    );

    let new_leader = cluster
        .wait_for_new_leader(initial_leader, Duration::from_secs(5))
        .await
        .expect("New leader should be elected");

    assert_ne!(new_leader, initial_leader);

    // Election increments term
    let new_term = cluster.get_node(new_leader).unwrap().current_term();
    assert!(new_term > initial_term, "Term should increase after new election");

    assert_eq!(cluster.count_leaders(), 1, "Exactly one leader should exist");

    cluster.shutdown().await;
}

/// Test 2: Followers learn the new leader after the old one fails
#[tokio::test]
async fn test_followers_learn_new_leader() {
    let mut cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    cluster.shutdown_node(leader_id).await;

    let new_leader = cluster
        .wait_for_new_leader(leader_id, Duration::from_secs(5))
        .await
        .expect("New leader should be elected");

    let follower_id = cluster
        .active_node_ids()
        .into_iter()
        .find(|&id| id != new_leader)
        .expect("Should have a follower");

    assert_eventually(
        || async {
            let node = cluster.get_node(follower_id).unwrap();
            node.leader_id() == Some(new_leader) && node.status().role == RaftRole::Follower
        },
        Duration::from_secs(2),
        "Follower should point at the new leader",
    )
    .await;

    cluster.shutdown().await;
}

/// Test 3: Committed entries survive a leader change
#[tokio::test]
async fn test_log_persists_across_leader_change() {
    let mut cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    let last = cluster
        .submit_many("before", 3)
        .await
        .expect("Commands should commit");
    assert!(cluster
        .wait_for_applied_on_all(last, Duration::from_secs(2))
        .await);

    cluster.shutdown_node(leader_id).await;
    let new_leader = cluster
        .wait_for_new_leader(leader_id, Duration::from_secs(5))
        .await
        .expect("New leader should be elected");

    let index = cluster
        .submit_to_node(new_leader, b"after")
        .await
        .expect("New leader should accept commands");
    assert!(index > last);

    let commands = cluster.get_node(new_leader).unwrap().applied_commands();
    assert_eq!(
        commands,
        vec![
            b"before-0".to_vec(),
            b"before-1".to_vec(),
            b"before-2".to_vec(),
            b"after".to_vec(),
        ]
    );

    cluster.shutdown().await;
}

/// Test 4: A five-node cluster tolerates two sequential leader failures
#[tokio::test]
async fn test_multiple_sequential_failures() {
    let mut cluster = TestCluster::new(5).await;

    let first = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    cluster.submit(b"one").await.expect("Should commit");

    cluster.shutdown_node(first).await;
    let second = cluster
        .wait_for_new_leader(first, Duration::from_secs(5))
        .await
        .expect("Second leader should be elected");
    cluster.submit(b"two").await.expect("Should commit");

    cluster.shutdown_node(second).await;
    let third = cluster
        .wait_for_new_leader(second, Duration::from_secs(5))
        .await
        .expect("Third leader should be elected with 3 of 5 nodes");
    let index = cluster.submit(b"three").await.expect("Should commit");

    assert!(cluster
        .wait_for_applied_on_all(index, Duration::from_secs(2))
        .await);
    assert_eq!(
        cluster.get_node(third).unwrap().applied_commands(),
        vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
    );
    assert!(cluster.verify_applied_consistency());

    cluster.shutdown().await;
}

/// Test 5: A lost quorum blocks commits
#[tokio::test]
async fn test_quorum_loss_prevents_commits() {
    let mut cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let commit_before = cluster.get_node(leader_id).unwrap().status().commit_index;

    for follower in cluster.active_node_ids() {
        if follower != leader_id {
            cluster.shutdown_node(follower).await;
        }
    }

    let result = cluster.submit_to_node(leader_id, b"unreplicated").await;
    assert!(
        matches!(result, Err(RaftError::Timeout)),
        "Commit without a majority must not succeed, got {result:?}"
    );
    assert_eq!(
        cluster.get_node(leader_id).unwrap().status().commit_index,
        commit_before
    );
    assert!(cluster.get_node(leader_id).unwrap().applied_commands().is_empty());

    cluster.shutdown().await;
}

/// Test 6: Terms only grow and each term has at most one leader
#[tokio::test]
async fn test_election_safety_across_failures() {
    let mut cluster = TestCluster::new(3).await;

    let mut last_term = 0;
    for _ in 0..3 {
        let leader_id = cluster
            .wait_for_leader(Duration::from_secs(5))
            .await
            .expect("Leader should be elected");
        let term = cluster.get_node(leader_id).unwrap().current_term();
        assert!(term > last_term, "Each new leader should have a higher term");
        last_term = term;

        for (term, leaders) in cluster.leaders_by_term() {
            assert!(leaders <= 1, "Term {term} has {leaders} leaders");
        }

        cluster.restart_node(leader_id).await;
        // The restarted node may win again; wait for any leader in a newer term
        assert_eventually(
            || async {
                cluster
                    .get_leader_id()
                    .and_then(|id| cluster.get_node(id))
                    .map(|node| node.current_term() > last_term)
                    .unwrap_or(false)
            },
            Duration::from_secs(5),
            "A leader in a newer term should be elected",
        )
        .await;
    }

    cluster.shutdown().await;
}

/// Test 7: campaign() lets a follower take over leadership
#[tokio::test]
async fn test_campaign_moves_leadership() {
    let mut cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let index = cluster.submit(b"x").await.expect("Should commit");
    assert!(cluster
        .wait_for_applied_on_all(index, Duration::from_secs(2))
        .await);

    let challenger = cluster
        .active_node_ids()
        .into_iter()
        .find(|&id| id != leader_id)
        .unwrap();
    cluster
        .get_node(challenger)
        .unwrap()
        .handle
        .campaign()
        .await
        .expect("Node should accept the election trigger");

    assert_eventually(
        || async { cluster.get_node(challenger).unwrap().is_leader() },
        Duration::from_secs(2),
        "Up-to-date follower should win the election it started",
    )
    .await;

    assert_eventually(
        || async { !cluster.get_node(leader_id).unwrap().is_leader() },
        Duration::from_secs(2),
        "Old leader should step down",
    )
    .await;

    cluster.shutdown().await;
}

/// Test 8: Pending submissions fail with LeadershipLost when the leader steps down
#[tokio::test]
async fn test_stepping_down_fails_pending_commands() {
    let mut cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    cluster.isolate_node(leader_id).await;

    let stale = cluster.get_node(leader_id).unwrap().handle.clone();
    let pending = tokio::spawn(async move { stale.submit(b"orphan".to_vec()).await });

    cluster
        .wait_for_new_leader(leader_id, Duration::from_secs(5))
        .await
        .expect("Majority should elect a new leader");
    cluster.heal_node(leader_id).await;

    let result = pending.await.expect("Submit task should not panic");
    assert!(
        matches!(result, Err(RaftError::LeadershipLost) | Err(RaftError::Timeout)),
        "Orphaned command must not report success, got {result:?}"
    );

    cluster.shutdown().await;
}

//! Log replication tests.
//!
//! These tests verify that committed commands reach every node in the same
//! order and that restarted followers resynchronize from the leader.


use std::time::Duration;

use test_harness::{assert_eventually, is_follower_at, TestCluster};

/// Test 1: Commands submitted to the leader are applied everywhere in order
#[tokio::test]
async fn test_commands_replicate_to_all_nodes() {
    let mut cluster = TestCluster::new(3).await;

    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    let last = cluster
        .submit_many("cmd", 5)
        .await
        .expect("Commands should commit");
    assert!(
        cluster
            .wait_for_applied_on_all(last, Duration::from_secs(2))
            .await,
        "All nodes should apply every command"
    );

    let expected: Vec<Vec<u8>> = (0..5).map(|i| format!("cmd-{i}").into_bytes()).collect();
    for node_id in cluster.active_node_ids() {
        assert_eq!(
            cluster.get_node(node_id).unwrap().applied_commands(),
            expected,
            "Node {node_id} applied a different sequence"
        );
    }

    cluster.shutdown().await;
}

/// Test 2: Returned indices are strictly increasing and follow the leader no-op
#[tokio::test]
async fn test_submit_returns_increasing_indices() {
    let mut cluster = TestCluster::new(3).await;

    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    let mut previous = cluster.submit(b"first").await.expect("Should commit");
    // At least the leader's no-op precedes it
    assert!(previous >= 2);
    for i in 0..5 {
        let index = cluster
            .submit(format!("n-{i}").as_bytes())
            .await
            .expect("Should commit");
        assert_eq!(index, previous + 1);
        previous = index;
    }

    cluster.shutdown().await;
}

/// Test 3: A crashed follower is resynced on restart without re-applying
#[tokio::test]
async fn test_restarted_follower_resyncs_without_reapplying() {
    let mut cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    let last = cluster.submit_many("early", 5).await.expect("Should commit");
    assert!(cluster
        .wait_for_applied_on_all(last, Duration::from_secs(2))
        .await);

    let follower_id = cluster
        .active_node_ids()
        .into_iter()
        .find(|&id| id != leader_id)
        .unwrap();
    cluster.shutdown_node(follower_id).await;

    // Two remaining nodes still form a majority
    let last = cluster.submit_many("late", 3).await.expect("Should commit");

    cluster.restart_node(follower_id).await;
    assert_eventually(
        || async { is_follower_at(&cluster.get_node(follower_id).unwrap().status(), last) },
        Duration::from_secs(3),
        "Restarted follower should catch up",
    )
    .await;

    let leader = cluster.get_node(leader_id).unwrap();
    let follower = cluster.get_node(follower_id).unwrap();
    assert_eq!(follower.applied_commands(), leader.applied_commands());
    assert_eq!(follower.status().last_log_index, leader.status().last_log_index);
    assert_eq!(follower.status().last_log_term, leader.status().last_log_term);
    assert_eq!(
        follower.machine.apply_calls(),
        8,
        "Each command should be applied exactly once across the restart"
    );

    cluster.shutdown().await;
}

/// Test 4: A restarted leader keeps its term and applied state
#[tokio::test]
async fn test_restarted_node_recovers_term_and_state() {
    let mut cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let last = cluster.submit_many("x", 3).await.expect("Should commit");
    assert!(cluster
        .wait_for_applied_on_all(last, Duration::from_secs(2))
        .await);

    let follower_id = cluster
        .active_node_ids()
        .into_iter()
        .find(|&id| id != leader_id)
        .unwrap();
    let term_before = cluster.get_node(follower_id).unwrap().current_term();

    cluster.restart_node(follower_id).await;

    let status = cluster.get_node(follower_id).unwrap().status();
    assert!(status.current_term >= term_before);
    assert_eq!(status.last_applied, last);
    assert!(status.last_log_index >= last);

    cluster.shutdown().await;
}

/// Test 5: Commit notifications are published through the watch channel
#[tokio::test]
async fn test_subscribe_commits_reports_progress() {
    let mut cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let follower_id = cluster
        .active_node_ids()
        .into_iter()
        .find(|&id| id != leader_id)
        .unwrap();
    let mut commits = cluster
        .get_node(follower_id)
        .unwrap()
        .handle
        .subscribe_commits();

    let index = cluster.submit(b"watched").await.expect("Should commit");

    tokio::time::timeout(Duration::from_secs(2), commits.wait_for(|&applied| applied >= index))
        .await
        .expect("Follower should report the commit in time")
        .expect("Watch channel should stay open");

    cluster.shutdown().await;
}

/// Test 6: Concurrent submissions all commit and every node agrees on order
#[tokio::test]
async fn test_concurrent_submissions_agree_on_order() {
    let mut cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let handle = cluster.get_node(leader_id).unwrap().handle.clone();

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let handle = handle.clone();
            tokio::spawn(async move { handle.submit(format!("c-{i}").into_bytes()).await })
        })
        .collect();

    let mut indices = Vec::new();
    for task in tasks {
        indices.push(task.await.unwrap().expect("Should commit"));
    }
    indices.sort_unstable();
    indices.dedup();
    assert_eq!(indices.len(), 20, "Every command gets its own index");

    let last = *indices.last().unwrap();
    assert!(cluster
        .wait_for_applied_on_all(last, Duration::from_secs(2))
        .await);
    assert!(cluster.verify_applied_consistency());
    assert_eq!(
        cluster.get_node(leader_id).unwrap().applied_commands().len(),
        20
    );

    cluster.shutdown().await;
}

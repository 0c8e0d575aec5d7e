//! Integration tests for leader election over an in-process network.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use tokio::time::{sleep, Instant};

use common::{seeded_log, TestCluster, POLL};
use replicated_kv::Role;

#[tokio::test]
async fn test_integration_basic_election() -> Result<()> {
    let cluster = TestCluster::spawn(3)?;

    let leader = cluster.wait_for_single_leader(Duration::from_secs(5)).await?;
    cluster
        .wait_for_leader_consensus(leader, &[1, 2, 3], Duration::from_secs(5))
        .await?;

    let term = cluster.node(leader).current_term();
    assert!(term >= 1, "leader term should be positive, got {term}");
    for id in cluster.ids().filter(|&id| id != leader) {
        assert_eq!(cluster.node(id).current_role(), Role::Follower);
    }

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_integration_single_replica_elects_itself() -> Result<()> {
    let cluster = TestCluster::spawn(1)?;
    let leader = cluster.wait_for_single_leader(Duration::from_secs(5)).await?;
    assert_eq!(leader, 1);
    assert_eq!(
        cluster.node(1).leader_address().await.as_deref(),
        Some(common::addr(1).as_str())
    );
    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_integration_no_two_leaders_share_a_term() -> Result<()> {
    let cluster = TestCluster::spawn(5)?;

    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(2) {
        let mut by_term: HashMap<u64, Vec<usize>> = HashMap::new();
        for id in cluster.leaders() {
            by_term
                .entry(cluster.node(id).current_term())
                .or_default()
                .push(id);
        }
        for (term, leaders) in &by_term {
            assert!(
                leaders.len() <= 1,
                "two leaders in term {term}: {leaders:?}"
            );
        }
        sleep(Duration::from_millis(5)).await;
    }

    cluster.wait_for_single_leader(Duration::from_secs(5)).await?;
    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_integration_isolated_leader_is_replaced() -> Result<()> {
    let cluster = TestCluster::spawn(3)?;
    let old = cluster.wait_for_single_leader(Duration::from_secs(5)).await?;
    let old_term = cluster.node(old).current_term();

    cluster.isolate(old);
    let rest: Vec<usize> = cluster.ids().filter(|&id| id != old).collect();
    let new = cluster
        .wait_for_leader_among(&rest, Duration::from_secs(5))
        .await?;
    let new_term = cluster.node(new).current_term();
    assert!(new_term > old_term, "new term {new_term} should exceed {old_term}");

    // Cut off from its quorum, the old leader gives up on its own.
    let deadline = Instant::now() + Duration::from_secs(5);
    while cluster.node(old).current_role() == Role::Leader {
        assert!(Instant::now() < deadline, "isolated leader never stepped down");
        sleep(POLL).await;
    }

    cluster.heal(old);
    let leader = cluster.wait_for_single_leader(Duration::from_secs(5)).await?;
    cluster
        .wait_for_leader_consensus(leader, &[1, 2, 3], Duration::from_secs(5))
        .await?;
    assert!(cluster.node(old).current_term() >= new_term);

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_integration_stale_log_never_wins() -> Result<()> {
    // Replica 1 missed two committed entries the others hold.
    let logs = vec![seeded_log(0, 0)?, seeded_log(2, 1)?, seeded_log(2, 1)?];
    let cluster = TestCluster::spawn_with_logs(logs, |config| config)?;

    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(1) {
        assert_ne!(
            cluster.node(1).current_role(),
            Role::Leader,
            "replica with a stale log won an election"
        );
        sleep(Duration::from_millis(5)).await;
    }

    let leader = cluster.wait_for_leader_among(&[2, 3], Duration::from_secs(5)).await?;
    assert!(cluster.node(leader).current_term() > 1);
    assert_ne!(cluster.node(1).current_role(), Role::Leader);

    cluster.shutdown();
    Ok(())
}

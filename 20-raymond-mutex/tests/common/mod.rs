//! Helpers shared by the integration suites.

#![allow(dead_code)]

use std::time::Duration;

use anyhow::{Result, bail};
use raymond_mutex::broker::BrokerMode;
use raymond_mutex::cluster::Cluster;
use raymond_mutex::config::{ClusterConfig, DelayMode};
use raymond_mutex::message::NodeId;
use raymond_mutex::runtime::NodeStatus;
use tokio::time::Instant;

/// Tree 0-1-2-3 with 4 hanging off 2.
pub const SAMPLE_EDGES: [(NodeId, NodeId); 4] = [(0, 1), (1, 2), (2, 3), (2, 4)];

pub fn instant_config() -> ClusterConfig {
    ClusterConfig::default()
}

pub fn random_config(seed: u64) -> ClusterConfig {
    ClusterConfig {
        delay: DelayMode::Random,
        seed,
        ..ClusterConfig::default()
    }
}

pub fn sample_tree(config: ClusterConfig) -> Result<Cluster> {
    Cluster::with_tree(config, 5, &SAMPLE_EDGES)
}

/// Polls the cluster until `check` accepts a snapshot.
///
/// Meant for paused-clock tests: the timeout is in virtual time.
pub async fn wait_until<F>(cluster: &Cluster, what: &str, mut check: F) -> Result<Vec<NodeStatus>>
where
    F: FnMut(&[NodeStatus]) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        let statuses = cluster.statuses().await?;
        if check(&statuses) {
            return Ok(statuses);
        }
        if Instant::now() > deadline {
            bail!("timeout waiting for {what}: {statuses:#?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_normal(cluster: &Cluster) -> Result<Vec<NodeStatus>> {
    wait_until(cluster, "all nodes in normal mode", |statuses| {
        statuses.iter().all(|status| status.mode == BrokerMode::Normal)
    })
    .await
}

/// Waits until nobody is in the critical section or waiting for it.
pub async fn wait_for_quiescence(cluster: &Cluster) -> Result<Vec<NodeStatus>> {
    wait_until(cluster, "quiescence", |statuses| {
        statuses.iter().all(|status| {
            status.mode == BrokerMode::Normal && !status.inside_cs && status.request_list.is_empty()
        })
    })
    .await
}

/// Checks that holder pointers form a tree rooted at the single token owner.
pub fn token_owner(statuses: &[NodeStatus]) -> Result<NodeId> {
    let owners: Vec<NodeId> = statuses
        .iter()
        .filter(|status| status.holds_token())
        .map(|status| status.id)
        .collect();
    let [owner] = owners[..] else {
        bail!("expected exactly one token owner, found {owners:?}");
    };

    for status in statuses {
        let mut current = status.id;
        for _ in 0..statuses.len() {
            if current == owner {
                break;
            }
            let next = statuses
                .iter()
                .find(|candidate| candidate.id == current)
                .and_then(|candidate| candidate.holder);
            match next {
                Some(next) => current = next,
                None => bail!("node {current} has no holder"),
            }
        }
        if current != owner {
            bail!("holder chain from {} does not reach {owner}", status.id);
        }
    }
    Ok(owner)
}

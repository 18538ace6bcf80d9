//! Crash and recovery through real node workers on a paused clock.

mod common;

use std::time::Duration;

use anyhow::Result;
use raymond_mutex::broker::BrokerMode;
use raymond_mutex::cluster::CrashAction;

use common::{
    instant_config, random_config, sample_tree, token_owner, wait_for_normal,
    wait_for_quiescence, wait_until,
};

#[tokio::test(start_paused = true)]
async fn recovered_node_rebuilds_its_holder() -> Result<()> {
    let mut cluster = sample_tree(instant_config())?;
    cluster.inject(2)?;
    wait_for_normal(&cluster).await?;

    assert_eq!(cluster.crash(1)?, CrashAction::Crashed);
    let statuses = wait_until(&cluster, "node 1 recovering", |statuses| {
        statuses[1].mode == BrokerMode::Recovering
    })
    .await?;
    assert_eq!(statuses[1].holder, None);

    assert_eq!(cluster.crash(1)?, CrashAction::Revived);
    let statuses = wait_for_normal(&cluster).await?;
    assert_eq!(statuses[1].holder, Some(2));
    assert_eq!(token_owner(&statuses)?, 2);
    cluster.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn idle_owner_finds_its_token_again() -> Result<()> {
    let mut cluster = sample_tree(instant_config())?;
    cluster.inject(2)?;
    wait_for_normal(&cluster).await?;

    cluster.crash(2)?;
    wait_until(&cluster, "node 2 recovering", |statuses| {
        statuses[2].mode == BrokerMode::Recovering
    })
    .await?;
    cluster.crash(2)?;

    let statuses = wait_for_normal(&cluster).await?;
    assert_eq!(token_owner(&statuses)?, 2);

    cluster.request(&[0])?;
    wait_until(&cluster, "node 0 served", |statuses| statuses[0].cs_entries == 1).await?;
    cluster.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn crash_is_refused_inside_the_critical_section() -> Result<()> {
    let mut cluster = sample_tree(instant_config())?;
    cluster.inject(3)?;
    wait_for_normal(&cluster).await?;

    cluster.request(&[3])?;
    wait_until(&cluster, "node 3 in the critical section", |statuses| {
        statuses[3].inside_cs
    })
    .await?;

    cluster.force_crash(3)?;
    tokio::time::sleep(Duration::from_millis(10)).await;
    let status = cluster.status(3).await?;
    assert_eq!(status.mode, BrokerMode::Normal);
    assert!(status.holds_token());
    cluster.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn request_through_a_crashed_node_is_served_after_recovery() -> Result<()> {
    let mut cluster = sample_tree(instant_config())?;
    cluster.inject(2)?;
    wait_for_normal(&cluster).await?;

    cluster.crash(1)?;
    wait_until(&cluster, "node 1 recovering", |statuses| {
        statuses[1].mode == BrokerMode::Recovering
    })
    .await?;

    // Node 0 can only reach the token through node 1.
    cluster.request(&[0])?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.status(0).await?.cs_entries, 0);

    cluster.crash(1)?;
    wait_until(&cluster, "node 0 served", |statuses| statuses[0].cs_entries == 1).await?;
    let statuses = wait_for_quiescence(&cluster).await?;
    assert_eq!(token_owner(&statuses)?, 0);
    cluster.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn crashes_under_random_delay_keep_serving_requests() -> Result<()> {
    for seed in [3, 11, 2024] {
        let mut cluster = sample_tree(random_config(seed))?;
        cluster.inject(2)?;
        wait_for_normal(&cluster).await?;

        cluster.request(&[0, 4])?;
        wait_for_quiescence(&cluster).await?;

        cluster.crash(1)?;
        wait_until(&cluster, "node 1 recovering", |statuses| {
            statuses[1].mode == BrokerMode::Recovering
        })
        .await?;
        cluster.request(&[3])?;
        cluster.crash(1)?;
        cluster.request(&[1])?;

        let statuses = wait_until(&cluster, "all requests served", |statuses| {
            statuses.iter().map(|status| status.cs_entries).sum::<u64>() == 4
        })
        .await?;
        assert_eq!(statuses[1].cs_entries, 1);
        let statuses = wait_for_quiescence(&cluster).await?;
        token_owner(&statuses)?;
        cluster.shutdown().await?;
    }
    Ok(())
}

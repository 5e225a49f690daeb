mod common;

use bytes::Bytes;
use common::{Fleet, host};
use peerstash_core::{
    BlobStore, LocationIndex, LocationRecord, OpLogConfig, OpOptions, RepairConfig, Replication, placement,
};

const KEY: &str = "blob-under";

fn repair_config() -> RepairConfig {
    RepairConfig {
        replication_factor: 5,
        cleanup_probability: 1.0,
        ..Default::default()
    }
}

async fn store_on(fleet: &Fleet, on: &str, key: &str) {
    let node = fleet.node(on);
    node.blobs.put(key, Bytes::from_static(b"flac")).await.unwrap();
    node.oplog
        .create(&LocationRecord::new(key, on), OpOptions::default())
        .unwrap();
}

async fn repair_rounds(fleet: &Fleet, rounds: usize) {
    for _ in 0..rounds {
        for node in &fleet.nodes {
            node.repair.run_repair(true).await.unwrap();
        }
        fleet.sweep_all().await;
    }
}

fn problem_count(fleet: &Fleet, on: &str, direction: Replication) -> usize {
    LocationIndex::new(fleet.node(on).oplog.store())
        .problem_keys(&fleet.hosts(), 5, direction, 1000)
        .unwrap()
        .len()
}

#[tokio::test]
async fn test_single_copy_converges_to_replication_factor() {
    let fleet = Fleet::new(9, OpLogConfig::default(), repair_config());
    let ranked = placement::rank(KEY, &fleet.hosts());
    assert_eq!(ranked.last(), Some(&host(5)));

    store_on(&fleet, &host(5), KEY).await;
    fleet.sweep_all().await;

    repair_rounds(&fleet, 3).await;

    let mut owners = ranked[..5].to_vec();
    owners.sort();
    for node in &fleet.nodes {
        let holders = LocationIndex::new(node.oplog.store()).holders(KEY).unwrap();
        assert_eq!(holders, owners, "view of {}", node.host);
        assert_eq!(problem_count(&fleet, &node.host, Replication::Under), 0);
        assert_eq!(problem_count(&fleet, &node.host, Replication::Over), 0);
        assert_eq!(node.blobs.exists(KEY).await.unwrap(), owners.contains(&node.host));
    }
}

#[tokio::test]
async fn test_cleanup_keeps_a_prefix_of_the_ranking() {
    let fleet = Fleet::new(9, OpLogConfig::default(), repair_config());
    let ranked = placement::rank(KEY, &fleet.hosts());

    for on in fleet.hosts() {
        store_on(&fleet, &on, KEY).await;
    }
    fleet.sweep_all().await;
    assert_eq!(problem_count(&fleet, &host(1), Replication::Over), 1);

    // Every node runs cleanup off the same stale view before anyone syncs
    for node in &fleet.nodes {
        let report = node.repair.run_repair(true).await.unwrap();
        let position = ranked.iter().position(|h| *h == node.host).unwrap();
        assert_eq!(report.dropped, usize::from(position >= 5), "{}", node.host);
    }
    fleet.sweep_all().await;

    let mut owners = ranked[..5].to_vec();
    owners.sort();
    for node in &fleet.nodes {
        assert_eq!(LocationIndex::new(node.oplog.store()).holders(KEY).unwrap(), owners);
    }

    repair_rounds(&fleet, 2).await;
    for node in &fleet.nodes {
        assert_eq!(LocationIndex::new(node.oplog.store()).holders(KEY).unwrap(), owners);
    }
}

#[tokio::test]
async fn test_failed_pull_leaves_key_for_next_cycle() {
    let fleet = Fleet::new(9, OpLogConfig::default(), repair_config());
    let ranked = placement::rank(KEY, &fleet.hosts());

    store_on(&fleet, &host(5), KEY).await;
    fleet.sweep_all().await;
    fleet.network.set_down(&host(5), true);

    let owner = fleet.node(&ranked[0]);
    let report = owner.repair.run_repair(false).await.unwrap();
    assert_eq!(report.under_replicated, 1);
    assert_eq!(report.pulled, 0);
    assert_eq!(report.failed, 1);
    assert!(!owner.blobs.exists(KEY).await.unwrap());

    fleet.network.set_down(&host(5), false);
    let report = owner.repair.run_repair(false).await.unwrap();
    assert_eq!(report.pulled, 1);
    assert!(owner.blobs.exists(KEY).await.unwrap());
}

#[tokio::test]
async fn test_one_node_repairs_per_tick() {
    let fleet = Fleet::new(9, OpLogConfig::default(), repair_config());

    for round in 0..2 {
        let mut ran = Vec::new();
        for node in &fleet.nodes {
            if node.repair.tick().await.unwrap().ran {
                ran.push(node.host.clone());
            }
        }
        assert_eq!(ran, vec![host(round + 1)]);
    }
}

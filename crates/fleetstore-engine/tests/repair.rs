mod common;

use common::{Cluster, engine_config, fabric_config, fragments};
use fleetstore_common::config::EngineConfig;
use fleetstore_common::types::{Block, NodeHealth, NodeId};
use fleetstore_engine::{EngineError, ReplicationError};
use fleetstore_placement::Redundancy;
use std::collections::BTreeSet;

#[tokio::test]
async fn test_offline_host_replaced_on_spare() {
    let cluster = Cluster::start(5).await;
    let frags = fragments(1, 200);
    let chunk = cluster.chunk(&frags, 1);
    let blocks = cluster.engine.put_chunk(&chunk, &frags).await.unwrap();
    assert_eq!(blocks.len(), 3);

    let holding: BTreeSet<usize> = blocks.iter().map(|b| cluster.index_of(&b.node)).collect();
    let spares: Vec<usize> = (0..5).filter(|i| !holding.contains(i)).collect();
    let lost = *holding.iter().next().unwrap();

    // the host drops out, and one spare fails while the copy is made
    cluster.set_down(lost, true);
    cluster.set_down(spares[0], true);
    cluster.engine.observe_node(cluster.nodes[lost].id, NodeHealth::Offline);

    let summary = cluster.engine.repair_offline().await;
    assert_eq!(summary.repaired, 1);
    assert_eq!(summary.under_replicated, 0);
    assert!(cluster.engine.condition(chunk.id).is_none());

    let now: Vec<Block> = cluster
        .records
        .blocks_of_chunk(chunk.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|b| !b.is_pending())
        .collect();
    let serving: BTreeSet<usize> = now
        .iter()
        .map(|b| cluster.index_of(&b.node))
        .filter(|i| *i != lost)
        .collect();
    assert_eq!(serving.len(), 3);
    assert!(serving.contains(&spares[1]));
    assert!(!serving.contains(&spares[0]));
    let replica = now.iter().find(|b| b.node == cluster.nodes[spares[1]].id).unwrap();
    assert_eq!(cluster.agents[spares[1]].block(&replica.id), Some(frags[0].clone()));

    let read = cluster.engine.get_chunk(chunk.id).await.unwrap();
    assert_eq!(read.assemble(), Some(frags[0].clone()));
}

#[tokio::test]
async fn test_replication_gives_up_after_retry_budget() {
    let config = EngineConfig {
        replicate_retry: 1,
        ..engine_config()
    };
    let cluster = Cluster::with_config(6, config, fabric_config()).await;
    let frags = fragments(1, 64);
    let chunk = cluster.chunk(&frags, 1);
    let blocks = cluster.engine.put_chunk(&chunk, &frags).await.unwrap();

    let holding: BTreeSet<usize> = blocks.iter().map(|b| cluster.index_of(&b.node)).collect();
    let spares: Vec<usize> = (0..6).filter(|i| !holding.contains(i)).collect();
    for spare in &spares {
        cluster.set_down(*spare, true);
    }
    let lost = *holding.iter().next().unwrap();
    cluster.engine.observe_node(cluster.nodes[lost].id, NodeHealth::Offline);

    let err = cluster.engine.repair_chunk(chunk.id).await.unwrap_err();
    match err {
        EngineError::Replication(ReplicationError::UnderReplicated { attempts, fragments, .. }) => {
            assert_eq!(attempts, 2);
            assert_eq!(fragments, vec![0]);
        }
        other => panic!("unexpected error: {other}"),
    }
    let dialled = spares
        .iter()
        .filter(|i| cluster.transport.dial_count(&common::address(**i)) > 0)
        .count();
    assert_eq!(dialled, 2);

    let condition = cluster.engine.condition(chunk.id).unwrap();
    assert_eq!(condition.redundancy, Redundancy::UnderReplicated { fragments: vec![0] });
    let overview = cluster.engine.overview().await.unwrap().unwrap();
    assert_eq!(overview.under_replicated, 1);

    // still readable from the two surviving copies
    assert!(cluster.engine.get_chunk(chunk.id).await.is_ok());
}

#[tokio::test]
async fn test_unreconstructable_reported_separately() {
    let cluster = Cluster::start(4).await;
    let frags = fragments(3, 32);
    let chunk = cluster.chunk(&frags, 2);
    let blocks = cluster.engine.put_chunk(&chunk, &frags).await.unwrap();

    // losing the holders of two fragments leaves one of the two required
    let lost: BTreeSet<_> = blocks.iter().filter(|b| b.fragment < 2).map(|b| b.node).collect();
    let survivors: BTreeSet<_> = blocks.iter().filter(|b| b.fragment == 2).map(|b| b.node).collect();
    assert!(lost.is_disjoint(&survivors));
    for node in &lost {
        cluster.engine.observe_node(*node, NodeHealth::Offline);
    }

    let err = cluster.engine.repair_chunk(chunk.id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Replication(ReplicationError::Unreconstructable {
            available: 1,
            required: 2,
            ..
        })
    ));
    let conditions = cluster.engine.conditions();
    assert_eq!(conditions.len(), 1);
    assert!(matches!(conditions[0].redundancy, Redundancy::Unreconstructable { .. }));
    let overview = cluster.engine.overview().await.unwrap().unwrap();
    assert_eq!(overview.unreconstructable, 1);
    assert_eq!(overview.under_replicated, 0);
}

#[tokio::test]
async fn test_decommission_moves_blocks_and_prunes_records() {
    let cluster = Cluster::start(4).await;
    let frags = fragments(1, 80);
    let chunk = cluster.chunk(&frags, 1);
    let blocks = cluster.engine.put_chunk(&chunk, &frags).await.unwrap();
    let leaving = blocks[0].node;

    let summary = cluster.engine.decommission_node(leaving).await.unwrap();
    assert_eq!(summary.repaired, 1);

    let now = cluster.records.blocks_of_chunk(chunk.id).await.unwrap();
    assert_eq!(now.len(), 3);
    assert!(now.iter().all(|b| b.node != leaving && !b.is_pending()));
    assert!(cluster.records.get_node(leaving).await.unwrap().unwrap().decommissioned);
    let overview = cluster.engine.overview().await.unwrap().unwrap();
    assert_eq!(overview.decommissioned, 1);
    assert_eq!(overview.blocks, 3);

    assert!(matches!(
        cluster.engine.decommission_node(NodeId::new()).await,
        Err(EngineError::NodeNotFound(_))
    ));
}

#[tokio::test]
async fn test_repair_scan_leaves_healthy_chunks_alone() {
    let cluster = Cluster::start(3).await;
    for _ in 0..4 {
        let frags = fragments(1, 16);
        let chunk = cluster.chunk(&frags, 1);
        cluster.engine.put_chunk(&chunk, &frags).await.unwrap();
    }
    let writes: usize = cluster.agents.iter().map(|a| a.writes()).sum();

    let summary = cluster.engine.initiate_repair().await.unwrap();
    assert_eq!(summary.scanned, 4);
    assert_eq!(summary.healthy, 4);
    assert_eq!(cluster.agents.iter().map(|a| a.writes()).sum::<usize>(), writes);
}

#[tokio::test]
async fn test_repair_restores_distinct_node_minimum() {
    let cluster = Cluster::start(5).await;
    let frags = fragments(2, 96);
    let chunk = cluster.chunk(&frags, 2);
    let blocks = cluster.engine.put_chunk(&chunk, &frags).await.unwrap();
    assert_eq!(blocks.len(), 4);

    let holders = |fragment: u32| -> Vec<usize> {
        blocks
            .iter()
            .filter(|b| b.fragment == fragment)
            .map(|b| cluster.index_of(&b.node))
            .collect()
    };
    let (first, second) = (holders(0), holders(1));
    let used: BTreeSet<usize> = first.iter().chain(&second).copied().collect();
    assert_eq!(used.len(), 4);
    let spare = (0..5).find(|i| !used.contains(i)).unwrap();

    // one holder of each fragment drops out while the spare is unreachable,
    // so every replacement lands on the other fragment's survivor
    cluster.set_down(spare, true);
    for lost in [first[1], second[1]] {
        cluster.set_down(lost, true);
        cluster.engine.observe_node(cluster.nodes[lost].id, NodeHealth::Offline);
    }

    let err = cluster.engine.repair_chunk(chunk.id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Replication(ReplicationError::UnderReplicated { .. })
    ));
    assert!(matches!(
        cluster.engine.condition(chunk.id).unwrap().redundancy,
        Redundancy::UnderReplicated { .. }
    ));

    let serving_nodes = |blocks: &[Block]| -> BTreeSet<usize> {
        blocks
            .iter()
            .filter(|b| !b.is_pending())
            .map(|b| cluster.index_of(&b.node))
            .filter(|i| *i != first[1] && *i != second[1])
            .collect()
    };
    let now = cluster.records.blocks_of_chunk(chunk.id).await.unwrap();
    assert_eq!(serving_nodes(&now), BTreeSet::from([first[0], second[0]]));

    // once the spare answers again the chunk widens onto it
    cluster.set_down(spare, false);
    cluster.engine.observe_node(cluster.nodes[spare].id, NodeHealth::Online);
    let report = cluster.engine.repair_chunk(chunk.id).await.unwrap();
    assert!(report.copies_made >= 1);
    assert!(report.redundancy.is_healthy());
    assert!(cluster.engine.condition(chunk.id).is_none());

    let now = cluster.records.blocks_of_chunk(chunk.id).await.unwrap();
    let serving = serving_nodes(&now);
    assert!(serving.len() >= 3);
    assert!(serving.contains(&spare));

    let read = cluster.engine.get_chunk(chunk.id).await.unwrap();
    assert_eq!(read.assemble(), Some(frags.concat().into()));
}

#[tokio::test]
async fn test_put_after_repair_skips_offline_copies() {
    let cluster = Cluster::start(4).await;
    let frags = fragments(1, 96);
    let chunk = cluster.chunk(&frags, 1);
    let blocks = cluster.engine.put_chunk(&chunk, &frags).await.unwrap();
    let lost = cluster.index_of(&blocks[0].node);

    cluster.set_down(lost, true);
    cluster.engine.observe_node(cluster.nodes[lost].id, NodeHealth::Offline);
    let summary = cluster.engine.repair_offline().await;
    assert_eq!(summary.repaired, 1);

    let again = cluster.engine.put_chunk(&chunk, &frags).await.unwrap();
    assert_eq!(again.len(), 3);
    assert!(again.iter().all(|b| b.node != cluster.nodes[lost].id));
    let nodes: BTreeSet<_> = again.iter().map(|b| b.node).collect();
    assert_eq!(nodes.len(), 3);
}

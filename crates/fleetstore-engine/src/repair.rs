//! Re-replication of under-replicated chunks
//!
//! A chunk is assessed from its healthy copies: finalized blocks on nodes
//! that are active and not OFFLINE. Missing copies are read from a surviving
//! holder and written to a replacement node, a fresh node per attempt, up to
//! `replicate_retry` additional attempts. Copies also go to nodes the chunk
//! does not use yet until it spans the tier's minimum of distinct nodes.
//! Chunks that cannot be brought back to target are kept as reportable
//! conditions.

use crate::admission::OpKind;
use crate::engine::{Engine, now_ms};
use crate::error::{EngineError, EngineResult, ReplicationError};
use bytes::Bytes;
use fleetstore_common::retry::{Backoff, RetryPolicy};
use fleetstore_common::types::{Block, BlockId, Chunk, ChunkId, NodeId, Tier, TierId};
use fleetstore_placement::Redundancy;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

/// A chunk whose redundancy is below target
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChunkCondition {
    pub chunk: ChunkId,
    pub tier: TierId,
    pub redundancy: Redundancy,
    pub detected_at_ms: u64,
}

/// Outcome of repairing one chunk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepairReport {
    pub chunk: ChunkId,
    /// New blocks finalized by this repair
    pub copies_made: usize,
    pub redundancy: Redundancy,
}

/// Tally of a repair pass over many chunks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RepairSummary {
    pub scanned: usize,
    pub healthy: usize,
    pub repaired: usize,
    pub under_replicated: usize,
    pub unreconstructable: usize,
    pub failed: usize,
}

impl RepairSummary {
    fn record(&mut self, result: &EngineResult<RepairReport>) {
        self.scanned += 1;
        match result {
            Ok(report) if report.copies_made == 0 => self.healthy += 1,
            Ok(_) => self.repaired += 1,
            Err(EngineError::Replication(ReplicationError::UnderReplicated { .. })) => self.under_replicated += 1,
            Err(EngineError::Replication(ReplicationError::Unreconstructable { .. })) => {
                self.unreconstructable += 1;
            }
            // deleted while the pass was running
            Err(EngineError::ChunkNotFound(_)) => self.scanned -= 1,
            Err(_) => self.failed += 1,
        }
    }

    fn merge(&mut self, other: Self) {
        self.scanned += other.scanned;
        self.healthy += other.healthy;
        self.repaired += other.repaired;
        self.under_replicated += other.under_replicated;
        self.unreconstructable += other.unreconstructable;
        self.failed += other.failed;
    }
}

/// Failures for which another node may do better
fn worth_another_node(e: &EngineError) -> bool {
    match e {
        EngineError::Connection(_) | EngineError::BadResponse { .. } => true,
        EngineError::Placement(_) => false,
        other => other.is_retryable(),
    }
}

impl Engine {
    /// Finalized copies on serving nodes, by fragment
    fn healthy_copies(&self, blocks: &[Block]) -> BTreeMap<u32, Vec<Block>> {
        let mut healthy: BTreeMap<u32, Vec<Block>> = BTreeMap::new();
        for block in blocks
            .iter()
            .filter(|b| !b.is_pending() && self.fleet.is_serving(&b.node))
        {
            healthy.entry(block.fragment).or_default().push(block.clone());
        }
        healthy
    }

    fn set_condition(&self, chunk: &Chunk, redundancy: Redundancy) {
        let detected_at_ms = self
            .conditions
            .get(&chunk.id)
            .filter(|c| c.redundancy == redundancy)
            .map_or_else(now_ms, |c| c.detected_at_ms);
        self.conditions.insert(
            chunk.id,
            ChunkCondition {
                chunk: chunk.id,
                tier: chunk.tier,
                redundancy,
                detected_at_ms,
            },
        );
    }

    /// Chunks currently below their redundancy target
    #[must_use]
    pub fn conditions(&self) -> Vec<ChunkCondition> {
        let mut all: Vec<ChunkCondition> = self.conditions.iter().map(|c| c.value().clone()).collect();
        all.sort_by_key(|c| (c.detected_at_ms, c.chunk));
        all
    }

    #[must_use]
    pub fn condition(&self, chunk: ChunkId) -> Option<ChunkCondition> {
        self.conditions.get(&chunk).map(|c| c.value().clone())
    }

    /// (under-replicated, unreconstructable) chunk counts
    pub(crate) fn condition_counts(&self) -> (usize, usize) {
        self.conditions
            .iter()
            .fold((0, 0), |(under, unrecon), c| match c.redundancy {
                Redundancy::UnderReplicated { .. } => (under + 1, unrecon),
                Redundancy::Unreconstructable { .. } => (under, unrecon + 1),
                Redundancy::Healthy => (under, unrecon),
            })
    }

    fn pick_replacement(
        &self,
        chunk: &Chunk,
        tier: &Tier,
        tried: &Mutex<BTreeSet<NodeId>>,
        spread: &BTreeSet<NodeId>,
    ) -> EngineResult<NodeId> {
        let eligible = self.fleet.eligible_nodes(tier.id);
        let mut tried = tried.lock();
        let node = self
            .placer
            .replacement(chunk.id, tier, &eligible, &tried, spread, &self.fleet.load_snapshot())?;
        tried.insert(node);
        Ok(node)
    }

    /// Write one new copy of a fragment, moving to another node on failure.
    /// Nodes in `exclude` are never used; nodes in `spread` lose to others
    /// while the chunk sits on fewer than the tier's minimum.
    async fn replicate_fragment(
        &self,
        chunk: &Chunk,
        tier: &Tier,
        fragment: u32,
        data: &Bytes,
        exclude: BTreeSet<NodeId>,
        spread: &BTreeSet<NodeId>,
    ) -> Result<Block, (EngineError, u32)> {
        let tried = Mutex::new(exclude);
        let tried = &tried;
        let policy = RetryPolicy::with_retries(
            self.config.replicate_retry,
            Backoff::Fixed(self.fabric.config().reconnect_delay()),
        );
        policy
            .run("replicate_block", worth_another_node, |attempt| async move {
                let target = self.pick_replacement(chunk, tier, tried, spread)?;
                debug!(chunk = %chunk.id, fragment, node = %target, attempt, "replicating fragment");
                self.write_block_once(chunk, fragment, target, data.clone()).await
            })
            .await
            .map_err(|e| {
                let attempts = e.attempts();
                (e.into_last(), attempts)
            })
    }

    /// Drop records of copies on nodes that left the fleet
    async fn prune_departed(&self, blocks: &[Block]) -> EngineResult<()> {
        let departed: Vec<&Block> = {
            let topology = self.fleet.topology.read();
            blocks
                .iter()
                .filter(|b| topology.node(&b.node).is_none_or(|n| n.decommissioned))
                .collect()
        };
        if departed.is_empty() {
            return Ok(());
        }
        let ids: Vec<BlockId> = departed.iter().map(|b| b.id).collect();
        self.records.delete_blocks(&ids).await?;
        for block in departed.iter().filter(|b| !b.is_pending()) {
            self.fleet.remove_load(block.node, 1);
        }
        debug!(count = ids.len(), "pruned blocks of departed nodes");
        Ok(())
    }

    /// Bring a chunk back to its target copy count, on at least the tier's
    /// minimum of distinct nodes
    pub async fn repair_chunk(&self, id: ChunkId) -> EngineResult<RepairReport> {
        let _slot = self.admission.acquire(OpKind::Replicate).await;
        let chunk = self.records.get_chunk(id).await?.ok_or(EngineError::ChunkNotFound(id))?;
        let tier = self.fleet.topology.read().tier(&chunk.tier)?.clone();
        let blocks = self.records.blocks_of_chunk(id).await?;
        let healthy = self.healthy_copies(&blocks);
        let counts: BTreeMap<u32, u32> = healthy.iter().map(|(f, c)| (*f, c.len() as u32)).collect();
        let mut spread: BTreeSet<NodeId> = healthy.values().flatten().map(|b| b.node).collect();

        let lacking = match self.policy.assess(&chunk, &tier, &counts, spread.len()) {
            Redundancy::Healthy => {
                self.prune_departed(&blocks).await?;
                self.conditions.remove(&id);
                return Ok(RepairReport {
                    chunk: id,
                    copies_made: 0,
                    redundancy: Redundancy::Healthy,
                });
            }
            Redundancy::Unreconstructable { available, required } => {
                error!(chunk = %id, available, required, "chunk unreconstructable");
                self.set_condition(&chunk, Redundancy::Unreconstructable { available, required });
                return Err(ReplicationError::Unreconstructable {
                    chunk: id,
                    available,
                    required,
                }
                .into());
            }
            Redundancy::UnderReplicated { fragments } => fragments,
        };

        let target = self.policy.target_copies(&chunk, &tier);
        let mut holders: BTreeMap<u32, BTreeSet<NodeId>> = BTreeMap::new();
        for block in blocks.iter().filter(|b| !b.is_pending()) {
            holders.entry(block.fragment).or_default().insert(block.node);
        }
        let mut sources: BTreeMap<u32, Bytes> = BTreeMap::new();
        let mut copies_made = 0;
        let mut still_lacking = Vec::new();
        let mut attempts = 0;

        for fragment in lacking {
            let copies = healthy.get(&fragment).map(Vec::as_slice).unwrap_or_default();
            let Some(data) = self.read_fragment(copies).await else {
                warn!(chunk = %id, fragment, "no readable source for fragment");
                still_lacking.push(fragment);
                continue;
            };
            let held = holders.entry(fragment).or_default();
            for _ in copies.len() as u32..target {
                match self
                    .replicate_fragment(&chunk, &tier, fragment, &data, held.clone(), &spread)
                    .await
                {
                    Ok(block) => {
                        held.insert(block.node);
                        spread.insert(block.node);
                        copies_made += 1;
                        info!(chunk = %id, fragment, node = %block.node, "fragment replicated");
                    }
                    Err((e, tries)) => {
                        warn!(chunk = %id, fragment, attempts = tries, error = %e, "fragment replication exhausted");
                        attempts = attempts.max(tries);
                        still_lacking.push(fragment);
                        break;
                    }
                }
            }
            sources.insert(fragment, data);
        }

        // every fragment at target, but on too few nodes: add copies on new ones
        let min_nodes = tier.min_nodes as usize;
        let mut rotation = sources.iter().cycle();
        while still_lacking.is_empty() && spread.len() < min_nodes {
            let Some((&fragment, data)) = rotation.next() else {
                break;
            };
            let held = holders.entry(fragment).or_default();
            let exclude: BTreeSet<NodeId> = held.union(&spread).copied().collect();
            match self
                .replicate_fragment(&chunk, &tier, fragment, data, exclude, &spread)
                .await
            {
                Ok(block) => {
                    held.insert(block.node);
                    spread.insert(block.node);
                    copies_made += 1;
                    info!(chunk = %id, fragment, node = %block.node, "fragment spread to a new node");
                }
                Err((e, tries)) => {
                    warn!(chunk = %id, fragment, nodes = spread.len(), error = %e, "chunk stays on too few nodes");
                    attempts = attempts.max(tries);
                    still_lacking.push(fragment);
                }
            }
        }

        if !still_lacking.is_empty() {
            self.set_condition(
                &chunk,
                Redundancy::UnderReplicated {
                    fragments: still_lacking.clone(),
                },
            );
            return Err(ReplicationError::UnderReplicated {
                chunk: id,
                fragments: still_lacking,
                attempts,
            }
            .into());
        }

        self.prune_departed(&blocks).await?;
        self.conditions.remove(&id);
        Ok(RepairReport {
            chunk: id,
            copies_made,
            redundancy: Redundancy::Healthy,
        })
    }

    async fn repair_chunks(&self, chunks: BTreeSet<ChunkId>) -> RepairSummary {
        let mut summary = RepairSummary::default();
        let mut results = stream::iter(chunks)
            .map(|id| self.repair_chunk(id))
            .buffer_unordered(self.config.replicate_concurrency.max(1));
        while let Some(result) = results.next().await {
            if let Err(e) = &result
                && !matches!(e, EngineError::Replication(_) | EngineError::ChunkNotFound(_))
            {
                warn!(error = %e, "chunk repair failed");
            }
            summary.record(&result);
        }
        summary
    }

    /// Re-replicate every chunk with a block on `node`
    pub async fn repair_node(&self, node: NodeId) -> EngineResult<RepairSummary> {
        let chunks: BTreeSet<ChunkId> = self
            .records
            .blocks_on_node(node)
            .await?
            .into_iter()
            .map(|b| b.chunk)
            .collect();
        let summary = self.repair_chunks(chunks).await;
        info!(node = %node, ?summary, "node repair finished");
        Ok(summary)
    }

    /// Scan every chunk and repair the ones below target
    pub async fn initiate_repair(&self) -> EngineResult<RepairSummary> {
        let chunks: BTreeSet<ChunkId> = self.records.list_chunks().await?.into_iter().map(|c| c.id).collect();
        let summary = self.repair_chunks(chunks).await;
        info!(?summary, "repair scan finished");
        Ok(summary)
    }

    /// Repair the blocks of nodes that went OFFLINE since the last call
    pub async fn repair_offline(&self) -> RepairSummary {
        let mut total = RepairSummary::default();
        for node in self.take_offline() {
            warn!(node = %node, "node offline, repairing its blocks");
            match self.repair_node(node).await {
                Ok(summary) => total.merge(summary),
                Err(e) => {
                    warn!(node = %node, error = %e, "node repair failed, will retry");
                    self.offline_queue.lock().insert(node);
                }
            }
        }
        total
    }

    /// One round of health checking: probe, then repair newly OFFLINE nodes
    pub async fn health_tick(&self) -> RepairSummary {
        self.probe_nodes().await;
        self.repair_offline().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_tally() {
        let chunk = ChunkId::new();
        let mut summary = RepairSummary::default();
        summary.record(&Ok(RepairReport {
            chunk,
            copies_made: 0,
            redundancy: Redundancy::Healthy,
        }));
        summary.record(&Ok(RepairReport {
            chunk,
            copies_made: 2,
            redundancy: Redundancy::Healthy,
        }));
        summary.record(&Err(ReplicationError::UnderReplicated {
            chunk,
            fragments: vec![0],
            attempts: 4,
        }
        .into()));
        summary.record(&Err(EngineError::ChunkNotFound(chunk)));
        assert_eq!(
            summary,
            RepairSummary {
                scanned: 3,
                healthy: 1,
                repaired: 1,
                under_replicated: 1,
                ..RepairSummary::default()
            }
        );
    }

    #[test]
    fn test_placement_failure_stops_retries() {
        let exhausted = EngineError::Placement(fleetstore_placement::PlacementError::InsufficientNodes {
            tier: TierId::new(),
            available: 0,
            required: 1,
        });
        assert!(!worth_another_node(&exhausted));
        let remote = EngineError::Connection(fleetstore_fabric::FabricError::Remote(
            fleetstore_fabric::RemoteError::not_found("gone"),
        ));
        assert!(worth_another_node(&remote));
    }
}

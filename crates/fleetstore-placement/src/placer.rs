//! Greedy least-loaded fragment placement
//!
//! Every fragment of a chunk gets `replicas` blocks on distinct nodes.
//! Slots are filled fragment by fragment; each slot takes the eligible node
//! with the fewest blocks, preferring nodes the chunk does not use yet until
//! the chunk spans the tier's minimum of distinct nodes. Ties are broken by
//! an xxh64 of the node id seeded with the chunk, so equal-load fleets still
//! spread different chunks differently.

use crate::error::{PlacementError, PlacementResult};
use fleetstore_common::types::{ChunkId, NodeId, Tier};
use std::collections::{BTreeSet, HashMap};
use xxhash_rust::xxh64::xxh64;

/// Blocks per fragment so that `fragments` fragments can cover the tier's
/// minimum of distinct nodes
#[must_use]
pub fn effective_replicas(tier: &Tier, fragments: u32) -> u32 {
    let spread = tier.min_nodes.div_ceil(fragments.max(1));
    tier.replicas.max(spread)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentPlacement {
    pub fragment: u32,
    pub nodes: Vec<NodeId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlacementPlan {
    pub chunk: ChunkId,
    pub replicas: u32,
    pub fragments: Vec<FragmentPlacement>,
}

impl PlacementPlan {
    /// Every (fragment, node) target of the plan
    pub fn targets(&self) -> impl Iterator<Item = (u32, NodeId)> + '_ {
        self.fragments
            .iter()
            .flat_map(|f| f.nodes.iter().map(move |n| (f.fragment, *n)))
    }

    #[must_use]
    pub fn distinct_nodes(&self) -> BTreeSet<NodeId> {
        self.targets().map(|(_, n)| n).collect()
    }
}

fn tie_break(chunk: &ChunkId, node: &NodeId) -> u64 {
    xxh64(node.as_bytes(), xxh64(chunk.as_bytes(), 0))
}

/// Current number of blocks per node
pub type NodeLoad = HashMap<NodeId, u64>;

#[derive(Clone, Copy, Debug, Default)]
pub struct Placer;

impl Placer {
    /// Plan blocks for a new chunk of `fragments` fragments
    pub fn place(
        &self,
        chunk: ChunkId,
        tier: &Tier,
        fragments: u32,
        eligible: &[NodeId],
        load: &NodeLoad,
    ) -> PlacementResult<PlacementPlan> {
        let replicas = effective_replicas(tier, fragments);
        let required = (tier.min_nodes as usize).max(replicas as usize);
        if eligible.len() < required {
            return Err(PlacementError::InsufficientNodes {
                tier: tier.id,
                available: eligible.len(),
                required,
            });
        }

        let mut load = load.clone();
        let mut used: BTreeSet<NodeId> = BTreeSet::new();
        let mut placed = Vec::with_capacity(fragments as usize);
        for fragment in 0..fragments {
            let mut nodes: Vec<NodeId> = Vec::with_capacity(replicas as usize);
            for _ in 0..replicas {
                let spreading = used.len() < tier.min_nodes as usize;
                let pick = eligible
                    .iter()
                    .filter(|n| !nodes.contains(n))
                    .min_by_key(|n| {
                        (
                            spreading && used.contains(*n),
                            load.get(*n).copied().unwrap_or(0),
                            tie_break(&chunk, n),
                        )
                    })
                    .copied()
                    .ok_or(PlacementError::InsufficientNodes {
                        tier: tier.id,
                        available: eligible.len(),
                        required,
                    })?;
                *load.entry(pick).or_insert(0) += 1;
                used.insert(pick);
                nodes.push(pick);
            }
            placed.push(FragmentPlacement { fragment, nodes });
        }

        Ok(PlacementPlan {
            chunk,
            replicas,
            fragments: placed,
        })
    }

    /// Pick a node for a new copy of a fragment, avoiding `exclude`.
    ///
    /// `spread` holds the nodes already serving the chunk; while it is smaller
    /// than the tier's minimum, nodes outside it win over less loaded ones.
    pub fn replacement(
        &self,
        chunk: ChunkId,
        tier: &Tier,
        eligible: &[NodeId],
        exclude: &BTreeSet<NodeId>,
        spread: &BTreeSet<NodeId>,
        load: &NodeLoad,
    ) -> PlacementResult<NodeId> {
        let spreading = spread.len() < tier.min_nodes as usize;
        eligible
            .iter()
            .filter(|n| !exclude.contains(*n))
            .min_by_key(|n| {
                (
                    spreading && spread.contains(*n),
                    load.get(*n).copied().unwrap_or(0),
                    tie_break(&chunk, n),
                )
            })
            .copied()
            .ok_or(PlacementError::InsufficientNodes {
                tier: tier.id,
                available: eligible.iter().filter(|n| !exclude.contains(*n)).count(),
                required: 1,
            })
    }
}

//! Redundancy bookkeeping
//!
//! A policy decides how many fragments a chunk needs for reconstruction and
//! how many healthy copies each fragment should keep. The arithmetic of the
//! coding scheme itself stays outside; only the counting lives here.

use crate::placer::effective_replicas;
use fleetstore_common::types::{Chunk, Tier};
use serde::Serialize;
use std::collections::BTreeMap;

/// Redundancy state of one chunk
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Redundancy {
    Healthy,
    /// Reconstructable, but these fragments lack healthy copies
    UnderReplicated { fragments: Vec<u32> },
    /// Fewer fragments survive than reconstruction needs
    Unreconstructable { available: u32, required: u32 },
}

impl Redundancy {
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

pub trait RedundancyPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fragments with at least one healthy copy needed to rebuild the chunk
    fn threshold(&self, chunk: &Chunk) -> u32;

    /// Healthy copies each fragment should have
    fn target_copies(&self, chunk: &Chunk, tier: &Tier) -> u32 {
        effective_replicas(tier, chunk.total_frags)
    }

    /// Classify a chunk from the healthy copy count of each fragment and the
    /// number of distinct nodes serving those copies
    fn assess(
        &self,
        chunk: &Chunk,
        tier: &Tier,
        healthy_copies: &BTreeMap<u32, u32>,
        serving_nodes: usize,
    ) -> Redundancy {
        let copies = |f: u32| healthy_copies.get(&f).copied().unwrap_or(0);
        let available = chunk.fragment_indices().filter(|f| copies(*f) > 0).count() as u32;
        let required = self.threshold(chunk);
        if available < required {
            return Redundancy::Unreconstructable { available, required };
        }
        let target = self.target_copies(chunk, tier);
        let lacking: Vec<u32> = chunk.fragment_indices().filter(|f| copies(*f) < target).collect();
        if !lacking.is_empty() {
            return Redundancy::UnderReplicated { fragments: lacking };
        }
        if serving_nodes < tier.min_nodes as usize {
            // every fragment is at target but the copies share too few nodes
            return Redundancy::UnderReplicated {
                fragments: chunk.fragment_indices().collect(),
            };
        }
        Redundancy::Healthy
    }
}

/// Every fragment is required (plain replication of distinct slices)
#[derive(Clone, Copy, Debug, Default)]
pub struct FullReplication;

impl RedundancyPolicy for FullReplication {
    fn name(&self) -> &'static str {
        "replication"
    }

    fn threshold(&self, chunk: &Chunk) -> u32 {
        chunk.total_frags
    }
}

/// Any `data_frags` of the `total_frags` fragments rebuild the chunk
#[derive(Clone, Copy, Debug, Default)]
pub struct KOfN;

impl RedundancyPolicy for KOfN {
    fn name(&self) -> &'static str {
        "k-of-n"
    }

    fn threshold(&self, chunk: &Chunk) -> u32 {
        chunk.data_frags
    }
}

//! In-memory view of the fleet
//!
//! Topology, node health and per-node block counts, mirrored from the
//! metadata store at load time and kept current by the engine afterwards.

use fleetstore_common::types::{Block, NodeHealth, NodeId, TierId};
use fleetstore_placement::{HealthTracker, NodeLoad, Topology};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Which record sets have been loaded from the store
#[derive(Debug, Default)]
pub struct LoadState {
    nodes: AtomicBool,
    tiers: AtomicBool,
    blocks: AtomicBool,
}

impl LoadState {
    pub fn set_nodes(&self) {
        self.nodes.store(true, Ordering::SeqCst);
    }

    pub fn set_tiers(&self) {
        self.tiers.store(true, Ordering::SeqCst);
    }

    pub fn set_blocks(&self) {
        self.blocks.store(true, Ordering::SeqCst);
    }

    /// Nodes, tiers and blocks are all loaded
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.nodes.load(Ordering::SeqCst) && self.tiers.load(Ordering::SeqCst) && self.blocks.load(Ordering::SeqCst)
    }
}

/// Per-tier figures of the overview
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TierOverview {
    pub name: String,
    pub nodes: usize,
    pub blocks: u64,
    pub stored_bytes: u64,
}

/// Fleet-wide summary for administrators
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FleetOverview {
    pub online: usize,
    pub has_issues: usize,
    pub offline: usize,
    pub decommissioned: usize,
    pub tiers: HashMap<TierId, TierOverview>,
    pub blocks: u64,
    pub stored_bytes: u64,
    pub under_replicated: usize,
    pub unreconstructable: usize,
}

pub struct Fleet {
    pub topology: RwLock<Topology>,
    pub health: RwLock<HealthTracker>,
    load: RwLock<NodeLoad>,
    pub loaded: LoadState,
}

impl Fleet {
    #[must_use]
    pub fn new(offline_after: Duration) -> Self {
        Self {
            topology: RwLock::new(Topology::new()),
            health: RwLock::new(HealthTracker::new(offline_after)),
            load: RwLock::new(NodeLoad::new()),
            loaded: LoadState::default(),
        }
    }

    /// Eligible nodes of a tier, sorted
    #[must_use]
    pub fn eligible_nodes(&self, tier: TierId) -> Vec<NodeId> {
        let health = self.health.read();
        self.topology.read().eligible_nodes(tier, &health)
    }

    /// A node counts toward redundancy while it is active and not OFFLINE
    #[must_use]
    pub fn is_serving(&self, node: &NodeId) -> bool {
        let active = self
            .topology
            .read()
            .node(node)
            .is_some_and(|n| !n.decommissioned);
        active && self.health.read().is_eligible(node)
    }

    #[must_use]
    pub fn load_snapshot(&self) -> NodeLoad {
        self.load.read().clone()
    }

    /// Rebuild block counts from durable blocks
    pub fn reset_load(&self, blocks: &[Block]) {
        let mut load = NodeLoad::new();
        for block in blocks.iter().filter(|b| !b.is_pending()) {
            *load.entry(block.node).or_insert(0) += 1;
        }
        *self.load.write() = load;
    }

    pub fn add_load(&self, node: NodeId) {
        *self.load.write().entry(node).or_insert(0) += 1;
    }

    pub fn remove_load(&self, node: NodeId, count: u64) {
        if let Some(n) = self.load.write().get_mut(&node) {
            *n = n.saturating_sub(count);
        }
    }

    /// Summarize the fleet; `None` until nodes, tiers and blocks are loaded
    #[must_use]
    pub fn overview(&self, blocks: &[Block], under_replicated: usize, unreconstructable: usize) -> Option<FleetOverview> {
        if !self.loaded.is_complete() {
            return None;
        }
        let topology = self.topology.read();
        let health = self.health.read();
        let mut overview = FleetOverview {
            under_replicated,
            unreconstructable,
            ..FleetOverview::default()
        };
        for tier in topology.tiers() {
            overview.tiers.insert(
                tier.id,
                TierOverview {
                    name: tier.name.clone(),
                    ..TierOverview::default()
                },
            );
        }
        for node in topology.nodes() {
            if node.decommissioned {
                overview.decommissioned += 1;
                continue;
            }
            match health.health(&node.id).unwrap_or(NodeHealth::Offline) {
                NodeHealth::Online => overview.online += 1,
                NodeHealth::HasIssues => overview.has_issues += 1,
                NodeHealth::Offline => overview.offline += 1,
            }
            if let Some(tier) = overview.tiers.get_mut(&node.tier) {
                tier.nodes += 1;
            }
        }
        for block in blocks.iter().filter(|b| !b.is_pending()) {
            overview.blocks += 1;
            overview.stored_bytes += block.size;
            if let Some(tier) = overview.tiers.get_mut(&block.tier) {
                tier.blocks += 1;
                tier.stored_bytes += block.size;
            }
        }
        Some(overview)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_state_requires_all_three() {
        let state = LoadState::default();
        state.set_blocks();
        assert!(!state.is_complete());
        state.set_nodes();
        assert!(!state.is_complete());
        state.set_tiers();
        assert!(state.is_complete());
    }

    #[test]
    fn test_overview_withheld_until_loaded() {
        let fleet = Fleet::new(Duration::from_secs(300));
        fleet.loaded.set_nodes();
        fleet.loaded.set_blocks();
        // blocks alone must not unlock the overview
        assert!(fleet.overview(&[], 0, 0).is_none());
        fleet.loaded.set_tiers();
        assert_eq!(fleet.overview(&[], 0, 0), Some(FleetOverview::default()));
    }
}

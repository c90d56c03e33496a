//! Fleet topology: tiers and the nodes serving them

use crate::error::{PlacementError, PlacementResult};
use crate::health::HealthTracker;
use fleetstore_common::types::{Node, NodeId, Tier, TierId};
use std::collections::HashMap;

#[derive(Clone, Debug, Default)]
pub struct Topology {
    /// Incremented on every change
    pub version: u64,
    nodes: HashMap<NodeId, Node>,
    tiers: HashMap<TierId, Tier>,
}

impl Topology {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a tier after validating its policy
    pub fn upsert_tier(&mut self, tier: Tier) -> PlacementResult<()> {
        tier.validate()?;
        self.tiers.insert(tier.id, tier);
        self.version += 1;
        Ok(())
    }

    /// Add or replace a node; its tier must exist
    pub fn upsert_node(&mut self, node: Node) -> PlacementResult<()> {
        if !self.tiers.contains_key(&node.tier) {
            return Err(PlacementError::UnknownTier(node.tier));
        }
        self.nodes.insert(node.id, node);
        self.version += 1;
        Ok(())
    }

    /// Mark a node permanently removed; it keeps its record but is never
    /// chosen again
    pub fn decommission(&mut self, node: &NodeId) -> PlacementResult<Node> {
        let entry = self.nodes.get_mut(node).ok_or(PlacementError::UnknownNode(*node))?;
        entry.decommissioned = true;
        self.version += 1;
        Ok(entry.clone())
    }

    pub fn remove_node(&mut self, node: &NodeId) -> Option<Node> {
        let removed = self.nodes.remove(node);
        if removed.is_some() {
            self.version += 1;
        }
        removed
    }

    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn tier(&self, id: &TierId) -> PlacementResult<&Tier> {
        self.tiers.get(id).ok_or(PlacementError::UnknownTier(*id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn tiers(&self) -> impl Iterator<Item = &Tier> {
        self.tiers.values()
    }

    /// Active (not decommissioned) nodes of a tier
    pub fn tier_nodes(&self, tier: TierId) -> impl Iterator<Item = &Node> {
        self.nodes
            .values()
            .filter(move |n| n.tier == tier && !n.decommissioned)
    }

    /// Active nodes of a tier that are not OFFLINE
    #[must_use]
    pub fn eligible_nodes(&self, tier: TierId, health: &HealthTracker) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .tier_nodes(tier)
            .filter(|n| health.is_eligible(&n.id))
            .map(|n| n.id)
            .collect();
        nodes.sort();
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetstore_common::types::{NodeHealth, SystemId};
    use std::time::Duration;
    use tokio::time::Instant;

    #[test]
    fn test_eligible_excludes_offline_and_decommissioned() {
        let system = SystemId::new();
        let tier = Tier::new(system, "hot", 3, 1).unwrap();
        let mut topology = Topology::new();
        topology.upsert_tier(tier.clone()).unwrap();

        let mut health = HealthTracker::new(Duration::from_secs(300));
        let now = Instant::now();
        let nodes: Vec<Node> = (0..4)
            .map(|i| Node::new(system, tier.id, format!("n{i}"), format!("10.0.0.{i}:7400")))
            .collect();
        for node in &nodes {
            topology.upsert_node(node.clone()).unwrap();
            health.track(node.id, now);
        }
        health.observe(nodes[0].id, NodeHealth::Offline, now);
        topology.decommission(&nodes[1].id).unwrap();

        let eligible = topology.eligible_nodes(tier.id, &health);
        assert_eq!(eligible.len(), 2);
        assert!(!eligible.contains(&nodes[0].id));
        assert!(!eligible.contains(&nodes[1].id));
        assert_eq!(topology.version, 6);
    }

    #[test]
    fn test_node_requires_known_tier() {
        let mut topology = Topology::new();
        let node = Node::new(SystemId::new(), TierId::new(), "n0", "10.0.0.1:7400");
        assert!(matches!(
            topology.upsert_node(node),
            Err(PlacementError::UnknownTier(_))
        ));
    }
}

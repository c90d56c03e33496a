//! Node health tracking
//!
//! Health is driven by observations (fabric events, probe results). An
//! observation older than the last one applied for a node is ignored, so
//! late deliveries never roll health back. A node whose last healthy
//! observation is older than the offline window is OFFLINE.

use fleetstore_common::types::{NodeHealth, NodeId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug)]
struct Entry {
    health: NodeHealth,
    observed_at: Instant,
    last_healthy: Instant,
}

/// Health change caused by an observation or an evaluation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthTransition {
    pub node: NodeId,
    pub from: NodeHealth,
    pub to: NodeHealth,
}

#[derive(Debug)]
pub struct HealthTracker {
    offline_after: Duration,
    entries: HashMap<NodeId, Entry>,
}

impl HealthTracker {
    #[must_use]
    pub fn new(offline_after: Duration) -> Self {
        Self {
            offline_after,
            entries: HashMap::new(),
        }
    }

    /// Start tracking a node, assumed online until observed otherwise
    pub fn track(&mut self, node: NodeId, now: Instant) {
        self.entries.entry(node).or_insert(Entry {
            health: NodeHealth::Online,
            observed_at: now,
            last_healthy: now,
        });
    }

    pub fn forget(&mut self, node: &NodeId) {
        self.entries.remove(node);
    }

    /// Apply an observation taken at `at`
    pub fn observe(&mut self, node: NodeId, health: NodeHealth, at: Instant) -> Option<HealthTransition> {
        let entry = self.entries.entry(node).or_insert(Entry {
            health,
            observed_at: at,
            last_healthy: at,
        });
        if at < entry.observed_at {
            debug!(node = %node, %health, "ignoring out-of-date observation");
            return None;
        }
        let from = entry.health;
        entry.observed_at = at;
        if health == NodeHealth::Online {
            entry.last_healthy = at;
        }
        // a failing node only goes offline once the window has passed
        let within_window = at.saturating_duration_since(entry.last_healthy) <= self.offline_after;
        let to = if health == NodeHealth::Offline || within_window {
            health
        } else {
            NodeHealth::Offline
        };
        entry.health = to;
        (from != to).then(|| {
            info!(node = %node, %from, %to, "node health changed");
            HealthTransition { node, from, to }
        })
    }

    /// Demote nodes with no healthy observation within the window
    pub fn evaluate(&mut self, now: Instant) -> Vec<HealthTransition> {
        let mut changed = Vec::new();
        for (node, entry) in &mut self.entries {
            if entry.health != NodeHealth::Offline
                && now.saturating_duration_since(entry.last_healthy) > self.offline_after
            {
                info!(node = %node, from = %entry.health, "node went offline");
                changed.push(HealthTransition {
                    node: *node,
                    from: entry.health,
                    to: NodeHealth::Offline,
                });
                entry.health = NodeHealth::Offline;
            }
        }
        changed
    }

    #[must_use]
    pub fn health(&self, node: &NodeId) -> Option<NodeHealth> {
        self.entries.get(node).map(|e| e.health)
    }

    #[must_use]
    pub fn is_eligible(&self, node: &NodeId) -> bool {
        self.health(node).is_some_and(NodeHealth::is_eligible)
    }

    #[must_use]
    pub fn snapshot(&self) -> HashMap<NodeId, NodeHealth> {
        self.entries.iter().map(|(id, e)| (*id, e.health)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(300);

    #[test]
    fn test_older_observation_ignored() {
        let mut tracker = HealthTracker::new(WINDOW);
        let node = NodeId::new();
        let t0 = Instant::now();
        tracker.track(node, t0);

        let later = t0 + Duration::from_secs(20);
        assert!(tracker.observe(node, NodeHealth::HasIssues, later).is_some());
        assert!(tracker.observe(node, NodeHealth::Online, t0 + Duration::from_secs(10)).is_none());
        assert_eq!(tracker.health(&node), Some(NodeHealth::HasIssues));
    }

    #[test]
    fn test_offline_after_window_without_healthy_observation() {
        let mut tracker = HealthTracker::new(WINDOW);
        let node = NodeId::new();
        let t0 = Instant::now();
        tracker.track(node, t0);
        tracker.observe(node, NodeHealth::HasIssues, t0 + Duration::from_secs(60));

        assert!(tracker.evaluate(t0 + Duration::from_secs(299)).is_empty());
        let changed = tracker.evaluate(t0 + Duration::from_secs(301));
        assert_eq!(
            changed,
            vec![HealthTransition {
                node,
                from: NodeHealth::HasIssues,
                to: NodeHealth::Offline
            }]
        );
        assert!(!tracker.is_eligible(&node));
        assert!(tracker.evaluate(t0 + Duration::from_secs(400)).is_empty());
    }

    #[test]
    fn test_failure_past_window_is_offline() {
        let mut tracker = HealthTracker::new(WINDOW);
        let node = NodeId::new();
        let t0 = Instant::now();
        tracker.track(node, t0);
        let t = tracker.observe(node, NodeHealth::HasIssues, t0 + Duration::from_secs(400));
        assert_eq!(t.map(|t| t.to), Some(NodeHealth::Offline));
    }

    #[test]
    fn test_online_observation_revives() {
        let mut tracker = HealthTracker::new(WINDOW);
        let node = NodeId::new();
        let t0 = Instant::now();
        tracker.track(node, t0);
        tracker.evaluate(t0 + Duration::from_secs(400));
        assert_eq!(tracker.health(&node), Some(NodeHealth::Offline));

        let t = tracker.observe(node, NodeHealth::Online, t0 + Duration::from_secs(401));
        assert_eq!(t.map(|t| t.to), Some(NodeHealth::Online));
        assert!(tracker.is_eligible(&node));
    }

    #[test]
    fn test_unknown_node_not_eligible() {
        let tracker = HealthTracker::new(WINDOW);
        assert!(!tracker.is_eligible(&NodeId::new()));
    }
}

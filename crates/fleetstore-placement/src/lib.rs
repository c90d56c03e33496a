//! Fleetstore Placement - where fragments live
//!
//! This crate holds the fleet [`Topology`] (tiers and their nodes), the
//! [`HealthTracker`] deciding which nodes are eligible, the greedy
//! least-loaded [`Placer`] and the swappable [`RedundancyPolicy`] used to
//! classify chunks as healthy, under-replicated or unreconstructable.

pub mod error;
pub mod health;
pub mod placer;
pub mod redundancy;
pub mod topology;

pub use error::{PlacementError, PlacementResult};
pub use health::{HealthTracker, HealthTransition};
pub use placer::{FragmentPlacement, NodeLoad, PlacementPlan, Placer, effective_replicas};
pub use redundancy::{FullReplication, KOfN, Redundancy, RedundancyPolicy};
pub use topology::Topology;

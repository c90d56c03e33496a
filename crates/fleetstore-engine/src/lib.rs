//! Fleetstore Engine - placement, replication and repair
//!
//! The [`Engine`] decides where the fragments of every chunk live, writes
//! and reads them over the fabric under per-category admission control,
//! and keeps placement consistent with node health: nodes that go OFFLINE
//! or are decommissioned get their fragments re-replicated elsewhere, and
//! provisional blocks that never finalized are collected.
//!
//! [`AuthorizedEngine`] is the token-gated face used by boundary adapters.

pub mod admission;
pub mod authorized;
pub mod background;
pub mod engine;
pub mod error;
pub mod fleet;
pub mod repair;

pub use admission::{Admission, AdmissionStats, OpKind};
pub use authorized::AuthorizedEngine;
pub use background::BackgroundTasks;
pub use engine::{ChunkData, Engine, INTERNAL_ACCOUNT};
pub use error::{EngineError, EngineResult, ReplicationError};
pub use fleet::{FleetOverview, TierOverview};
pub use repair::{ChunkCondition, RepairReport, RepairSummary};

//! Fleetstore Common - Shared types and utilities
//!
//! This crate provides the data model (nodes, tiers, chunks, blocks),
//! configuration, the common error type and the retry policy used by the
//! fabric and the placement engine.

pub mod config;
pub mod error;
pub mod retry;
pub mod types;

pub use config::FleetConfig;
pub use error::{Error, Result};
pub use retry::{Backoff, RetryError, RetryPolicy};
pub use types::*;

//! Fleetstore Usage - ops counters and bandwidth accounting
//!
//! Endpoints periodically send an [`EndpointReport`]; [`UsageStore`] folds it
//! into per-system ops counters, windowed bandwidth reports and endpoint
//! group samples kept in the metadata store. The engine adds its own derived
//! transfer records through [`UsageStore::record_transfer`].

pub mod error;
pub mod report;
pub mod store;

pub use error::{UsageError, UsageResult};
pub use report::{
    BandwidthQuery, BandwidthReport, BandwidthSample, EndpointGroupReport, EndpointReport, EndpointSample,
    GroupReportQuery, OpsCounters, OpsReport, window_bounds,
};
pub use store::UsageStore;

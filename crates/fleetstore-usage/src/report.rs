//! Reports sent by endpoints and the records derived from them

use fleetstore_common::types::SystemId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-operation counters of one reporting interval
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsReport {
    #[serde(default)]
    pub usage: BTreeMap<String, i64>,
    #[serde(default)]
    pub errors: BTreeMap<String, i64>,
}

/// Traffic of one bucket/account pair
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthSample {
    pub bucket: String,
    pub account: String,
    pub read_bytes: i64,
    pub write_bytes: i64,
    pub read_count: i64,
    pub write_count: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointSample {
    pub hostname: String,
    pub cpu: f64,
    pub memory: f64,
}

/// Periodic report of one endpoint
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointReport {
    /// Unix milliseconds at which the interval was sampled
    pub timestamp_ms: u64,
    pub endpoint_group: String,
    pub endpoint: EndpointSample,
    pub ops: OpsReport,
    pub bandwidth: Vec<BandwidthSample>,
}

impl EndpointReport {
    /// Op names become document paths, so they cannot be empty or dotted
    pub(crate) fn invalid_op_name(&self) -> Option<&str> {
        self.ops
            .usage
            .keys()
            .chain(self.ops.errors.keys())
            .find(|name| name.is_empty() || name.contains('.'))
            .map(String::as_str)
    }
}

/// Accumulated ops counters of a system
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsCounters {
    #[serde(default)]
    pub usage: BTreeMap<String, i64>,
    #[serde(default)]
    pub errors: BTreeMap<String, i64>,
}

/// One window of traffic for system × endpoint group × bucket × account
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthReport {
    pub start_time: u64,
    pub end_time: u64,
    pub system: SystemId,
    pub endpoint_group: String,
    pub bucket: String,
    pub account: String,
    #[serde(default)]
    pub read_bytes: i64,
    #[serde(default)]
    pub write_bytes: i64,
    #[serde(default)]
    pub read_count: i64,
    #[serde(default)]
    pub write_count: i64,
}

/// One window of endpoint samples for system × endpoint group
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EndpointGroupReport {
    pub start_time: u64,
    pub end_time: u64,
    pub system: SystemId,
    pub group_name: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointSample>,
}

/// Selection of bandwidth reports; empty lists match everything
#[derive(Clone, Debug, Default)]
pub struct BandwidthQuery {
    pub system: Option<SystemId>,
    pub endpoint_groups: Vec<String>,
    pub buckets: Vec<String>,
    pub accounts: Vec<String>,
    /// Windows starting at or after this time
    pub since: Option<u64>,
    /// Windows ending at or before this time
    pub till: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct GroupReportQuery {
    pub system: Option<SystemId>,
    pub groups: Vec<String>,
    pub since: Option<u64>,
    pub till: Option<u64>,
}

/// Inclusive bounds of the window holding `timestamp_ms`
#[must_use]
pub const fn window_bounds(timestamp_ms: u64, window_ms: u64) -> (u64, u64) {
    let window = if window_ms == 0 { 1 } else { window_ms };
    let start = timestamp_ms / window * window;
    (start, start + window - 1)
}

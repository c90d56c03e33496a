//! Usage accounting collections
//!
//! Three collections are kept per deployment:
//!
//! - `objectstats`: one document per system with `usage.<op>` and
//!   `errors.<op>` counters
//! - `usagereports`: traffic per window × system × endpoint group × bucket ×
//!   account
//! - `endpointgroupreports`: endpoint samples per window × system × group
//!
//! Every update is an upsert with field increments or pushes so concurrent
//! reporters never lose updates. Records are schema-checked in warn mode.

use crate::error::{UsageError, UsageResult};
use crate::report::{
    BandwidthQuery, BandwidthReport, BandwidthSample, EndpointGroupReport, EndpointReport, GroupReportQuery,
    OpsCounters, window_bounds,
};
use fleetstore_common::config::UsageConfig;
use fleetstore_common::types::SystemId;
use fleetstore_meta_store::{
    CollectionDef, CollectionSchema, FieldSpec, FieldType, Filter, IndexSpec, MetaClient, MetaStoreError, Update,
    ValidationMode,
};
use futures::stream::{self, TryStreamExt};
use tracing::{debug, trace};

pub const OPS_COUNTERS: &str = "objectstats";
pub const BANDWIDTH_REPORTS: &str = "usagereports";
pub const ENDPOINT_GROUP_REPORTS: &str = "endpointgroupreports";

fn ops_collection() -> CollectionDef {
    CollectionDef::new(
        OPS_COUNTERS,
        CollectionSchema::new([
            FieldSpec::required("system", FieldType::ObjectId),
            FieldSpec::optional("usage", FieldType::IntegerMap),
            FieldSpec::optional("errors", FieldType::IntegerMap),
        ]),
        ValidationMode::Warn,
    )
    .with_index(IndexSpec::unique(["system"]))
}

fn bandwidth_collection() -> CollectionDef {
    CollectionDef::new(
        BANDWIDTH_REPORTS,
        CollectionSchema::new([
            FieldSpec::required("start_time", FieldType::Integer),
            FieldSpec::required("end_time", FieldType::Integer),
            FieldSpec::required("system", FieldType::ObjectId),
            FieldSpec::required("endpoint_group", FieldType::String),
            FieldSpec::required("bucket", FieldType::String),
            FieldSpec::required("account", FieldType::String),
            FieldSpec::optional("read_bytes", FieldType::Integer),
            FieldSpec::optional("write_bytes", FieldType::Integer),
            FieldSpec::optional("read_count", FieldType::Integer),
            FieldSpec::optional("write_count", FieldType::Integer),
        ]),
        ValidationMode::Warn,
    )
    .with_index(IndexSpec::lookup(["start_time"]))
}

fn group_collection() -> CollectionDef {
    CollectionDef::new(
        ENDPOINT_GROUP_REPORTS,
        CollectionSchema::new([
            FieldSpec::required("start_time", FieldType::Integer),
            FieldSpec::required("end_time", FieldType::Integer),
            FieldSpec::required("system", FieldType::ObjectId),
            FieldSpec::required("group_name", FieldType::String),
            FieldSpec::optional("endpoints", FieldType::Array),
        ]),
        ValidationMode::Warn,
    )
    .with_index(IndexSpec::lookup(["start_time"]))
}

fn window_filter(filter: Filter, since: Option<u64>, till: Option<u64>) -> Filter {
    let filter = match since {
        Some(since) => filter.gte("start_time", since),
        None => filter,
    };
    match till {
        Some(till) => filter.lte("end_time", till),
        None => filter,
    }
}

fn system_filter(system: Option<SystemId>) -> Filter {
    match system {
        Some(system) => Filter::all().eq("system", system.to_string()),
        None => Filter::all(),
    }
}

impl BandwidthQuery {
    fn to_filter(&self) -> Filter {
        let mut filter = system_filter(self.system);
        if !self.endpoint_groups.is_empty() {
            filter = filter.one_of("endpoint_group", self.endpoint_groups.iter().cloned());
        }
        if !self.buckets.is_empty() {
            filter = filter.one_of("bucket", self.buckets.iter().cloned());
        }
        if !self.accounts.is_empty() {
            filter = filter.one_of("account", self.accounts.iter().cloned());
        }
        window_filter(filter, self.since, self.till)
    }
}

impl GroupReportQuery {
    fn to_filter(&self) -> Filter {
        let mut filter = system_filter(self.system);
        if !self.groups.is_empty() {
            filter = filter.one_of("group_name", self.groups.iter().cloned());
        }
        window_filter(filter, self.since, self.till)
    }
}

/// Usage accounting on top of the metadata store
#[derive(Clone)]
pub struct UsageStore {
    client: MetaClient,
    window_ms: u64,
    concurrency: usize,
}

impl UsageStore {
    /// Register the usage collections with `client`
    pub async fn register(client: MetaClient, config: &UsageConfig) -> UsageResult<Self> {
        for def in [ops_collection(), bandwidth_collection(), group_collection()] {
            client.define_collection(def).await?;
        }
        Ok(Self {
            client,
            window_ms: config.window_ms.max(1),
            concurrency: config.report_concurrency.max(1),
        })
    }

    #[must_use]
    pub const fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Fold one endpoint report into all three collections
    pub async fn accept_endpoint_report(&self, system: SystemId, report: &EndpointReport) -> UsageResult<()> {
        if let Some(name) = report.invalid_op_name() {
            return Err(UsageError::InvalidReport(format!("op name {name:?}")));
        }
        debug!(%system, group = %report.endpoint_group, samples = report.bandwidth.len(), "accepting endpoint report");
        tokio::try_join!(
            self.update_ops_counters(system, report),
            self.update_bandwidth(system, &report.endpoint_group, report.timestamp_ms, &report.bandwidth),
            self.update_group_report(system, report),
        )?;
        Ok(())
    }

    /// Add one bandwidth sample outside an endpoint report
    pub async fn record_transfer(
        &self,
        system: SystemId,
        endpoint_group: &str,
        timestamp_ms: u64,
        sample: BandwidthSample,
    ) -> UsageResult<()> {
        self.update_bandwidth(system, endpoint_group, timestamp_ms, std::slice::from_ref(&sample))
            .await
    }

    pub async fn get_ops_counters(&self, system: SystemId) -> UsageResult<OpsCounters> {
        let counters: Option<OpsCounters> = self
            .client
            .collection(OPS_COUNTERS)?
            .find_one(&system_filter(Some(system)))
            .await?;
        Ok(counters.unwrap_or_default())
    }

    pub async fn reset_ops_counters(&self, system: SystemId) -> UsageResult<()> {
        let removed = self
            .client
            .collection(OPS_COUNTERS)?
            .delete(&system_filter(Some(system)))
            .await?;
        debug!(%system, removed, "ops counters reset");
        Ok(())
    }

    pub async fn get_bandwidth_reports(&self, query: &BandwidthQuery) -> UsageResult<Vec<BandwidthReport>> {
        Ok(self
            .client
            .collection(BANDWIDTH_REPORTS)?
            .find(&query.to_filter())
            .await?)
    }

    /// Remove matching bandwidth reports, returning how many were removed
    pub async fn clean_bandwidth_reports(&self, query: &BandwidthQuery) -> UsageResult<u64> {
        let removed = self
            .client
            .collection(BANDWIDTH_REPORTS)?
            .delete(&query.to_filter())
            .await?;
        debug!(removed, "bandwidth reports cleaned");
        Ok(removed)
    }

    pub async fn get_endpoint_group_reports(&self, query: &GroupReportQuery) -> UsageResult<Vec<EndpointGroupReport>> {
        Ok(self
            .client
            .collection(ENDPOINT_GROUP_REPORTS)?
            .find(&query.to_filter())
            .await?)
    }

    pub async fn clean_endpoint_group_reports(&self, query: &GroupReportQuery) -> UsageResult<u64> {
        let removed = self
            .client
            .collection(ENDPOINT_GROUP_REPORTS)?
            .delete(&query.to_filter())
            .await?;
        debug!(removed, "endpoint group reports cleaned");
        Ok(removed)
    }

    async fn update_ops_counters(&self, system: SystemId, report: &EndpointReport) -> UsageResult<()> {
        let ops = &report.ops;
        if ops.usage.is_empty() && ops.errors.is_empty() {
            return Ok(());
        }
        let mut update = Update::new();
        for (op, count) in &ops.usage {
            update = update.inc(format!("usage.{op}"), *count);
        }
        for (op, count) in &ops.errors {
            update = update.inc(format!("errors.{op}"), *count);
        }
        self.client
            .collection(OPS_COUNTERS)?
            .upsert(&system_filter(Some(system)), &update)
            .await?;
        Ok(())
    }

    async fn update_bandwidth(
        &self,
        system: SystemId,
        endpoint_group: &str,
        timestamp_ms: u64,
        samples: &[BandwidthSample],
    ) -> UsageResult<()> {
        let (start, end) = window_bounds(timestamp_ms, self.window_ms);
        let collection = self.client.collection(BANDWIDTH_REPORTS)?;
        let collection = &collection;

        stream::iter(samples.iter().map(Ok::<_, MetaStoreError>))
            .try_for_each_concurrent(self.concurrency, |sample| async move {
                let filter = Filter::all()
                    .eq("start_time", start)
                    .eq("end_time", end)
                    .eq("system", system.to_string())
                    .eq("endpoint_group", endpoint_group)
                    .eq("bucket", sample.bucket.as_str())
                    .eq("account", sample.account.as_str());
                let update = Update::new()
                    .inc("read_bytes", sample.read_bytes)
                    .inc("write_bytes", sample.write_bytes)
                    .inc("read_count", sample.read_count)
                    .inc("write_count", sample.write_count);
                trace!(bucket = %sample.bucket, account = %sample.account, start, "bandwidth upsert");
                collection.upsert(&filter, &update).await.map(|_| ())
            })
            .await?;
        Ok(())
    }

    async fn update_group_report(&self, system: SystemId, report: &EndpointReport) -> UsageResult<()> {
        let (start, end) = window_bounds(report.timestamp_ms, self.window_ms);
        let filter = Filter::all()
            .eq("start_time", start)
            .eq("end_time", end)
            .eq("system", system.to_string())
            .eq("group_name", report.endpoint_group.as_str());
        let sample = serde_json::to_value(&report.endpoint).map_err(MetaStoreError::from)?;
        self.client
            .collection(ENDPOINT_GROUP_REPORTS)?
            .upsert(&filter, &Update::new().push("endpoints", sample))
            .await?;
        Ok(())
    }
}

//! Configuration types for Fleetstore
//!
//! Every section deserializes from TOML with per-field defaults, so a
//! partial file only overrides what it names. Durations are configured in
//! milliseconds and exposed as [`Duration`] accessors.

use crate::retry::{Backoff, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub fabric: FabricConfig,
    pub engine: EngineConfig,
    pub meta: MetaConfig,
    pub usage: UsageConfig,
    pub logging: LoggingConfig,
}

/// Connectivity fabric configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Signaling endpoint used to negotiate NAT-traversed connections
    /// (`host:port`, empty disables NAT traversal)
    pub rendezvous_address: String,
    /// Public relay/STUN servers offered during negotiation
    pub stun_servers: Vec<String>,
    /// Keepalive probe interval on connected connections
    pub alive_delay_ms: u64,
    /// Backoff before retrying a failed connection
    pub reconnect_delay_ms: u64,
    /// Inactivity threshold before a connection is marked stale
    pub connection_data_stale_ms: u64,
    /// Interval of the staleness sweep
    pub check_stale_conns_ms: u64,
    /// Run the staleness sweep at all
    pub do_stale_check: bool,
    /// Timeout for generic request/response pairs
    pub connection_default_timeout_ms: u64,
    /// Timeout for full-duplex streaming transfers
    pub stream_timeout_ms: u64,
    /// Additional NAT negotiation rounds after the first
    pub ice_retry: u32,
    /// Connection attempts before a peer is reported unreachable
    pub connect_attempts: u32,
    /// Try a direct channel first
    pub use_direct: bool,
    /// Fall back to NAT traversal
    pub use_nat_traversal: bool,
    /// Largest number of payload bytes carried by one transport frame
    pub max_frame_payload: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            rendezvous_address: String::new(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            alive_delay_ms: 10_000,
            reconnect_delay_ms: 5_000,
            connection_data_stale_ms: 5 * 60 * 1000,
            check_stale_conns_ms: 60_000,
            do_stale_check: true,
            connection_default_timeout_ms: 15_000,
            stream_timeout_ms: 25_000,
            ice_retry: 1,
            connect_attempts: 3,
            use_direct: true,
            use_nat_traversal: true,
            max_frame_payload: 16 * 1024,
        }
    }
}

impl FabricConfig {
    #[must_use]
    pub const fn alive_delay(&self) -> Duration {
        Duration::from_millis(self.alive_delay_ms)
    }

    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        Duration::from_millis(self.connection_data_stale_ms)
    }

    #[must_use]
    pub const fn stale_check_interval(&self) -> Duration {
        Duration::from_millis(self.check_stale_conns_ms)
    }

    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_default_timeout_ms)
    }

    #[must_use]
    pub const fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    /// Retry policy for establishing a connection to a peer
    #[must_use]
    pub const fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.connect_attempts, self.reconnect_delay())
    }

    /// Retry policy for NAT negotiation rounds
    #[must_use]
    pub const fn negotiation_policy(&self) -> RetryPolicy {
        RetryPolicy::with_retries(self.ice_retry, Backoff::Fixed(self.reconnect_delay()))
    }
}

/// Placement and replication engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub read_concurrency: usize,
    pub write_concurrency: usize,
    pub read_range_concurrency: usize,
    pub replicate_concurrency: usize,
    /// Additional replication attempts before a chunk is under-replicated
    pub replicate_retry: u32,
    /// Additional attempts for a single block read or write
    pub io_retry: u32,
    /// Minimum distinct nodes applied to tiers created from configuration
    pub min_node_number: u32,
    /// Age after which a block still in upload mode is an orphan
    pub pending_grace_ms: u64,
    /// A node with no healthy observation for this long is offline
    pub node_offline_after_ms: u64,
    /// Interval of the orphan collection loop
    pub gc_interval_ms: u64,
    /// Interval of the node health evaluation loop
    pub health_check_interval_ms: u64,
    /// Interval of the full redundancy scan
    pub repair_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_concurrency: 32,
            write_concurrency: 16,
            read_range_concurrency: 8,
            replicate_concurrency: 32,
            replicate_retry: 3,
            io_retry: 2,
            min_node_number: 3,
            pending_grace_ms: 30 * 60 * 1000,
            node_offline_after_ms: 5 * 60 * 1000,
            gc_interval_ms: 10 * 60 * 1000,
            health_check_interval_ms: 30_000,
            repair_interval_ms: 15 * 60 * 1000,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub const fn pending_grace(&self) -> Duration {
        Duration::from_millis(self.pending_grace_ms)
    }

    #[must_use]
    pub const fn node_offline_after(&self) -> Duration {
        Duration::from_millis(self.node_offline_after_ms)
    }

    #[must_use]
    pub const fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    #[must_use]
    pub const fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    #[must_use]
    pub const fn repair_interval(&self) -> Duration {
        Duration::from_millis(self.repair_interval_ms)
    }
}

/// Metadata store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    /// Store location: a redb file path, or `memory:` for an ephemeral store
    pub url: String,
    /// Fixed delay between initial connection attempts
    pub connect_retry_interval_ms: u64,
    /// Longest tolerated disconnection before the process must restart
    pub connect_max_wait_ms: u64,
    /// Timeout of administrative replica-set commands
    pub command_timeout_ms: u64,
    /// Use majority acknowledgement for critical writes
    pub majority_writes: bool,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            url: "/var/lib/fleetstore/meta.redb".to_string(),
            connect_retry_interval_ms: 1000,
            connect_max_wait_ms: 10 * 60 * 1000,
            command_timeout_ms: 5000,
            majority_writes: true,
        }
    }
}

impl MetaConfig {
    #[must_use]
    pub const fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_interval_ms)
    }

    #[must_use]
    pub const fn connect_max_wait(&self) -> Duration {
        Duration::from_millis(self.connect_max_wait_ms)
    }

    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Usage accounting configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    /// Aggregation window for bandwidth and endpoint reports
    pub window_ms: u64,
    /// Bandwidth records upserted concurrently per report
    pub report_concurrency: usize,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            report_concurrency: 10,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FleetConfig::default();
        assert_eq!(config.fabric.alive_delay(), Duration::from_secs(10));
        assert_eq!(config.fabric.stale_after(), Duration::from_secs(300));
        assert_eq!(config.engine.write_concurrency, 16);
        assert_eq!(config.engine.replicate_retry, 3);
        assert_eq!(config.engine.min_node_number, 3);
        assert_eq!(config.fabric.max_frame_payload, 16 * 1024);
    }

    #[test]
    fn test_negotiation_policy_counts_first_round() {
        let fabric = FabricConfig {
            ice_retry: 1,
            ..FabricConfig::default()
        };
        assert_eq!(fabric.negotiation_policy().max_attempts, 2);
    }
}

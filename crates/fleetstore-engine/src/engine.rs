//! Placement and replication engine
//!
//! The [`Engine`] maps chunks to nodes and drives block I/O over the fabric.
//! Every chunk operation runs inside an admission slot of its category.
//! Writes are two-phase: a PENDING block record is created (or reused, the
//! record is unique per chunk, fragment and node), the fragment is sent to
//! the node, and the record is finalized only after the node acknowledged.
//! Blocks left PENDING past the grace period are collected as orphans.

use crate::admission::{Admission, AdmissionStats, OpKind};
use crate::error::{EngineError, EngineResult};
use crate::fleet::{Fleet, FleetOverview};
use crate::repair::ChunkCondition;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use fleetstore_common::config::EngineConfig;
use fleetstore_common::retry::{Backoff, RetryPolicy};
use fleetstore_common::types::{
    Block, BlockId, Chunk, ChunkId, Node, NodeHealth, NodeId, Tier, digest_fragments,
};
use fleetstore_fabric::{
    Fabric, FabricError, FabricEvent, FabricEventKind, NodeRequest, NodeResponse, PeerAddress, RemoteErrorCode,
};
use fleetstore_meta_store::{MetaStoreError, PlacementRecords};
use fleetstore_placement::{KOfN, PlacementError, Placer, RedundancyPolicy};
use fleetstore_usage::{BandwidthSample, UsageStore};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Account charged for operations issued by the engine itself
pub const INTERNAL_ACCOUNT: &str = "internal";

/// Endpoint group under which the engine reports its transfers
const USAGE_GROUP: &str = "engine";

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Transient failures worth another attempt at the same node
pub(crate) fn is_transient(e: &EngineError) -> bool {
    match e {
        EngineError::Connection(FabricError::Remote(remote)) => {
            !matches!(remote.code, RemoteErrorCode::NotFound | RemoteErrorCode::BadRequest)
        }
        other => other.is_retryable(),
    }
}

fn describe(response: &NodeResponse) -> String {
    match response {
        NodeResponse::Written { block, size } => format!("written {block} ({size} bytes)"),
        NodeResponse::Data { block, data, .. } => format!("data {block} ({} bytes)", data.len()),
        NodeResponse::Deleted { count } => format!("deleted {count}"),
        NodeResponse::Pong => "pong".to_string(),
        NodeResponse::SelfTest { payload } => format!("self test ({} bytes)", payload.len()),
    }
}

/// A put may reuse a chunk id only for identical content and layout
fn same_chunk(stored: &Chunk, chunk: &Chunk) -> EngineResult<()> {
    let same = stored.system == chunk.system
        && stored.tier == chunk.tier
        && stored.size == chunk.size
        && stored.digest == chunk.digest
        && stored.data_frags == chunk.data_frags
        && stored.total_frags == chunk.total_frags
        && stored.frag_size == chunk.frag_size;
    if same {
        Ok(())
    } else {
        warn!(chunk = %chunk.id, "chunk id reused with different content");
        Err(EngineError::ChunkConflict(chunk.id))
    }
}

/// Fragments read back for a chunk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkData {
    pub chunk: Chunk,
    /// Every fragment that could be read, by index
    pub fragments: BTreeMap<u32, Bytes>,
}

impl ChunkData {
    /// The chunk's bytes when its data fragments were all read
    #[must_use]
    pub fn assemble(&self) -> Option<Bytes> {
        let mut out = BytesMut::with_capacity(self.chunk.size as usize);
        for index in 0..self.chunk.data_frags {
            out.extend_from_slice(self.fragments.get(&index)?);
        }
        out.truncate(self.chunk.size as usize);
        Some(out.freeze())
    }
}

pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) records: PlacementRecords,
    pub(crate) fabric: Arc<Fabric>,
    pub(crate) usage: Option<UsageStore>,
    pub(crate) policy: Arc<dyn RedundancyPolicy>,
    pub(crate) placer: Placer,
    pub(crate) admission: Admission,
    pub(crate) fleet: Fleet,
    pub(crate) conditions: DashMap<ChunkId, ChunkCondition>,
    /// Nodes that went OFFLINE and still need their blocks repaired
    pub(crate) offline_queue: Mutex<BTreeSet<NodeId>>,
}

impl Engine {
    #[must_use]
    pub fn new(config: EngineConfig, records: PlacementRecords, fabric: Arc<Fabric>) -> Self {
        Self {
            admission: Admission::new(&config),
            fleet: Fleet::new(config.node_offline_after()),
            config,
            records,
            fabric,
            usage: None,
            policy: Arc::new(KOfN),
            placer: Placer,
            conditions: DashMap::new(),
            offline_queue: Mutex::new(BTreeSet::new()),
        }
    }

    /// Replace the redundancy policy (k-of-n by default)
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn RedundancyPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Record transfer volumes in the usage store
    #[must_use]
    pub fn with_usage(mut self, usage: UsageStore) -> Self {
        self.usage = Some(usage);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub const fn records(&self) -> &PlacementRecords {
        &self.records
    }

    #[must_use]
    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    #[must_use]
    pub fn admission_stats(&self, kind: OpKind) -> AdmissionStats {
        self.admission.stats(kind)
    }

    #[must_use]
    pub fn node_health(&self, node: &NodeId) -> Option<NodeHealth> {
        self.fleet.health.read().health(node)
    }

    #[must_use]
    pub fn tier(&self, id: &fleetstore_common::types::TierId) -> Option<Tier> {
        self.fleet.topology.read().tier(id).ok().cloned()
    }

    pub(crate) fn io_policy(&self) -> RetryPolicy {
        RetryPolicy::with_retries(self.config.io_retry, Backoff::Fixed(self.fabric.config().reconnect_delay()))
    }

    // ---- Topology ----

    /// Mirror tiers, nodes and blocks from the store
    pub async fn load(&self) -> EngineResult<()> {
        let tiers = self.records.list_tiers().await?;
        {
            let mut topology = self.fleet.topology.write();
            for tier in tiers {
                topology.upsert_tier(tier)?;
            }
        }
        self.fleet.loaded.set_tiers();

        let nodes = self.records.list_nodes().await?;
        let now = Instant::now();
        for node in nodes {
            self.adopt_node(node, now)?;
        }
        self.fleet.loaded.set_nodes();

        let blocks = self.records.list_blocks().await?;
        self.fleet.reset_load(&blocks);
        self.fleet.loaded.set_blocks();

        let topology = self.fleet.topology.read();
        info!(
            tiers = topology.tiers().count(),
            nodes = topology.nodes().count(),
            blocks = blocks.len(),
            "fleet loaded"
        );
        Ok(())
    }

    fn adopt_node(&self, node: Node, now: Instant) -> EngineResult<()> {
        if !node.decommissioned {
            self.fabric
                .register_peer(PeerAddress::new(node.id, node.address.clone()));
            self.fleet.health.write().track(node.id, now);
        }
        self.fleet.topology.write().upsert_node(node)?;
        Ok(())
    }

    /// Register a storage node with the fleet
    pub async fn add_node(&self, node: Node) -> EngineResult<()> {
        self.fleet.topology.read().tier(&node.tier)?;
        self.records.put_node(&node).await?;
        info!(node = %node.id, name = %node.name, address = %node.address, "node added");
        self.adopt_node(node, Instant::now())
    }

    /// Create or change a tier's placement policy
    pub async fn set_tier_policy(&self, tier: Tier) -> EngineResult<()> {
        tier.validate()?;
        if tier.min_nodes < self.config.min_node_number {
            return Err(fleetstore_common::Error::InvalidTier(format!(
                "tier {} spans {} nodes, the fleet requires at least {}",
                tier.name, tier.min_nodes, self.config.min_node_number
            ))
            .into());
        }
        self.records.put_tier(&tier).await?;
        info!(tier = %tier.id, name = %tier.name, min_nodes = tier.min_nodes, replicas = tier.replicas, "tier policy set");
        self.fleet.topology.write().upsert_tier(tier)?;
        Ok(())
    }

    /// Permanently remove a node and re-place its blocks elsewhere
    pub async fn decommission_node(&self, id: NodeId) -> EngineResult<crate::repair::RepairSummary> {
        if !self.records.decommission_node(id).await? {
            return Err(EngineError::NodeNotFound(id));
        }
        self.fleet.topology.write().decommission(&id)?;
        self.fleet.health.write().forget(&id);
        self.fabric.forget_peer(&id);
        self.offline_queue.lock().remove(&id);
        info!(node = %id, "node decommissioned");
        self.repair_node(id).await
    }

    // ---- Health ----

    /// Apply a health observation; OFFLINE transitions queue the node for repair
    pub fn observe_node(&self, node: NodeId, health: NodeHealth) {
        let transition = self.fleet.health.write().observe(node, health, Instant::now());
        if let Some(t) = transition
            && t.to == NodeHealth::Offline
        {
            self.offline_queue.lock().insert(node);
        }
    }

    /// Translate a fabric lifecycle event into a health observation
    pub fn apply_event(&self, event: &FabricEvent) {
        match event.kind {
            FabricEventKind::Connected { .. } | FabricEventKind::Reconnected { .. } => {
                self.observe_node(event.peer, NodeHealth::Online);
            }
            FabricEventKind::Closed | FabricEventKind::Unreachable => {
                self.observe_node(event.peer, NodeHealth::HasIssues);
            }
            // idle links are not a health signal
            FabricEventKind::Stale => {}
        }
    }

    /// Ping every active node
    pub async fn probe_nodes(&self) {
        let nodes: Vec<NodeId> = self
            .fleet
            .topology
            .read()
            .nodes()
            .filter(|n| !n.decommissioned)
            .map(|n| n.id)
            .collect();
        let probes = nodes.into_iter().map(|node| async move {
            let health = match self.fabric.send(node, NodeRequest::Ping).await {
                Ok(NodeResponse::Pong) => NodeHealth::Online,
                Ok(other) => {
                    warn!(node = %node, response = %describe(&other), "unexpected ping response");
                    NodeHealth::HasIssues
                }
                Err(e) => {
                    debug!(node = %node, error = %e, "ping failed");
                    NodeHealth::HasIssues
                }
            };
            self.observe_node(node, health);
        });
        join_all(probes).await;
    }

    /// Nodes that just went OFFLINE, from queued observations and the
    /// staleness window
    pub(crate) fn take_offline(&self) -> BTreeSet<NodeId> {
        let transitions = self.fleet.health.write().evaluate(Instant::now());
        let mut offline = std::mem::take(&mut *self.offline_queue.lock());
        offline.extend(
            transitions
                .into_iter()
                .filter(|t| t.to == NodeHealth::Offline)
                .map(|t| t.node),
        );
        offline
    }

    // ---- Chunk I/O ----

    fn check_fragments(chunk: &Chunk, fragments: &[Bytes]) -> EngineResult<()> {
        if fragments.len() != chunk.total_frags as usize {
            return Err(fleetstore_common::Error::invalid_argument(format!(
                "chunk {} expects {} fragments, got {}",
                chunk.id,
                chunk.total_frags,
                fragments.len()
            ))
            .into());
        }
        if fragments.iter().any(|f| f.len() as u64 != chunk.frag_size) {
            return Err(fleetstore_common::Error::invalid_argument("fragment size differs from the chunk's").into());
        }
        if digest_fragments(fragments) != chunk.digest {
            return Err(EngineError::Integrity(chunk.id));
        }
        Ok(())
    }

    /// Record the chunk, or confirm that the stored record describes the same
    /// content. Returns whether this call created the record.
    async fn claim_chunk(&self, chunk: &Chunk) -> EngineResult<bool> {
        if let Some(stored) = self.records.get_chunk(chunk.id).await? {
            return same_chunk(&stored, chunk).map(|()| false);
        }
        match self.records.insert_chunk(chunk).await {
            Ok(()) => Ok(true),
            // a concurrent put of the same chunk inserted it first
            Err(MetaStoreError::DuplicateKey { .. }) => {
                let stored = self
                    .records
                    .get_chunk(chunk.id)
                    .await?
                    .ok_or(EngineError::ChunkNotFound(chunk.id))?;
                same_chunk(&stored, chunk).map(|()| false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Store a chunk as an internal operation
    pub async fn put_chunk(&self, chunk: &Chunk, fragments: &[Bytes]) -> EngineResult<Vec<Block>> {
        self.put_chunk_as(INTERNAL_ACCOUNT, chunk, fragments).await
    }

    /// Place and write every fragment of a chunk.
    ///
    /// Re-invoking the call for a chunk that already has blocks rewrites the
    /// same (fragment, node) targets instead of placing it again. A chunk id
    /// already stored with other content is rejected.
    pub async fn put_chunk_as(&self, account: &str, chunk: &Chunk, fragments: &[Bytes]) -> EngineResult<Vec<Block>> {
        Self::check_fragments(chunk, fragments)?;
        let _slot = self.admission.acquire(OpKind::Write).await;
        let tier = self.fleet.topology.read().tier(&chunk.tier)?.clone();
        let created = self.claim_chunk(chunk).await?;

        let existing = self.records.blocks_of_chunk(chunk.id).await?;
        let targets: Vec<(u32, NodeId)> = if existing.is_empty() {
            let eligible = self.fleet.eligible_nodes(tier.id);
            let plan = self
                .placer
                .place(chunk.id, &tier, chunk.total_frags, &eligible, &self.fleet.load_snapshot())?;
            debug!(chunk = %chunk.id, nodes = plan.distinct_nodes().len(), replicas = plan.replicas, "chunk placed");
            plan.targets().collect()
        } else {
            // copies on nodes that stopped serving are left for repair
            let serving: Vec<(u32, NodeId)> = existing
                .iter()
                .filter(|b| self.fleet.is_serving(&b.node))
                .map(|b| (b.fragment, b.node))
                .collect();
            if serving.is_empty() {
                return Err(PlacementError::InsufficientNodes {
                    tier: tier.id,
                    available: 0,
                    required: tier.min_nodes as usize,
                }
                .into());
            }
            serving
        };

        let writes = targets.iter().map(|&(fragment, node)| async move {
            let data = fragments.get(fragment as usize).cloned().ok_or_else(|| {
                fleetstore_common::Error::invalid_argument(format!("chunk {} has no fragment {fragment}", chunk.id))
            })?;
            self.write_block(chunk, fragment, node, data).await
        });
        let mut blocks = Vec::with_capacity(targets.len());
        let mut failure = None;
        for result in join_all(writes).await {
            match result {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(err) = failure {
            if created {
                warn!(chunk = %chunk.id, error = %err, "chunk write failed, discarding partial blocks");
                if let Err(e) = self.discard_chunk(chunk.id).await {
                    warn!(chunk = %chunk.id, error = %e, "discarding partial chunk failed");
                }
            } else {
                warn!(chunk = %chunk.id, error = %err, "chunk rewrite failed, keeping stored blocks");
            }
            return Err(err);
        }

        let written = chunk.frag_size * blocks.len() as u64;
        self.record_transfer(account, chunk, 0, written).await;
        info!(chunk = %chunk.id, tier = %tier.name, blocks = blocks.len(), "chunk stored");
        Ok(blocks)
    }

    /// Write one block, retrying transient failures against the same node
    pub(crate) async fn write_block(&self, chunk: &Chunk, fragment: u32, node: NodeId, data: Bytes) -> EngineResult<Block> {
        self.io_policy()
            .run("write_block", is_transient, |_| self.write_block_once(chunk, fragment, node, data.clone()))
            .await
            .map_err(Into::into)
    }

    pub(crate) async fn write_block_once(
        &self,
        chunk: &Chunk,
        fragment: u32,
        node: NodeId,
        data: Bytes,
    ) -> EngineResult<Block> {
        let block = self
            .records
            .upsert_pending_block(&Block::pending(chunk, fragment, node))
            .await?;
        if !block.is_pending() {
            return Ok(block);
        }

        let response = match self.fabric.send(node, NodeRequest::write(block.id, data)).await {
            Ok(response) => response,
            Err(e) => {
                self.observe_node(node, NodeHealth::HasIssues);
                return Err(e.into());
            }
        };
        match response {
            NodeResponse::Written { block: id, size } if id == block.id && size == block.size => {}
            other => {
                return Err(EngineError::BadResponse {
                    node,
                    request: "write_block",
                    detail: describe(&other),
                });
            }
        }
        self.observe_node(node, NodeHealth::Online);

        if !self.records.finalize_block(block.id).await? {
            return Err(MetaStoreError::Unavailable(format!("block {} vanished before finalize", block.id)).into());
        }
        self.fleet.add_load(node);
        debug!(block = %block.id, chunk = %chunk.id, fragment, node = %node, "block finalized");
        Ok(Block {
            upload_mode: false,
            ..block
        })
    }

    /// Durable copies grouped by fragment, serving nodes first
    pub(crate) fn readable_copies(&self, blocks: &[Block]) -> BTreeMap<u32, Vec<Block>> {
        let mut copies: BTreeMap<u32, Vec<Block>> = BTreeMap::new();
        for block in blocks.iter().filter(|b| !b.is_pending()) {
            copies.entry(block.fragment).or_default().push(block.clone());
        }
        for list in copies.values_mut() {
            list.sort_by_key(|b| !self.fleet.is_serving(&b.node));
        }
        copies
    }

    async fn read_block(&self, block: &Block, request: NodeRequest, expected: u64) -> EngineResult<Bytes> {
        let name = request.name();
        self.io_policy()
            .run(name, is_transient, |_| {
                let request = request.clone();
                async move {
                    let response = match self.fabric.send(block.node, request).await {
                        Ok(response) => response,
                        Err(e) => {
                            self.observe_node(block.node, NodeHealth::HasIssues);
                            return Err(e.into());
                        }
                    };
                    let data = response.into_data()?;
                    if data.len() as u64 != expected {
                        return Err(EngineError::BadResponse {
                            node: block.node,
                            request: name,
                            detail: format!("{} bytes, expected {expected}", data.len()),
                        });
                    }
                    self.observe_node(block.node, NodeHealth::Online);
                    Ok(data)
                }
            })
            .await
            .map_err(Into::into)
    }

    /// Read a fragment from the first copy that answers
    pub(crate) async fn read_fragment(&self, copies: &[Block]) -> Option<Bytes> {
        for block in copies {
            match self
                .read_block(block, NodeRequest::ReadBlock { block: block.id }, block.size)
                .await
            {
                Ok(data) => return Some(data),
                Err(e) => warn!(block = %block.id, node = %block.node, error = %e, "fragment copy unreadable"),
            }
        }
        None
    }

    pub async fn get_chunk(&self, id: ChunkId) -> EngineResult<ChunkData> {
        self.get_chunk_as(INTERNAL_ACCOUNT, id).await
    }

    /// Read every fragment of a chunk that can be read.
    ///
    /// Fails when fewer fragments than the redundancy threshold answer, and
    /// verifies the digest when all fragments were read.
    pub async fn get_chunk_as(&self, account: &str, id: ChunkId) -> EngineResult<ChunkData> {
        let _slot = self.admission.acquire(OpKind::Read).await;
        let chunk = self.records.get_chunk(id).await?.ok_or(EngineError::ChunkNotFound(id))?;
        let blocks = self.records.blocks_of_chunk(id).await?;
        let copies = self.readable_copies(&blocks);

        let reads = chunk.fragment_indices().map(|fragment| {
            let candidates = copies.get(&fragment).map(Vec::as_slice).unwrap_or_default();
            async move { (fragment, self.read_fragment(candidates).await) }
        });
        let fragments: BTreeMap<u32, Bytes> = join_all(reads)
            .await
            .into_iter()
            .filter_map(|(fragment, data)| data.map(|d| (fragment, d)))
            .collect();

        let available = fragments.len() as u32;
        let required = self.policy.threshold(&chunk);
        if available < required {
            warn!(chunk = %id, available, required, "chunk unreadable");
            return Err(EngineError::Unreadable {
                chunk: id,
                available,
                required,
            });
        }
        if available == chunk.total_frags {
            let ordered: Vec<&Bytes> = fragments.values().collect();
            if digest_fragments(&ordered) != chunk.digest {
                return Err(EngineError::Integrity(id));
            }
        }

        self.record_transfer(account, &chunk, chunk.frag_size * u64::from(available), 0)
            .await;
        Ok(ChunkData { chunk, fragments })
    }

    /// Read `len` bytes at `offset` of one fragment
    pub async fn read_range(&self, id: ChunkId, fragment: u32, offset: u64, len: u64) -> EngineResult<Bytes> {
        let _slot = self.admission.acquire(OpKind::ReadRange).await;
        let chunk = self.records.get_chunk(id).await?.ok_or(EngineError::ChunkNotFound(id))?;
        chunk.validate_fragment(fragment)?;
        if offset.checked_add(len).is_none_or(|end| end > chunk.frag_size) {
            return Err(fleetstore_common::Error::invalid_argument(format!(
                "range {offset}+{len} exceeds fragment size {}",
                chunk.frag_size
            ))
            .into());
        }

        let blocks = self.records.blocks_of_chunk(id).await?;
        let copies = self.readable_copies(&blocks).remove(&fragment).unwrap_or_default();
        for block in &copies {
            let request = NodeRequest::ReadRange {
                block: block.id,
                offset,
                len,
            };
            match self.read_block(block, request, len).await {
                Ok(data) => {
                    self.record_transfer(INTERNAL_ACCOUNT, &chunk, len, 0).await;
                    return Ok(data);
                }
                Err(e) => warn!(block = %block.id, node = %block.node, error = %e, "range read failed"),
            }
        }
        Err(EngineError::Unreadable {
            chunk: id,
            available: 0,
            required: 1,
        })
    }

    /// Delete a chunk, its block records and (best effort) the stored blocks
    pub async fn delete_chunk(&self, id: ChunkId) -> EngineResult<()> {
        let _slot = self.admission.acquire(OpKind::Write).await;
        if self.records.get_chunk(id).await?.is_none() {
            return Err(EngineError::ChunkNotFound(id));
        }
        let removed = self.discard_chunk(id).await?;
        info!(chunk = %id, blocks = removed, "chunk deleted");
        Ok(())
    }

    async fn discard_chunk(&self, id: ChunkId) -> EngineResult<u64> {
        let blocks = self.records.blocks_of_chunk(id).await?;
        self.delete_on_nodes(&blocks).await;
        let removed = self.records.delete_chunk(id).await?;
        for block in blocks.iter().filter(|b| !b.is_pending()) {
            self.fleet.remove_load(block.node, 1);
        }
        self.conditions.remove(&id);
        Ok(removed)
    }

    /// Ask nodes to drop blocks; failures are logged and left to the nodes
    pub(crate) async fn delete_on_nodes(&self, blocks: &[Block]) {
        let mut by_node: BTreeMap<NodeId, Vec<BlockId>> = BTreeMap::new();
        for block in blocks {
            by_node.entry(block.node).or_default().push(block.id);
        }
        let deletes = by_node.into_iter().map(|(node, blocks)| async move {
            let count = blocks.len();
            match self.fabric.send(node, NodeRequest::DeleteBlocks { blocks }).await {
                Ok(_) => debug!(node = %node, count, "blocks deleted on node"),
                Err(e) => warn!(node = %node, count, error = %e, "block delete on node failed"),
            }
        });
        join_all(deletes).await;
    }

    // ---- Orphans ----

    pub async fn collect_orphans(&self) -> EngineResult<usize> {
        self.collect_orphans_at(now_ms()).await
    }

    /// Delete PENDING blocks whose id is older than the grace period
    pub async fn collect_orphans_at(&self, now_ms: u64) -> EngineResult<usize> {
        let grace = self.config.pending_grace_ms;
        let orphans: Vec<Block> = self
            .records
            .pending_blocks()
            .await?
            .into_iter()
            .filter(|b| {
                b.id.created_at_ms()
                    .is_some_and(|created| now_ms.saturating_sub(created) > grace)
            })
            .collect();
        if orphans.is_empty() {
            return Ok(0);
        }
        self.delete_on_nodes(&orphans).await;
        let ids: Vec<BlockId> = orphans.iter().map(|b| b.id).collect();
        let removed = self.records.delete_blocks(&ids).await?;
        info!(removed, "orphan blocks collected");
        Ok(removed as usize)
    }

    // ---- Reporting ----

    /// Fleet summary; `None` until the fleet has been loaded
    pub async fn overview(&self) -> EngineResult<Option<FleetOverview>> {
        if !self.fleet.loaded.is_complete() {
            return Ok(None);
        }
        let blocks = self.records.list_blocks().await?;
        let (under, unrecon) = self.condition_counts();
        Ok(self.fleet.overview(&blocks, under, unrecon))
    }

    async fn record_transfer(&self, account: &str, chunk: &Chunk, read: u64, written: u64) {
        let Some(usage) = &self.usage else {
            return;
        };
        let bucket = self
            .fleet
            .topology
            .read()
            .tier(&chunk.tier)
            .map_or_else(|_| chunk.tier.to_string(), |t| t.name.clone());
        let sample = BandwidthSample {
            bucket,
            account: account.to_string(),
            read_bytes: i64::try_from(read).unwrap_or(i64::MAX),
            write_bytes: i64::try_from(written).unwrap_or(i64::MAX),
            read_count: i64::from(read > 0),
            write_count: i64::from(written > 0),
        };
        if let Err(e) = usage.record_transfer(chunk.system, USAGE_GROUP, now_ms(), sample).await {
            warn!(chunk = %chunk.id, error = %e, "usage record dropped");
        }
    }
}

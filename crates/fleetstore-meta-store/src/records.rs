//! Typed placement collections: nodes, tiers, chunks and blocks.

use crate::backend::{CollectionDef, IndexSpec};
use crate::client::MetaClient;
use crate::document::{Filter, Update};
use crate::error::{MetaStoreError, MetaStoreResult};
use crate::schema::{CollectionSchema, FieldSpec, FieldType, ValidationMode};
use fleetstore_common::types::{Block, BlockId, Chunk, ChunkId, Node, NodeId, SystemId, Tier, TierId};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const NODES: &str = "nodes";
pub const TIERS: &str = "tiers";
pub const CHUNKS: &str = "datachunks";
pub const BLOCKS: &str = "datablocks";

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Serialize, Deserialize)]
struct StoredNode {
    #[serde(rename = "_id")]
    id: NodeId,
    system: SystemId,
    name: String,
    address: String,
    tier: TierId,
    #[serde(default, skip_serializing_if = "is_false")]
    decommissioned: bool,
}

impl From<StoredNode> for Node {
    fn from(n: StoredNode) -> Self {
        Self {
            id: n.id,
            system: n.system,
            name: n.name,
            address: n.address,
            tier: n.tier,
            decommissioned: n.decommissioned,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredTier {
    #[serde(rename = "_id")]
    id: TierId,
    system: SystemId,
    name: String,
    min_nodes: u32,
    replicas: u32,
}

impl From<StoredTier> for Tier {
    fn from(t: StoredTier) -> Self {
        Self {
            id: t.id,
            system: t.system,
            name: t.name,
            min_nodes: t.min_nodes,
            replicas: t.replicas,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredChunk {
    #[serde(rename = "_id")]
    id: ChunkId,
    system: SystemId,
    tier: TierId,
    size: u64,
    digest: String,
    data_frags: u32,
    total_frags: u32,
    frag_size: u64,
}

impl From<&Chunk> for StoredChunk {
    fn from(c: &Chunk) -> Self {
        Self {
            id: c.id,
            system: c.system,
            tier: c.tier,
            size: c.size,
            digest: c.digest.clone(),
            data_frags: c.data_frags,
            total_frags: c.total_frags,
            frag_size: c.frag_size,
        }
    }
}

impl From<StoredChunk> for Chunk {
    fn from(c: StoredChunk) -> Self {
        Self {
            id: c.id,
            system: c.system,
            tier: c.tier,
            size: c.size,
            digest: c.digest,
            data_frags: c.data_frags,
            total_frags: c.total_frags,
            frag_size: c.frag_size,
        }
    }
}

/// Persisted block layout; `upload_mode` is only present while pending
#[derive(Serialize, Deserialize)]
struct StoredBlock {
    #[serde(rename = "_id")]
    id: BlockId,
    system: SystemId,
    tier: TierId,
    node: NodeId,
    chunk: ChunkId,
    fragment: u32,
    size: u64,
    #[serde(default, skip_serializing_if = "is_false")]
    upload_mode: bool,
}

impl From<&Block> for StoredBlock {
    fn from(b: &Block) -> Self {
        Self {
            id: b.id,
            system: b.system,
            tier: b.tier,
            node: b.node,
            chunk: b.chunk,
            fragment: b.fragment,
            size: b.size,
            upload_mode: b.upload_mode,
        }
    }
}

impl From<StoredBlock> for Block {
    fn from(b: StoredBlock) -> Self {
        Self {
            id: b.id,
            system: b.system,
            tier: b.tier,
            node: b.node,
            chunk: b.chunk,
            fragment: b.fragment,
            size: b.size,
            upload_mode: b.upload_mode,
        }
    }
}

fn node_collection() -> CollectionDef {
    CollectionDef::new(
        NODES,
        CollectionSchema::new([
            FieldSpec::required("system", FieldType::ObjectId),
            FieldSpec::required("name", FieldType::String),
            FieldSpec::required("address", FieldType::String),
            FieldSpec::required("tier", FieldType::ObjectId),
            FieldSpec::optional("decommissioned", FieldType::Boolean),
        ]),
        ValidationMode::Strict,
    )
    .with_index(IndexSpec::unique(["system", "name"]))
}

fn tier_collection() -> CollectionDef {
    CollectionDef::new(
        TIERS,
        CollectionSchema::new([
            FieldSpec::required("system", FieldType::ObjectId),
            FieldSpec::required("name", FieldType::String),
            FieldSpec::required("min_nodes", FieldType::Integer),
            FieldSpec::required("replicas", FieldType::Integer),
        ]),
        ValidationMode::Strict,
    )
    .with_index(IndexSpec::unique(["system", "name"]))
}

fn chunk_collection() -> CollectionDef {
    CollectionDef::new(
        CHUNKS,
        CollectionSchema::new([
            FieldSpec::required("system", FieldType::ObjectId),
            FieldSpec::required("tier", FieldType::ObjectId),
            FieldSpec::required("size", FieldType::Integer),
            FieldSpec::required("digest", FieldType::String),
            FieldSpec::required("data_frags", FieldType::Integer),
            FieldSpec::required("total_frags", FieldType::Integer),
            FieldSpec::required("frag_size", FieldType::Integer),
        ]),
        ValidationMode::Strict,
    )
}

fn block_collection() -> CollectionDef {
    CollectionDef::new(
        BLOCKS,
        CollectionSchema::new([
            FieldSpec::required("system", FieldType::ObjectId),
            FieldSpec::required("tier", FieldType::ObjectId),
            FieldSpec::required("node", FieldType::ObjectId),
            FieldSpec::required("chunk", FieldType::ObjectId),
            FieldSpec::required("fragment", FieldType::Integer),
            FieldSpec::required("size", FieldType::Integer),
            FieldSpec::optional("upload_mode", FieldType::Boolean),
        ]),
        ValidationMode::Strict,
    )
    .with_index(IndexSpec::unique(["chunk", "fragment", "node"]))
    .with_index(IndexSpec::lookup(["chunk"]))
    .with_index(IndexSpec::lookup(["node"]))
}

/// Typed access to the placement collections
#[derive(Clone)]
pub struct PlacementRecords {
    client: MetaClient,
}

impl PlacementRecords {
    /// Register the placement collections with `client`
    pub async fn register(client: MetaClient) -> MetaStoreResult<Self> {
        for def in [node_collection(), tier_collection(), chunk_collection(), block_collection()] {
            client.define_collection(def).await?;
        }
        Ok(Self { client })
    }

    #[must_use]
    pub const fn client(&self) -> &MetaClient {
        &self.client
    }

    // ---- Nodes ----

    /// Insert or replace a node record
    pub async fn put_node(&self, node: &Node) -> MetaStoreResult<()> {
        let nodes = self.client.collection(NODES)?;
        let mut update = Update::new()
            .set("system", node.system.to_string())
            .set("name", node.name.clone())
            .set("address", node.address.clone())
            .set("tier", node.tier.to_string());
        update = if node.decommissioned {
            update.set("decommissioned", true)
        } else {
            update.unset("decommissioned")
        };
        nodes.upsert(&Filter::by_id(node.id.to_string()), &update).await?;
        Ok(())
    }

    pub async fn get_node(&self, id: NodeId) -> MetaStoreResult<Option<Node>> {
        let nodes = self.client.collection(NODES)?;
        let found: Option<StoredNode> = nodes.find_one(&Filter::by_id(id.to_string())).await?;
        Ok(found.map(Node::from))
    }

    pub async fn list_nodes(&self) -> MetaStoreResult<Vec<Node>> {
        let nodes = self.client.collection(NODES)?;
        let found: Vec<StoredNode> = nodes.find(&Filter::all()).await?;
        Ok(found.into_iter().map(Node::from).collect())
    }

    /// Flag a node as permanently removed
    pub async fn decommission_node(&self, id: NodeId) -> MetaStoreResult<bool> {
        let nodes = self.client.collection(NODES)?;
        let result = nodes
            .update_one(&Filter::by_id(id.to_string()), &Update::new().set("decommissioned", true))
            .await?;
        Ok(result.matched > 0)
    }

    // ---- Tiers ----

    /// Insert or replace a tier record
    pub async fn put_tier(&self, tier: &Tier) -> MetaStoreResult<()> {
        let tiers = self.client.collection(TIERS)?;
        let update = Update::new()
            .set("system", tier.system.to_string())
            .set("name", tier.name.clone())
            .set("min_nodes", tier.min_nodes)
            .set("replicas", tier.replicas);
        tiers.upsert(&Filter::by_id(tier.id.to_string()), &update).await?;
        Ok(())
    }

    pub async fn get_tier(&self, id: TierId) -> MetaStoreResult<Option<Tier>> {
        let tiers = self.client.collection(TIERS)?;
        let found: Option<StoredTier> = tiers.find_one(&Filter::by_id(id.to_string())).await?;
        Ok(found.map(Tier::from))
    }

    pub async fn list_tiers(&self) -> MetaStoreResult<Vec<Tier>> {
        let tiers = self.client.collection(TIERS)?;
        let found: Vec<StoredTier> = tiers.find(&Filter::all()).await?;
        Ok(found.into_iter().map(Tier::from).collect())
    }

    // ---- Chunks ----

    pub async fn insert_chunk(&self, chunk: &Chunk) -> MetaStoreResult<()> {
        let chunks = self.client.collection(CHUNKS)?;
        chunks.insert(&StoredChunk::from(chunk)).await?;
        Ok(())
    }

    pub async fn get_chunk(&self, id: ChunkId) -> MetaStoreResult<Option<Chunk>> {
        let chunks = self.client.collection(CHUNKS)?;
        let found: Option<StoredChunk> = chunks.find_one(&Filter::by_id(id.to_string())).await?;
        Ok(found.map(Chunk::from))
    }

    pub async fn list_chunks(&self) -> MetaStoreResult<Vec<Chunk>> {
        let chunks = self.client.collection(CHUNKS)?;
        let found: Vec<StoredChunk> = chunks.find(&Filter::all()).await?;
        Ok(found.into_iter().map(Chunk::from).collect())
    }

    /// Delete a chunk and every block record referencing it
    pub async fn delete_chunk(&self, id: ChunkId) -> MetaStoreResult<u64> {
        let blocks = self.client.collection(BLOCKS)?;
        let removed = blocks.delete(&Filter::all().eq("chunk", id.to_string())).await?;
        let chunks = self.client.collection(CHUNKS)?;
        chunks.delete(&Filter::by_id(id.to_string())).await?;
        Ok(removed)
    }

    // ---- Blocks ----

    /// Record a provisional block for `(chunk, fragment, node)`.
    ///
    /// Idempotent on that key: when a record already exists it is returned
    /// unchanged, so a repeated write targets the same block id.
    pub async fn upsert_pending_block(&self, block: &Block) -> MetaStoreResult<Block> {
        if let Some(existing) = self.find_block_by_key(block).await? {
            debug!(block = %existing.id, chunk = %block.chunk, fragment = block.fragment, "reusing block record");
            return Ok(existing);
        }
        let blocks = self.client.collection(BLOCKS)?;
        let mut pending = StoredBlock::from(block);
        pending.upload_mode = true;
        match blocks.insert(&pending).await {
            Ok(_) => Ok(Block::from(pending)),
            Err(MetaStoreError::DuplicateKey { .. }) => self
                .find_block_by_key(block)
                .await?
                .ok_or_else(|| MetaStoreError::Unavailable("block record vanished during upsert".to_string())),
            Err(e) => Err(e),
        }
    }

    async fn find_block_by_key(&self, block: &Block) -> MetaStoreResult<Option<Block>> {
        let blocks = self.client.collection(BLOCKS)?;
        let filter = Filter::all()
            .eq("chunk", block.chunk.to_string())
            .eq("fragment", block.fragment)
            .eq("node", block.node.to_string());
        let found: Option<StoredBlock> = blocks.find_one(&filter).await?;
        Ok(found.map(Block::from))
    }

    /// Mark a block durable. Returns whether the record exists.
    pub async fn finalize_block(&self, id: BlockId) -> MetaStoreResult<bool> {
        let blocks = self.client.collection(BLOCKS)?;
        let result = blocks
            .update_one(&Filter::by_id(id.to_string()), &Update::new().unset("upload_mode"))
            .await?;
        Ok(result.matched > 0)
    }

    pub async fn delete_blocks(&self, ids: &[BlockId]) -> MetaStoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let blocks = self.client.collection(BLOCKS)?;
        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        blocks.delete(&Filter::all().one_of("_id", ids)).await
    }

    async fn blocks_where(&self, filter: &Filter) -> MetaStoreResult<Vec<Block>> {
        let blocks = self.client.collection(BLOCKS)?;
        let found: Vec<StoredBlock> = blocks.find(filter).await?;
        Ok(found.into_iter().map(Block::from).collect())
    }

    pub async fn blocks_of_chunk(&self, chunk: ChunkId) -> MetaStoreResult<Vec<Block>> {
        self.blocks_where(&Filter::all().eq("chunk", chunk.to_string())).await
    }

    pub async fn blocks_on_node(&self, node: NodeId) -> MetaStoreResult<Vec<Block>> {
        self.blocks_where(&Filter::all().eq("node", node.to_string())).await
    }

    /// Blocks still in upload mode
    pub async fn pending_blocks(&self) -> MetaStoreResult<Vec<Block>> {
        self.blocks_where(&Filter::all().eq("upload_mode", true)).await
    }

    pub async fn list_blocks(&self) -> MetaStoreResult<Vec<Block>> {
        self.blocks_where(&Filter::all()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MEMORY_URL;
    use fleetstore_common::config::MetaConfig;

    async fn records() -> PlacementRecords {
        let client = MetaClient::new(MetaConfig {
            url: MEMORY_URL.to_string(),
            ..MetaConfig::default()
        });
        let records = PlacementRecords::register(client.clone()).await.unwrap();
        client.connect().await.unwrap();
        records
    }

    fn chunk() -> Chunk {
        Chunk::from_fragments(SystemId::new(), TierId::new(), 8, 1, &[vec![7u8; 8]]).unwrap()
    }

    #[tokio::test]
    async fn test_pending_block_upsert_is_idempotent() {
        let records = records().await;
        let chunk = chunk();
        records.insert_chunk(&chunk).await.unwrap();
        let node = NodeId::new();

        let first = records.upsert_pending_block(&Block::pending(&chunk, 0, node)).await.unwrap();
        let again = records.upsert_pending_block(&Block::pending(&chunk, 0, node)).await.unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(records.blocks_of_chunk(chunk.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_finalize_clears_upload_mode() {
        let records = records().await;
        let chunk = chunk();
        let block = records
            .upsert_pending_block(&Block::pending(&chunk, 0, NodeId::new()))
            .await
            .unwrap();
        assert!(block.is_pending());
        assert_eq!(records.pending_blocks().await.unwrap().len(), 1);

        assert!(records.finalize_block(block.id).await.unwrap());
        assert!(records.pending_blocks().await.unwrap().is_empty());
        let stored = records.blocks_of_chunk(chunk.id).await.unwrap();
        assert!(!stored[0].is_pending());
    }

    #[tokio::test]
    async fn test_delete_chunk_removes_blocks() {
        let records = records().await;
        let chunk = chunk();
        records.insert_chunk(&chunk).await.unwrap();
        for _ in 0..3 {
            records
                .upsert_pending_block(&Block::pending(&chunk, 0, NodeId::new()))
                .await
                .unwrap();
        }

        assert_eq!(records.delete_chunk(chunk.id).await.unwrap(), 3);
        assert!(records.get_chunk(chunk.id).await.unwrap().is_none());
        assert!(records.list_blocks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_node_and_tier_roundtrip() {
        let records = records().await;
        let system = SystemId::new();
        let tier = Tier::new(system, "hot", 3, 2).unwrap();
        records.put_tier(&tier).await.unwrap();
        let node = Node::new(system, tier.id, "node-1", "127.0.0.1:7000");
        records.put_node(&node).await.unwrap();

        assert_eq!(records.get_tier(tier.id).await.unwrap(), Some(tier));
        assert!(records.decommission_node(node.id).await.unwrap());
        let stored = records.get_node(node.id).await.unwrap().unwrap();
        assert!(stored.decommissioned);
    }
}

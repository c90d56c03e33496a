//! In-process fleet for engine scenarios: memory store, memory transport
//! and storage agents keeping blocks in a map.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use fleetstore_common::config::{EngineConfig, FabricConfig, MetaConfig};
use fleetstore_common::types::{BlockId, Chunk, Node, SystemId, Tier};
use fleetstore_engine::Engine;
use fleetstore_fabric::{
    Fabric, MemoryTransport, NodeRequest, NodeResponse, RemoteError, RequestHandler, Transport, TransportKind,
};
use fleetstore_meta_store::{MEMORY_URL, MetaClient, PlacementRecords};
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

const FRAME: usize = 1024;

/// Storage agent keeping blocks in memory
#[derive(Default)]
pub struct MemoryAgent {
    blocks: Mutex<HashMap<BlockId, Bytes>>,
    writes: AtomicUsize,
    write_delay: Mutex<Option<Duration>>,
    stall_first_write: Mutex<Option<Duration>>,
    fail_writes: AtomicBool,
}

impl MemoryAgent {
    pub fn block(&self, id: &BlockId) -> Option<Bytes> {
        self.blocks.lock().get(id).cloned()
    }

    pub fn put(&self, id: BlockId, data: Bytes) {
        self.blocks.lock().insert(id, data);
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Write requests received, including repeated ones
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = Some(delay);
    }

    /// Hold only the next write for `delay`
    pub fn stall_first_write(&self, delay: Duration) {
        *self.stall_first_write.lock() = Some(delay);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RequestHandler for MemoryAgent {
    async fn handle(&self, request: NodeRequest) -> Result<NodeResponse, RemoteError> {
        match request {
            NodeRequest::WriteBlock { block, data, .. } => {
                self.writes.fetch_add(1, Ordering::SeqCst);
                let stall = self.stall_first_write.lock().take();
                let delay = stall.or(*self.write_delay.lock());
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if self.fail_writes.load(Ordering::SeqCst) {
                    return Err(RemoteError::io("disk full"));
                }
                let size = data.len() as u64;
                self.blocks.lock().insert(block, data);
                Ok(NodeResponse::Written { block, size })
            }
            NodeRequest::ReadBlock { block } => self
                .block(&block)
                .map(|data| NodeResponse::data(block, data))
                .ok_or_else(|| RemoteError::not_found(block.to_string())),
            NodeRequest::ReadRange { block, offset, len } => {
                let data = self
                    .block(&block)
                    .ok_or_else(|| RemoteError::not_found(block.to_string()))?;
                let (start, end) = (offset as usize, (offset + len) as usize);
                if end > data.len() {
                    return Err(RemoteError::bad_request("range out of bounds"));
                }
                Ok(NodeResponse::data(block, data.slice(start..end)))
            }
            NodeRequest::DeleteBlocks { blocks } => {
                let mut stored = self.blocks.lock();
                let count = blocks.iter().filter(|b| stored.remove(b).is_some()).count();
                Ok(NodeResponse::Deleted { count: count as u64 })
            }
            NodeRequest::Ping => Ok(NodeResponse::Pong),
            NodeRequest::SelfTest { payload } => Ok(NodeResponse::SelfTest { payload }),
        }
    }
}

pub fn fabric_config() -> FabricConfig {
    FabricConfig {
        reconnect_delay_ms: 10,
        connect_attempts: 2,
        connection_default_timeout_ms: 500,
        stream_timeout_ms: 500,
        do_stale_check: false,
        use_nat_traversal: false,
        max_frame_payload: FRAME,
        ..FabricConfig::default()
    }
}

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        replicate_retry: 3,
        io_retry: 2,
        ..EngineConfig::default()
    }
}

pub async fn records() -> PlacementRecords {
    let client = MetaClient::new(MetaConfig {
        url: MEMORY_URL.to_string(),
        ..MetaConfig::default()
    });
    let records = PlacementRecords::register(client.clone()).await.unwrap();
    client.connect().await.unwrap();
    records
}

/// An engine with no nodes or tiers, not yet loaded
pub async fn bare_engine(config: EngineConfig) -> Engine {
    let transport = Arc::new(MemoryTransport::new(TransportKind::Direct, FRAME));
    let fabric = Arc::new(Fabric::with_transports(
        fabric_config(),
        vec![transport as Arc<dyn Transport>],
    ));
    Engine::new(config, records().await, fabric)
}

pub fn address(i: usize) -> String {
    format!("node-{i}:7400")
}

/// Random fragments of `size` bytes each
pub fn fragments(count: usize, size: usize) -> Vec<Bytes> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let mut buf = vec![0u8; size];
            rng.fill_bytes(&mut buf);
            Bytes::from(buf)
        })
        .collect()
}

pub struct Cluster {
    pub engine: Arc<Engine>,
    pub transport: Arc<MemoryTransport>,
    pub records: PlacementRecords,
    pub system: SystemId,
    pub tier: Tier,
    pub nodes: Vec<Node>,
    pub agents: Vec<Arc<MemoryAgent>>,
}

impl Cluster {
    pub async fn start(nodes: usize) -> Self {
        Self::with_config(nodes, engine_config(), fabric_config()).await
    }

    /// A loaded engine over `nodes` agents in one tier (3 distinct nodes,
    /// 1 replica)
    pub async fn with_config(nodes: usize, config: EngineConfig, fabric: FabricConfig) -> Self {
        let transport = Arc::new(MemoryTransport::new(TransportKind::Direct, FRAME));
        let fabric = Arc::new(Fabric::with_transports(
            fabric,
            vec![transport.clone() as Arc<dyn Transport>],
        ));
        let records = records().await;
        let engine = Arc::new(Engine::new(config, records.clone(), fabric));
        engine.load().await.unwrap();

        let system = SystemId::new();
        let tier = Tier::new(system, "hot", 3, 1).unwrap();
        engine.set_tier_policy(tier.clone()).await.unwrap();

        let mut cluster = Self {
            engine,
            transport,
            records,
            system,
            tier,
            nodes: Vec::new(),
            agents: Vec::new(),
        };
        for i in 0..nodes {
            let agent = Arc::new(MemoryAgent::default());
            cluster.transport.register(address(i), agent.clone());
            let node = Node::new(system, cluster.tier.id, format!("node-{i}"), address(i));
            cluster.engine.add_node(node.clone()).await.unwrap();
            cluster.nodes.push(node);
            cluster.agents.push(agent);
        }
        cluster
    }

    pub fn index_of(&self, node: &fleetstore_common::types::NodeId) -> usize {
        self.nodes.iter().position(|n| n.id == *node).unwrap()
    }

    pub fn agent_of(&self, node: &fleetstore_common::types::NodeId) -> &Arc<MemoryAgent> {
        &self.agents[self.index_of(node)]
    }

    pub fn set_down(&self, i: usize, down: bool) {
        self.transport.set_down(&address(i), down);
    }

    pub fn chunk(&self, fragments: &[Bytes], data_frags: u32) -> Chunk {
        let size = fragments.iter().map(|f| f.len() as u64).sum();
        Chunk::from_fragments(self.system, self.tier.id, size, data_frags, fragments).unwrap()
    }
}

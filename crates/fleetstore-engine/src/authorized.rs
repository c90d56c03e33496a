//! Token-gated entry point for boundary adapters
//!
//! Every call validates the caller's token before it reaches the engine.
//! Chunk operations need a principal of the chunk's system; fleet
//! administration needs an admin or operator of the served system.

use crate::engine::{ChunkData, Engine};
use crate::error::{EngineError, EngineResult};
use crate::fleet::FleetOverview;
use crate::repair::{ChunkCondition, RepairSummary};
use bytes::Bytes;
use fleetstore_auth::{AccessGate, AuthError, Principal};
use fleetstore_common::types::{Block, Chunk, ChunkId, Node, NodeId, SystemId, Tier};
use std::sync::Arc;
use tracing::warn;

pub struct AuthorizedEngine {
    engine: Arc<Engine>,
    gate: Arc<dyn AccessGate>,
    system: SystemId,
}

impl AuthorizedEngine {
    #[must_use]
    pub fn new(engine: Arc<Engine>, gate: Arc<dyn AccessGate>, system: SystemId) -> Self {
        Self { engine, gate, system }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    async fn principal(&self, token: &str) -> EngineResult<Principal> {
        self.gate.validate(token).await.map_err(|e| {
            warn!(reason = e.reason(), "token rejected");
            EngineError::Auth(e)
        })
    }

    async fn admin(&self, token: &str) -> EngineResult<Principal> {
        let principal = self.principal(token).await?;
        principal.require_admin(self.system).map_err(|e| denied(&principal, e))?;
        Ok(principal)
    }

    async fn member_of(&self, token: &str, system: SystemId) -> EngineResult<Principal> {
        let principal = self.principal(token).await?;
        principal.require_system(system).map_err(|e| denied(&principal, e))?;
        Ok(principal)
    }

    pub async fn put_chunk(&self, token: &str, chunk: &Chunk, fragments: &[Bytes]) -> EngineResult<Vec<Block>> {
        let principal = self.member_of(token, chunk.system).await?;
        self.engine.put_chunk_as(&principal.account, chunk, fragments).await
    }

    pub async fn get_chunk(&self, token: &str, id: ChunkId) -> EngineResult<ChunkData> {
        let principal = self.principal(token).await?;
        let chunk = self
            .engine
            .records()
            .get_chunk(id)
            .await?
            .ok_or(EngineError::ChunkNotFound(id))?;
        principal.require_system(chunk.system).map_err(|e| denied(&principal, e))?;
        self.engine.get_chunk_as(&principal.account, id).await
    }

    pub async fn delete_chunk(&self, token: &str, id: ChunkId) -> EngineResult<()> {
        let principal = self.principal(token).await?;
        let chunk = self
            .engine
            .records()
            .get_chunk(id)
            .await?
            .ok_or(EngineError::ChunkNotFound(id))?;
        principal.require_system(chunk.system).map_err(|e| denied(&principal, e))?;
        self.engine.delete_chunk(id).await
    }

    pub async fn add_node(&self, token: &str, node: Node) -> EngineResult<()> {
        self.admin(token).await?.require_system(node.system)?;
        self.engine.add_node(node).await
    }

    pub async fn decommission_node(&self, token: &str, node: NodeId) -> EngineResult<RepairSummary> {
        self.admin(token).await?;
        self.engine.decommission_node(node).await
    }

    pub async fn set_tier_policy(&self, token: &str, tier: Tier) -> EngineResult<()> {
        self.admin(token).await?.require_system(tier.system)?;
        self.engine.set_tier_policy(tier).await
    }

    pub async fn initiate_repair(&self, token: &str) -> EngineResult<RepairSummary> {
        self.admin(token).await?;
        self.engine.initiate_repair().await
    }

    pub async fn conditions(&self, token: &str) -> EngineResult<Vec<ChunkCondition>> {
        self.admin(token).await?;
        Ok(self.engine.conditions())
    }

    pub async fn overview(&self, token: &str) -> EngineResult<Option<FleetOverview>> {
        self.admin(token).await?;
        self.engine.overview().await
    }
}

fn denied(principal: &Principal, e: AuthError) -> EngineError {
    warn!(account = %principal.account, role = ?principal.role, reason = e.reason(), "access denied");
    EngineError::Auth(e)
}

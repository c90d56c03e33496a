//! In-memory backend for ephemeral deployments and tests

use crate::backend::{
    CollectionDef, DocumentBackend, DocumentMap, UpdateOptions, UpdateResult, WriteConcern, plan_update,
    prepare_insert,
};
use crate::document::{Document, Filter, Update};
use crate::error::{MetaStoreError, MetaStoreResult};
use crate::replica::{MemberState, ReplicaSetConfig, ReplicaSetStatus, ReplicaState};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
struct Collection {
    def: Option<CollectionDef>,
    docs: DocumentMap,
}

/// Backend keeping every collection in process memory.
///
/// Reachability can be toggled to simulate a store outage.
pub struct MemoryBackend {
    collections: RwLock<HashMap<String, Collection>>,
    replica: RwLock<ReplicaState>,
    reachable: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            replica: RwLock::new(ReplicaState::default()),
            reachable: AtomicBool::new(true),
        }
    }

    /// Simulate the store becoming unreachable or reachable again
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Report a member state, as the store would after a health probe
    pub fn set_member_state(&self, host: impl Into<String>, state: MemberState) {
        self.replica.write().member_states.insert(host.into(), state);
    }

    fn available(&self) -> MetaStoreResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MetaStoreError::Unavailable("memory backend unreachable".to_string()))
        }
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> MetaStoreResult<()> {
        self.available()
    }

    async fn ensure_collection(&self, def: &CollectionDef) -> MetaStoreResult<()> {
        self.available()?;
        let mut collections = self.collections.write();
        collections.entry(def.name.clone()).or_default().def = Some(def.clone());
        Ok(())
    }

    async fn insert(&self, collection: &str, doc: Document, _concern: WriteConcern) -> MetaStoreResult<String> {
        self.available()?;
        let mut collections = self.collections.write();
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| MetaStoreError::UnknownCollection(collection.to_string()))?;
        let (id, doc) = prepare_insert(coll.def.as_ref(), collection, &coll.docs, doc)?;
        coll.docs.insert(id.clone(), doc);
        Ok(id)
    }

    async fn find(&self, collection: &str, filter: &Filter) -> MetaStoreResult<Vec<Document>> {
        self.available()?;
        let collections = self.collections.read();
        let coll = collections
            .get(collection)
            .ok_or_else(|| MetaStoreError::UnknownCollection(collection.to_string()))?;
        Ok(coll.docs.values().filter(|d| filter.matches(d)).cloned().collect())
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        options: UpdateOptions,
    ) -> MetaStoreResult<UpdateResult> {
        self.available()?;
        let mut collections = self.collections.write();
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| MetaStoreError::UnknownCollection(collection.to_string()))?;
        let (writes, result) = plan_update(coll.def.as_ref(), &coll.docs, filter, update, options)?;
        coll.docs.extend(writes);
        Ok(result)
    }

    async fn delete(&self, collection: &str, filter: &Filter, _concern: WriteConcern) -> MetaStoreResult<u64> {
        self.available()?;
        let mut collections = self.collections.write();
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| MetaStoreError::UnknownCollection(collection.to_string()))?;
        let before = coll.docs.len();
        coll.docs.retain(|_, d| !filter.matches(d));
        Ok((before - coll.docs.len()) as u64)
    }

    async fn replica_config(&self) -> MetaStoreResult<Option<ReplicaSetConfig>> {
        self.available()?;
        Ok(self.replica.read().config.clone())
    }

    async fn initiate_replica_set(&self, config: ReplicaSetConfig) -> MetaStoreResult<()> {
        self.available()?;
        self.replica.write().initiate(config)
    }

    async fn reconfigure_replica_set(&self, config: ReplicaSetConfig) -> MetaStoreResult<()> {
        self.available()?;
        self.replica.write().reconfigure(config)
    }

    async fn replica_status(&self) -> MetaStoreResult<ReplicaSetStatus> {
        self.available()?;
        self.replica.read().status()
    }

    async fn set_feature_version(&self, version: &str) -> MetaStoreResult<()> {
        self.available()?;
        self.replica.write().feature_version = Some(version.to_string());
        Ok(())
    }

    async fn feature_version(&self) -> MetaStoreResult<Option<String>> {
        self.available()?;
        Ok(self.replica.read().feature_version.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CollectionSchema, FieldSpec, FieldType, ValidationMode};
    use serde_json::json;

    fn counters() -> CollectionDef {
        CollectionDef::new(
            "objectstats",
            CollectionSchema::new([
                FieldSpec::required("system", FieldType::String),
                FieldSpec::optional("usage", FieldType::IntegerMap),
            ]),
            ValidationMode::Warn,
        )
    }

    #[tokio::test]
    async fn test_upsert_increment_creates_then_adds() {
        let backend = MemoryBackend::new();
        backend.ensure_collection(&counters()).await.unwrap();
        let options = UpdateOptions {
            upsert: true,
            ..UpdateOptions::default()
        };
        let filter = Filter::all().eq("system", "s1");

        let first = backend
            .update("objectstats", &filter, &Update::new().inc("usage.put", 1), options)
            .await
            .unwrap();
        assert!(first.upserted.is_some());
        backend
            .update("objectstats", &filter, &Update::new().inc("usage.put", 2), options)
            .await
            .unwrap();

        let docs = backend.find("objectstats", &filter).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["usage"]["put"], json!(3));
    }

    #[tokio::test]
    async fn test_unreachable_fails_fast() {
        let backend = MemoryBackend::new();
        backend.ensure_collection(&counters()).await.unwrap();
        backend.set_reachable(false);

        let err = backend.find("objectstats", &Filter::all()).await.unwrap_err();
        assert!(err.is_unavailable());
    }
}

//! Metadata store client
//!
//! [`MetaClient`] is constructed once at process start and passed by
//! reference (it is cheaply cloneable) to every component that needs the
//! store. It owns:
//!
//! - the connection discipline: unlimited initial retries at a fixed
//!   interval, fail-fast operations while disconnected, and a background
//!   supervisor that reconnects after a failure;
//! - the watchdog escalating a disconnection longer than
//!   `connect_max_wait` to a [`StoreEvent::Fatal`];
//! - the collection registry and its schemas;
//! - replica-set administration.

use crate::backend::{CollectionDef, DocumentBackend, UpdateOptions, UpdateResult, WriteConcern};
use crate::document::{Document, Filter, Update};
use crate::error::{MetaStoreError, MetaStoreResult};
use crate::memory::MemoryBackend;
use crate::redb_backend::RedbBackend;
use crate::replica::{ReplicaSetConfig, ReplicaSetStatus};
use crate::schema::{SchemaViolation, ValidationMode};
use fleetstore_common::config::MetaConfig;
use fleetstore_common::retry::{Backoff, RetryPolicy};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Url selecting the in-memory backend
pub const MEMORY_URL: &str = "memory:";

/// Attempts of the idempotent feature-version command
const FEATURE_VERSION_ATTEMPTS: u32 = 10;

/// Fresh reads allowed when a replica-set reconfiguration races another one
const RECONFIG_RETRIES: u32 = 5;

/// Connection lifecycle notifications
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    /// First successful connection
    Connected,
    /// Connection restored after a failure or an explicit reconnect
    Reconnected,
    /// Connection lost or closed
    Closed,
    /// Disconnected longer than the configured maximum; the process must
    /// be restarted by its supervisor
    Fatal,
}

enum Source {
    Url,
    Fixed(Arc<dyn DocumentBackend>),
}

struct Inner {
    config: MetaConfig,
    url: RwLock<String>,
    source: Source,
    backend: RwLock<Option<Arc<dyn DocumentBackend>>>,
    memory: Mutex<Option<Arc<MemoryBackend>>>,
    collections: RwLock<Vec<CollectionDef>>,
    connected: AtomicBool,
    ever_connected: AtomicBool,
    ignore_timeout: AtomicBool,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<StoreEvent>,
    fatal: watch::Sender<bool>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.watchdog.get_mut().take() {
            handle.abort();
        }
        if let Some(handle) = self.supervisor.get_mut().take() {
            handle.abort();
        }
    }
}

/// Handle to the metadata store
#[derive(Clone)]
pub struct MetaClient {
    inner: Arc<Inner>,
}

impl MetaClient {
    /// Client opening the backend named by `config.url`
    #[must_use]
    pub fn new(config: MetaConfig) -> Self {
        let url = config.url.clone();
        Self::build(config, url, Source::Url)
    }

    /// Client bound to an already constructed backend
    #[must_use]
    pub fn with_backend(config: MetaConfig, backend: Arc<dyn DocumentBackend>) -> Self {
        let url = format!("{}:", backend.kind());
        Self::build(config, url, Source::Fixed(backend))
    }

    fn build(config: MetaConfig, url: String, source: Source) -> Self {
        let (events, _) = broadcast::channel(64);
        let (fatal, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                url: RwLock::new(url),
                source,
                backend: RwLock::new(None),
                memory: Mutex::new(None),
                collections: RwLock::new(Vec::new()),
                connected: AtomicBool::new(false),
                ever_connected: AtomicBool::new(false),
                ignore_timeout: AtomicBool::new(false),
                watchdog: Mutex::new(None),
                supervisor: Mutex::new(None),
                events,
                fatal,
            }),
        }
    }

    /// Subscribe to connection lifecycle events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn url(&self) -> String {
        self.inner.url.read().clone()
    }

    /// Resolves once the watchdog has declared the store lost
    pub async fn wait_fatal(&self) {
        let mut rx = self.inner.fatal.subscribe();
        let _ = rx.wait_for(|fatal| *fatal).await;
    }

    // ---- Collection registry ----

    /// Register a collection. Names are unique; when already connected the
    /// collection is created right away, otherwise on connect.
    pub async fn define_collection(&self, def: CollectionDef) -> MetaStoreResult<()> {
        {
            let mut collections = self.inner.collections.write();
            if collections.iter().any(|c| c.name == def.name) {
                return Err(MetaStoreError::DuplicateCollection(def.name));
            }
            collections.push(def.clone());
        }
        if let Some(backend) = self.connected_backend() {
            self.observe(backend.ensure_collection(&def).await)?;
        }
        Ok(())
    }

    /// Handle to a registered collection. Fails fast while disconnected.
    pub fn collection(&self, name: &str) -> MetaStoreResult<Collection> {
        let def = self
            .inner
            .collections
            .read()
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .ok_or_else(|| MetaStoreError::UnknownCollection(name.to_string()))?;
        let backend = self
            .connected_backend()
            .ok_or_else(|| MetaStoreError::NotConnected(name.to_string()))?;
        let concern = if self.inner.config.majority_writes && def.mode == ValidationMode::Strict {
            WriteConcern::Majority
        } else {
            WriteConcern::Acknowledged
        };
        Ok(Collection {
            client: self.clone(),
            name: def.name,
            backend,
            concern,
        })
    }

    fn connected_backend(&self) -> Option<Arc<dyn DocumentBackend>> {
        if self.is_connected() {
            self.inner.backend.read().clone()
        } else {
            None
        }
    }

    // ---- Connection discipline ----

    /// Connect, retrying forever at the configured interval. The watchdog
    /// is armed for the duration of the attempt.
    pub async fn connect(&self) -> MetaStoreResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.arm_watchdog();
        let interval = self.inner.config.connect_retry_interval();
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            match self.try_connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(url = %self.url(), attempt, error = %e, "metadata store connect failed, retrying");
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    async fn try_connect(&self) -> MetaStoreResult<()> {
        let backend = self.obtain_backend()?;
        backend.ping().await?;
        let defs = self.inner.collections.read().clone();
        for def in &defs {
            backend.ensure_collection(def).await?;
        }
        self.disarm_watchdog();
        self.inner.connected.store(true, Ordering::SeqCst);
        let event = if self.inner.ever_connected.swap(true, Ordering::SeqCst) {
            StoreEvent::Reconnected
        } else {
            StoreEvent::Connected
        };
        info!(url = %self.url(), backend = backend.kind(), ?event, "metadata store connected");
        let _ = self.inner.events.send(event);
        Ok(())
    }

    fn obtain_backend(&self) -> MetaStoreResult<Arc<dyn DocumentBackend>> {
        if let Some(backend) = self.inner.backend.read().clone() {
            return Ok(backend);
        }
        let backend: Arc<dyn DocumentBackend> = match &self.inner.source {
            Source::Fixed(backend) => Arc::clone(backend),
            Source::Url => {
                let url = self.url();
                if url == MEMORY_URL {
                    let memory = Arc::clone(self.inner.memory.lock().get_or_insert_with(Default::default));
                    memory as Arc<dyn DocumentBackend>
                } else {
                    let path = url.strip_prefix("redb://").unwrap_or(&url);
                    Arc::new(RedbBackend::open(path)?)
                }
            }
        };
        *self.inner.backend.write() = Some(Arc::clone(&backend));
        Ok(backend)
    }

    /// Close the connection without arming the watchdog
    pub fn disconnect(&self) {
        if let Some(handle) = self.inner.supervisor.lock().take() {
            handle.abort();
        }
        self.disarm_watchdog();
        let was_connected = self.inner.connected.swap(false, Ordering::SeqCst);
        *self.inner.backend.write() = None;
        if was_connected {
            info!(url = %self.url(), "metadata store disconnected");
            let _ = self.inner.events.send(StoreEvent::Closed);
        }
    }

    /// Drop the current connection and connect again
    pub async fn reconnect(&self) -> MetaStoreResult<()> {
        self.disconnect();
        self.connect().await
    }

    /// Change the store url. Only allowed before the first connection.
    pub fn set_url(&self, url: impl Into<String>) -> MetaStoreResult<()> {
        let url = url.into();
        if self.is_connected() || self.inner.backend.read().is_some() {
            return Err(MetaStoreError::AlreadyConnected {
                current: self.url(),
                requested: url,
            });
        }
        *self.inner.url.write() = url;
        Ok(())
    }

    /// Switch to a new url, reconnecting
    pub async fn update_connection_string(&self, url: impl Into<String>) -> MetaStoreResult<()> {
        let url = url.into();
        info!(from = %self.url(), to = %url, "updating metadata store url");
        self.disconnect();
        *self.inner.url.write() = url;
        self.connect().await
    }

    /// Never escalate a long disconnection to a fatal event
    pub fn ignore_connect_timeout(&self) {
        self.inner.ignore_timeout.store(true, Ordering::SeqCst);
        self.disarm_watchdog();
    }

    fn arm_watchdog(&self) {
        if self.inner.ignore_timeout.load(Ordering::SeqCst) {
            return;
        }
        let mut slot = self.inner.watchdog.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let max_wait = self.inner.config.connect_max_wait();
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(max_wait).await;
            let Some(inner) = weak.upgrade() else { return };
            if inner.connected.load(Ordering::SeqCst) || inner.ignore_timeout.load(Ordering::SeqCst) {
                return;
            }
            error!(
                max_wait_ms = max_wait.as_millis() as u64,
                "metadata store unreachable for too long, giving up"
            );
            inner.fatal.send_replace(true);
            let _ = inner.events.send(StoreEvent::Fatal);
        }));
    }

    fn disarm_watchdog(&self) {
        if let Some(handle) = self.inner.watchdog.lock().take() {
            handle.abort();
        }
    }

    /// Inspect an operation result, switching to disconnected mode when
    /// the store became unreachable
    fn observe<T>(&self, result: MetaStoreResult<T>) -> MetaStoreResult<T> {
        if let Err(e) = &result
            && e.is_unavailable()
        {
            self.on_connection_lost(e);
        }
        result
    }

    fn on_connection_lost(&self, cause: &MetaStoreError) {
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        warn!(url = %self.url(), error = %cause, "metadata store connection lost");
        let _ = self.inner.events.send(StoreEvent::Closed);
        self.arm_watchdog();

        let client = self.clone();
        let handle = tokio::spawn(async move { client.supervise().await });
        if let Some(old) = self.inner.supervisor.lock().replace(handle) {
            old.abort();
        }
    }

    async fn supervise(&self) {
        let interval = self.inner.config.connect_retry_interval();
        while !self.is_connected() {
            tokio::time::sleep(interval).await;
            if let Err(e) = self.try_connect().await {
                debug!(error = %e, "metadata store still unreachable");
            }
        }
    }

    // ---- Replica set ----

    fn require_backend(&self) -> MetaStoreResult<Arc<dyn DocumentBackend>> {
        self.connected_backend()
            .ok_or_else(|| MetaStoreError::NotConnected("replica set".to_string()))
    }

    /// Create the replica set with `hosts`, the first host as primary
    pub async fn initiate_replica_set(&self, set: &str, hosts: &[String]) -> MetaStoreResult<()> {
        let backend = self.require_backend()?;
        info!(set, ?hosts, "initiating replica set");
        self.observe(backend.initiate_replica_set(ReplicaSetConfig::initial(set, hosts)).await)
    }

    /// Read the current config, derive its successor and submit it. A
    /// concurrent change makes the submission fail with a version mismatch,
    /// in which case the whole cycle restarts from a fresh read.
    pub async fn compare_and_increment<F>(&self, derive: F) -> MetaStoreResult<ReplicaSetConfig>
    where
        F: Fn(&ReplicaSetConfig) -> ReplicaSetConfig,
    {
        let policy = RetryPolicy::with_retries(RECONFIG_RETRIES, Backoff::None);
        policy
            .run(
                "replica set reconfigure",
                |e: &MetaStoreError| matches!(e, MetaStoreError::VersionMismatch { .. }),
                |_| {
                    let derive = &derive;
                    async move {
                        let backend = self.require_backend()?;
                        let current = self
                            .observe(backend.replica_config().await)?
                            .ok_or(MetaStoreError::ReplicaSetNotInitiated)?;
                        let mut next = derive(&current);
                        next.version = current.version + 1;
                        self.observe(backend.reconfigure_replica_set(next.clone()).await)?;
                        info!(version = next.version, members = ?next.hosts(), "replica set reconfigured");
                        Ok(next)
                    }
                },
            )
            .await
            .map_err(|e| e.into_last())
    }

    /// Replace the member list
    pub async fn replica_update_members(&self, hosts: &[String]) -> MetaStoreResult<u64> {
        let next = self.compare_and_increment(|current| current.with_members(hosts)).await?;
        Ok(next.version)
    }

    pub async fn get_rs_version(&self) -> MetaStoreResult<u64> {
        let backend = self.require_backend()?;
        let config = self
            .observe(backend.replica_config().await)?
            .ok_or(MetaStoreError::ReplicaSetNotInitiated)?;
        Ok(config.version)
    }

    /// Replica-set status. A command that does not answer within the
    /// command timeout triggers a reconnect.
    pub async fn get_rs_status(&self) -> MetaStoreResult<ReplicaSetStatus> {
        let backend = self.require_backend()?;
        let timeout = self.inner.config.command_timeout();
        match tokio::time::timeout(timeout, backend.replica_status()).await {
            Ok(result) => self.observe(result),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "replica set status timed out, reconnecting");
                let client = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.reconnect().await {
                        error!(error = %e, "reconnect after status timeout failed");
                    }
                });
                Err(MetaStoreError::Timeout("replica set status".to_string()))
            }
        }
    }

    /// Whether `host` is the current primary
    pub async fn is_primary(&self, host: &str) -> MetaStoreResult<bool> {
        Ok(self.get_rs_status().await?.primary() == Some(host))
    }

    /// Poll until every member is healthy
    pub async fn wait_for_all_members(&self, timeout: Duration) -> MetaStoreResult<()> {
        let poll = self.inner.config.connect_retry_interval();
        let wait = async {
            loop {
                match self.get_rs_status().await {
                    Ok(status) if status.all_healthy() => return,
                    Ok(status) => debug!(?status, "waiting for replica set members"),
                    Err(e) => debug!(error = %e, "replica set status unavailable"),
                }
                tokio::time::sleep(poll).await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| MetaStoreError::Timeout("waiting for all replica set members".to_string()))
    }

    /// Hand the primary role to the next healthy member. This is a
    /// membership change like any other and bumps the config version.
    pub async fn step_down_primary(&self) -> MetaStoreResult<u64> {
        let unhealthy: HashSet<String> = self
            .get_rs_status()
            .await?
            .members
            .into_iter()
            .filter(|m| !m.state.is_healthy())
            .map(|m| m.host)
            .collect();
        info!(?unhealthy, "stepping down replica set primary");
        let next = self
            .compare_and_increment(|current| current.with_next_primary(&unhealthy))
            .await?;
        info!(primary = ?next.primary, version = next.version, "replica set primary moved");
        Ok(next.version)
    }

    /// Set the feature compatibility version, retrying transient failures
    pub async fn set_feature_version(&self, version: &str) -> MetaStoreResult<()> {
        let policy = RetryPolicy::fixed(FEATURE_VERSION_ATTEMPTS, self.inner.config.connect_retry_interval());
        policy
            .run("set feature version", MetaStoreError::is_retryable, |_| async {
                let backend = self.require_backend()?;
                self.observe(backend.set_feature_version(version).await)
            })
            .await
            .map_err(|e| e.into_last())?;
        info!(version, "feature version set");
        Ok(())
    }

    pub async fn feature_version(&self) -> MetaStoreResult<Option<String>> {
        let backend = self.require_backend()?;
        self.observe(backend.feature_version().await)
    }
}

/// Handle to one registered collection
pub struct Collection {
    client: MetaClient,
    name: String,
    backend: Arc<dyn DocumentBackend>,
    concern: WriteConcern,
}

impl Collection {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Override the write concern of this handle
    #[must_use]
    pub const fn with_concern(mut self, concern: WriteConcern) -> Self {
        self.concern = concern;
        self
    }

    pub async fn insert_doc(&self, doc: Document) -> MetaStoreResult<String> {
        self.client
            .observe(self.backend.insert(&self.name, doc, self.concern).await)
    }

    pub async fn insert<T: Serialize + Sync>(&self, value: &T) -> MetaStoreResult<String> {
        self.insert_doc(to_document(value)?).await
    }

    pub async fn find_docs(&self, filter: &Filter) -> MetaStoreResult<Vec<Document>> {
        self.client.observe(self.backend.find(&self.name, filter).await)
    }

    pub async fn find<T: DeserializeOwned>(&self, filter: &Filter) -> MetaStoreResult<Vec<T>> {
        self.find_docs(filter)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(serde_json::Value::Object(doc)).map_err(Into::into))
            .collect()
    }

    pub async fn find_one<T: DeserializeOwned>(&self, filter: &Filter) -> MetaStoreResult<Option<T>> {
        Ok(self.find(filter).await?.into_iter().next())
    }

    pub async fn count(&self, filter: &Filter) -> MetaStoreResult<usize> {
        Ok(self.find_docs(filter).await?.len())
    }

    async fn update_with(&self, filter: &Filter, update: &Update, upsert: bool, multi: bool) -> MetaStoreResult<UpdateResult> {
        let options = UpdateOptions {
            upsert,
            multi,
            concern: self.concern,
        };
        self.client
            .observe(self.backend.update(&self.name, filter, update, options).await)
    }

    /// Update the first matching document
    pub async fn update_one(&self, filter: &Filter, update: &Update) -> MetaStoreResult<UpdateResult> {
        self.update_with(filter, update, false, false).await
    }

    pub async fn update_many(&self, filter: &Filter, update: &Update) -> MetaStoreResult<UpdateResult> {
        self.update_with(filter, update, false, true).await
    }

    /// Update the first match, or create the document from the filter's
    /// equality fields when nothing matches
    pub async fn upsert(&self, filter: &Filter, update: &Update) -> MetaStoreResult<UpdateResult> {
        self.update_with(filter, update, true, false).await
    }

    pub async fn delete(&self, filter: &Filter) -> MetaStoreResult<u64> {
        self.client
            .observe(self.backend.delete(&self.name, filter, self.concern).await)
    }
}

/// Serialize a record into a document
pub fn to_document<T: Serialize>(value: &T) -> MetaStoreResult<Document> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(doc) => Ok(doc),
        _ => Err(MetaStoreError::InvalidSchema {
            collection: String::new(),
            violations: vec![SchemaViolation::NotAnObject],
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::MemberState;
    use crate::schema::{CollectionSchema, FieldSpec, FieldType};
    use serde_json::json;

    fn config() -> MetaConfig {
        MetaConfig {
            url: MEMORY_URL.to_string(),
            connect_retry_interval_ms: 1000,
            connect_max_wait_ms: 60_000,
            command_timeout_ms: 5000,
            majority_writes: true,
        }
    }

    fn counters() -> CollectionDef {
        CollectionDef::new(
            "counters",
            CollectionSchema::new([
                FieldSpec::required("name", FieldType::String),
                FieldSpec::optional("value", FieldType::Integer),
            ]),
            ValidationMode::Strict,
        )
    }

    async fn connected(backend: Arc<MemoryBackend>) -> MetaClient {
        let client = MetaClient::with_backend(config(), backend);
        client.define_collection(counters()).await.unwrap();
        client.connect().await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_define_collection_rejects_duplicates() {
        let client = MetaClient::new(config());
        client.define_collection(counters()).await.unwrap();
        let err = client.define_collection(counters()).await.unwrap_err();
        assert!(matches!(err, MetaStoreError::DuplicateCollection(_)));
    }

    #[tokio::test]
    async fn test_collection_fails_fast_before_connect() {
        let client = MetaClient::new(config());
        client.define_collection(counters()).await.unwrap();
        assert!(matches!(
            client.collection("counters"),
            Err(MetaStoreError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_set_url_rejected_after_connect() {
        let client = connected(Arc::new(MemoryBackend::new())).await;
        assert!(matches!(
            client.set_url("/tmp/other.redb"),
            Err(MetaStoreError::AlreadyConnected { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_until_reachable() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_reachable(false);
        let client = MetaClient::with_backend(config(), backend.clone());
        let mut events = client.subscribe();

        let connecting = tokio::spawn({
            let client = client.clone();
            async move { client.connect().await }
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!client.is_connected());

        backend.set_reachable(true);
        connecting.await.unwrap().unwrap();
        assert!(client.is_connected());
        assert_eq!(events.recv().await.unwrap(), StoreEvent::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_connection_fails_fast_then_recovers() {
        let backend = Arc::new(MemoryBackend::new());
        let client = connected(backend.clone()).await;
        let mut events = client.subscribe();

        backend.set_reachable(false);
        let coll = client.collection("counters").unwrap();
        assert!(coll.find_docs(&Filter::all()).await.unwrap_err().is_unavailable());
        assert_eq!(events.recv().await.unwrap(), StoreEvent::Closed);
        assert!(matches!(
            client.collection("counters"),
            Err(MetaStoreError::NotConnected(_))
        ));

        backend.set_reachable(true);
        assert_eq!(events.recv().await.unwrap(), StoreEvent::Reconnected);
        assert!(client.collection("counters").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_escalates_long_disconnection() {
        let backend = Arc::new(MemoryBackend::new());
        let client = connected(backend.clone()).await;
        let mut events = client.subscribe();

        backend.set_reachable(false);
        let coll = client.collection("counters").unwrap();
        let _ = coll.find_docs(&Filter::all()).await;

        tokio::time::timeout(Duration::from_secs(120), client.wait_fatal())
            .await
            .expect("watchdog should fire");
        assert_eq!(events.recv().await.unwrap(), StoreEvent::Closed);
        assert_eq!(events.recv().await.unwrap(), StoreEvent::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignore_connect_timeout_disarms_watchdog() {
        let backend = Arc::new(MemoryBackend::new());
        let client = connected(backend.clone()).await;
        client.ignore_connect_timeout();

        backend.set_reachable(false);
        let coll = client.collection("counters").unwrap();
        let _ = coll.find_docs(&Filter::all()).await;

        let fired = tokio::time::timeout(Duration::from_secs(600), client.wait_fatal()).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn test_strict_collection_rejects_invalid_record() {
        let client = connected(Arc::new(MemoryBackend::new())).await;
        let coll = client.collection("counters").unwrap();

        let err = coll
            .insert_doc(json!({"name": "a", "value": "x"}).as_object().cloned().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, MetaStoreError::InvalidSchema { .. }));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_replica_update_members_increments_version() {
        let client = connected(Arc::new(MemoryBackend::new())).await;
        let hosts: Vec<String> = vec!["a:1".into(), "b:1".into(), "c:1".into()];
        client.initiate_replica_set("rs0", &hosts).await.unwrap();
        assert_eq!(client.get_rs_version().await.unwrap(), 1);

        let version = client.replica_update_members(&hosts[..2]).await.unwrap();
        assert_eq!(version, 2);
        assert!(client.is_primary("a:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_increment_rereads_after_race() {
        let backend = Arc::new(MemoryBackend::new());
        let client = connected(backend.clone()).await;
        let hosts: Vec<String> = vec!["a:1".into(), "b:1".into()];
        client.initiate_replica_set("rs0", &hosts).await.unwrap();

        // A competing reconfiguration lands between our read and our submit
        // on the first attempt only.
        let raced = AtomicBool::new(false);
        let next = client
            .compare_and_increment(|current| {
                if !raced.swap(true, Ordering::SeqCst) {
                    let competitor = current.with_members(&["a:1".to_string()]);
                    let backend = backend.clone();
                    futures::executor::block_on(async move { backend.reconfigure_replica_set(competitor).await.unwrap() });
                }
                current.with_members(&["a:1".to_string(), "b:1".to_string(), "c:1".to_string()])
            })
            .await
            .unwrap();

        assert_eq!(next.version, 3);
        assert_eq!(client.get_rs_version().await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_all_members() {
        let backend = Arc::new(MemoryBackend::new());
        let client = connected(backend.clone()).await;
        let hosts: Vec<String> = vec!["a:1".into(), "b:1".into()];
        client.initiate_replica_set("rs0", &hosts).await.unwrap();
        backend.set_member_state("b:1", MemberState::Startup);

        let err = client.wait_for_all_members(Duration::from_secs(3)).await.unwrap_err();
        assert!(matches!(err, MetaStoreError::Timeout(_)));

        backend.set_member_state("b:1", MemberState::Secondary);
        client.wait_for_all_members(Duration::from_secs(3)).await.unwrap();
    }

    #[tokio::test]
    async fn test_step_down_moves_primary() {
        let client = connected(Arc::new(MemoryBackend::new())).await;
        let hosts: Vec<String> = vec!["a:1".into(), "b:1".into()];
        client.initiate_replica_set("rs0", &hosts).await.unwrap();

        assert_eq!(client.step_down_primary().await.unwrap(), 2);
        assert!(client.is_primary("b:1").await.unwrap());
        assert_eq!(client.get_rs_version().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_step_down_racing_reconfigure_is_not_lost() {
        let backend = Arc::new(MemoryBackend::new());
        let client = connected(backend.clone()).await;
        let hosts: Vec<String> = vec!["a:1".into(), "b:1".into()];
        client.initiate_replica_set("rs0", &hosts).await.unwrap();

        // the primary steps down between our read and our submit
        let raced = AtomicBool::new(false);
        let next = client
            .compare_and_increment(|current| {
                if !raced.swap(true, Ordering::SeqCst) {
                    futures::executor::block_on(client.step_down_primary()).unwrap();
                }
                current.with_members(&["a:1".to_string(), "b:1".to_string(), "c:1".to_string()])
            })
            .await
            .unwrap();

        assert_eq!(next.version, 3);
        assert_eq!(next.primary.as_deref(), Some("b:1"));
        assert!(client.is_primary("b:1").await.unwrap());
        assert_eq!(client.get_rs_status().await.unwrap().members.len(), 3);
    }

    #[tokio::test]
    async fn test_set_feature_version() {
        let client = connected(Arc::new(MemoryBackend::new())).await;
        client.set_feature_version("7.0").await.unwrap();
        assert_eq!(client.feature_version().await.unwrap().as_deref(), Some("7.0"));
    }
}

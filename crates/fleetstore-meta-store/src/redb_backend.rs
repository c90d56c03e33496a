//! Durable backend on a single redb file.
//!
//! Each collection is a redb table of JSON documents keyed by `_id`, and
//! each unique index a companion table from the encoded key to the owning
//! `_id`. Filters pinning an `_id` read that one document; other filters
//! scan the table. Every write runs in its own write transaction on the
//! blocking pool, so an update is applied atomically against the documents
//! it read. Majority writes commit with immediate durability; acknowledged
//! writes commit with eventual durability. A document that no longer
//! decodes fails the call instead of being skipped.

use crate::backend::{
    CollectionDef, DocumentBackend, DocumentMap, IndexSpec, UpdateOptions, UpdateResult, WriteConcern, plan_update,
    prepare_insert,
};
use crate::document::{Document, Filter, Update, document_id};
use crate::error::{MetaStoreError, MetaStoreResult};
use crate::replica::{ReplicaSetConfig, ReplicaSetStatus, ReplicaState};
use async_trait::async_trait;
use parking_lot::RwLock;
use redb::{Database, Durability, ReadableTable, Table, TableDefinition, TableError, WriteTransaction};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const REPLICA_SET: TableDefinition<&str, &[u8]> = TableDefinition::new("__replica_set");
const REPLICA_KEY: &str = "state";

type DocTable<'txn> = Table<'txn, &'static str, &'static [u8]>;
type KeyTable<'txn> = Table<'txn, &'static str, &'static str>;

const fn table(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

/// Backend storing documents in a redb database file
pub struct RedbBackend {
    db: Arc<Database>,
    path: PathBuf,
    defs: RwLock<HashMap<String, CollectionDef>>,
}

impl RedbBackend {
    /// Open (or create) the database at the given path
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(REPLICA_SET)?;
        }
        write_txn.commit()?;

        info!(path = %path.display(), "opened redb metadata store");
        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
            defs: RwLock::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a redb transaction off the async workers
    async fn blocking<R, F>(&self, f: F) -> MetaStoreResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&Database) -> MetaStoreResult<R> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| MetaStoreError::Unavailable(format!("redb task failed: {e}")))?
    }

    /// Writes are only accepted on registered collections
    fn def(&self, collection: &str) -> MetaStoreResult<CollectionDef> {
        self.defs
            .read()
            .get(collection)
            .cloned()
            .ok_or_else(|| MetaStoreError::UnknownCollection(collection.to_string()))
    }

    async fn with_replica<R, F>(&self, f: F) -> MetaStoreResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut ReplicaState) -> MetaStoreResult<R> + Send + 'static,
    {
        self.blocking(move |db| {
            let write_txn = begin_write(db, WriteConcern::Majority)?;
            let result = {
                let mut t = write_txn.open_table(REPLICA_SET)?;
                let mut state: ReplicaState = match t.get(REPLICA_KEY)? {
                    Some(val) => serde_json::from_slice(val.value())?,
                    None => ReplicaState::default(),
                };
                let result = f(&mut state)?;
                let bytes = serde_json::to_vec(&state)?;
                t.insert(REPLICA_KEY, bytes.as_slice())?;
                result
            };
            write_txn.commit()?;
            Ok(result)
        })
        .await
    }

    async fn read_replica(&self) -> MetaStoreResult<ReplicaState> {
        self.blocking(|db| {
            let read_txn = db.begin_read()?;
            let t = read_txn.open_table(REPLICA_SET)?;
            match t.get(REPLICA_KEY)? {
                Some(val) => Ok(serde_json::from_slice(val.value())?),
                None => Ok(ReplicaState::default()),
            }
        })
        .await
    }
}

fn begin_write(db: &Database, concern: WriteConcern) -> MetaStoreResult<WriteTransaction> {
    let mut txn = db.begin_write()?;
    txn.set_durability(match concern {
        WriteConcern::Majority => Durability::Immediate,
        WriteConcern::Acknowledged => Durability::Eventual,
    });
    Ok(txn)
}

fn unknown_as(collection: &str) -> impl FnOnce(TableError) -> MetaStoreError + '_ {
    move |e| match e {
        TableError::TableDoesNotExist(_) => MetaStoreError::UnknownCollection(collection.to_string()),
        other => other.into(),
    }
}

fn decode(collection: &str, id: &str, bytes: &[u8]) -> MetaStoreResult<Document> {
    serde_json::from_slice(bytes).map_err(|source| MetaStoreError::Corrupt {
        collection: collection.to_string(),
        id: id.to_string(),
        source,
    })
}

fn load_docs<T: ReadableTable<&'static str, &'static [u8]>>(t: &T, collection: &str) -> MetaStoreResult<DocumentMap> {
    let mut docs = DocumentMap::new();
    for entry in t.iter()? {
        let (key, value) = entry?;
        let id = key.value();
        docs.insert(id.to_string(), decode(collection, id, value.value())?);
    }
    Ok(docs)
}

/// Documents a filter can match: the pinned one, or the whole table
fn candidates<T: ReadableTable<&'static str, &'static [u8]>>(
    t: &T,
    collection: &str,
    filter: &Filter,
) -> MetaStoreResult<DocumentMap> {
    let Some(id) = filter.id() else {
        return load_docs(t, collection);
    };
    let mut docs = DocumentMap::new();
    if let Some(value) = t.get(id)? {
        docs.insert(id.to_string(), decode(collection, id, value.value())?);
    }
    Ok(docs)
}

fn unique_indexes(def: &CollectionDef) -> impl Iterator<Item = &IndexSpec> {
    def.indexes.iter().filter(|i| i.unique)
}

fn key_table_name(collection: &str, index: &IndexSpec) -> String {
    format!("{collection}#{}", index.name())
}

fn key_table<'txn>(txn: &'txn WriteTransaction, name: &str) -> MetaStoreResult<KeyTable<'txn>> {
    Ok(txn.open_table(TableDefinition::<&str, &str>::new(name))?)
}

fn encoded_key(index: &IndexSpec, doc: &Document) -> MetaStoreResult<Option<String>> {
    Ok(index.key_of(doc).map(|key| serde_json::to_string(&key)).transpose()?)
}

/// Add to `known` the stored documents holding a unique key of `docs`
fn unique_owners<'a>(
    txn: &WriteTransaction,
    t: &DocTable<'_>,
    def: &CollectionDef,
    docs: impl IntoIterator<Item = &'a Document> + Clone,
    known: &mut DocumentMap,
) -> MetaStoreResult<()> {
    for index in unique_indexes(def) {
        let keys = key_table(txn, &key_table_name(&def.name, index))?;
        for doc in docs.clone() {
            let Some(key) = encoded_key(index, doc)? else { continue };
            let Some(owner) = keys.get(key.as_str())?.map(|g| g.value().to_string()) else {
                continue;
            };
            if known.contains_key(&owner) {
                continue;
            }
            if let Some(value) = t.get(owner.as_str())? {
                let stored = decode(&def.name, &owner, value.value())?;
                known.insert(owner, stored);
            }
        }
    }
    Ok(())
}

/// Drop a document's entry from a unique key table if it still owns it
fn release_key(keys: &mut KeyTable<'_>, index: &IndexSpec, id: &str, doc: &Document) -> MetaStoreResult<()> {
    let Some(key) = encoded_key(index, doc)? else {
        return Ok(());
    };
    let owned = keys.get(key.as_str())?.is_some_and(|owner| owner.value() == id);
    if owned {
        keys.remove(key.as_str())?;
    }
    Ok(())
}

fn put_doc(
    txn: &WriteTransaction,
    t: &mut DocTable<'_>,
    def: &CollectionDef,
    id: &str,
    old: Option<&Document>,
    doc: &Document,
) -> MetaStoreResult<()> {
    let bytes = serde_json::to_vec(doc)?;
    t.insert(id, bytes.as_slice())?;
    for index in unique_indexes(def) {
        let mut keys = key_table(txn, &key_table_name(&def.name, index))?;
        if let Some(old) = old {
            release_key(&mut keys, index, id, old)?;
        }
        if let Some(key) = encoded_key(index, doc)? {
            keys.insert(key.as_str(), id)?;
        }
    }
    Ok(())
}

fn remove_doc(
    txn: &WriteTransaction,
    t: &mut DocTable<'_>,
    def: &CollectionDef,
    id: &str,
    doc: &Document,
) -> MetaStoreResult<()> {
    t.remove(id)?;
    for index in unique_indexes(def) {
        let mut keys = key_table(txn, &key_table_name(&def.name, index))?;
        release_key(&mut keys, index, id, doc)?;
    }
    Ok(())
}

#[async_trait]
impl DocumentBackend for RedbBackend {
    fn kind(&self) -> &'static str {
        "redb"
    }

    async fn ping(&self) -> MetaStoreResult<()> {
        self.blocking(|db| {
            let read_txn = db.begin_read()?;
            let _t = read_txn.open_table(REPLICA_SET)?;
            Ok(())
        })
        .await
    }

    /// Create the tables and rebuild the unique key tables from the documents
    async fn ensure_collection(&self, def: &CollectionDef) -> MetaStoreResult<()> {
        let owned = def.clone();
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            {
                let t = write_txn.open_table(table(&owned.name))?;
                let docs = load_docs(&t, &owned.name)?;
                for index in unique_indexes(&owned) {
                    let name = key_table_name(&owned.name, index);
                    write_txn.delete_table(TableDefinition::<&str, &str>::new(&name))?;
                    let mut keys = key_table(&write_txn, &name)?;
                    for (id, doc) in &docs {
                        if let Some(key) = encoded_key(index, doc)? {
                            keys.insert(key.as_str(), id.as_str())?;
                        }
                    }
                }
                debug!(collection = %owned.name, documents = docs.len(), "collection ready");
            }
            write_txn.commit()?;
            Ok(())
        })
        .await?;
        self.defs.write().insert(def.name.clone(), def.clone());
        Ok(())
    }

    async fn insert(&self, collection: &str, doc: Document, concern: WriteConcern) -> MetaStoreResult<String> {
        let def = self.def(collection)?;
        self.blocking(move |db| {
            let write_txn = begin_write(db, concern)?;
            let id = {
                let mut t = write_txn.open_table(table(&def.name))?;
                let mut known = DocumentMap::new();
                if let Some(id) = document_id(&doc)
                    && let Some(value) = t.get(id.as_str())?
                {
                    let stored = decode(&def.name, &id, value.value())?;
                    known.insert(id, stored);
                }
                unique_owners(&write_txn, &t, &def, [&doc], &mut known)?;
                let (id, doc) = prepare_insert(Some(&def), &def.name, &known, doc)?;
                put_doc(&write_txn, &mut t, &def, &id, None, &doc)?;
                id
            };
            write_txn.commit()?;
            Ok(id)
        })
        .await
    }

    async fn find(&self, collection: &str, filter: &Filter) -> MetaStoreResult<Vec<Document>> {
        let collection = collection.to_string();
        let filter = filter.clone();
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let t = read_txn.open_table(table(&collection)).map_err(unknown_as(&collection))?;
            let docs = candidates(&t, &collection, &filter)?;
            Ok(docs.into_values().filter(|d| filter.matches(d)).collect())
        })
        .await
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        options: UpdateOptions,
    ) -> MetaStoreResult<UpdateResult> {
        let def = self.def(collection)?;
        let filter = filter.clone();
        let update = update.clone();
        self.blocking(move |db| {
            let write_txn = begin_write(db, options.concern)?;
            let result = {
                let mut t = write_txn.open_table(table(&def.name))?;
                let mut known = candidates(&t, &def.name, &filter)?;
                // unique keys the writes would take may belong to documents
                // outside the candidates
                let (draft, _) = plan_update(None, &known, &filter, &update, options)?;
                unique_owners(&write_txn, &t, &def, draft.iter().map(|(_, d)| d), &mut known)?;
                let (writes, result) = plan_update(Some(&def), &known, &filter, &update, options)?;
                for (id, doc) in &writes {
                    put_doc(&write_txn, &mut t, &def, id, known.get(id), doc)?;
                }
                result
            };
            write_txn.commit()?;
            Ok(result)
        })
        .await
    }

    async fn delete(&self, collection: &str, filter: &Filter, concern: WriteConcern) -> MetaStoreResult<u64> {
        let def = self.def(collection)?;
        let filter = filter.clone();
        self.blocking(move |db| {
            let write_txn = begin_write(db, concern)?;
            let removed = {
                let mut t = write_txn.open_table(table(&def.name))?;
                let doomed: Vec<(String, Document)> = candidates(&t, &def.name, &filter)?
                    .into_iter()
                    .filter(|(_, d)| filter.matches(d))
                    .collect();
                for (id, doc) in &doomed {
                    remove_doc(&write_txn, &mut t, &def, id, doc)?;
                }
                doomed.len() as u64
            };
            write_txn.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn replica_config(&self) -> MetaStoreResult<Option<ReplicaSetConfig>> {
        Ok(self.read_replica().await?.config)
    }

    async fn initiate_replica_set(&self, config: ReplicaSetConfig) -> MetaStoreResult<()> {
        self.with_replica(move |state| state.initiate(config)).await
    }

    async fn reconfigure_replica_set(&self, config: ReplicaSetConfig) -> MetaStoreResult<()> {
        self.with_replica(move |state| state.reconfigure(config)).await
    }

    async fn replica_status(&self) -> MetaStoreResult<ReplicaSetStatus> {
        self.read_replica().await?.status()
    }

    async fn set_feature_version(&self, version: &str) -> MetaStoreResult<()> {
        let version = version.to_string();
        self.with_replica(move |state| {
            state.feature_version = Some(version);
            Ok(())
        })
        .await
    }

    async fn feature_version(&self) -> MetaStoreResult<Option<String>> {
        Ok(self.read_replica().await?.feature_version)
    }
}

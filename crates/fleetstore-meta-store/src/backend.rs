//! Storage backend abstraction
//!
//! A [`DocumentBackend`] persists JSON documents grouped in collections and
//! the replica-set topology record. Collection-level rules (schema, unique
//! indexes) are registered with [`DocumentBackend::ensure_collection`] and
//! enforced by the backend on every write, the same way a document database
//! enforces a collection validator.

use crate::document::{Document, Filter, ID_FIELD, Update, document_id, get_path, seed_upsert};
use crate::error::{MetaStoreError, MetaStoreResult};
use crate::replica::{ReplicaSetConfig, ReplicaSetStatus};
use crate::schema::{CollectionSchema, ValidationMode};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Acknowledgement level of a write
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum WriteConcern {
    /// Acknowledged by the primary; durable eventually
    #[default]
    Acknowledged,
    /// Durable on a majority before acknowledgement
    Majority,
}

/// Index over one or more fields
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexSpec {
    pub fields: Vec<&'static str>,
    pub unique: bool,
}

impl IndexSpec {
    #[must_use]
    pub fn unique(fields: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
            unique: true,
        }
    }

    #[must_use]
    pub fn lookup(fields: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
            unique: false,
        }
    }

    pub(crate) fn name(&self) -> String {
        self.fields.join(",")
    }

    /// Key of `doc` under this index, if every indexed field is present
    pub(crate) fn key_of(&self, doc: &Document) -> Option<Vec<Value>> {
        self.fields.iter().map(|f| get_path(doc, f).cloned()).collect()
    }
}

/// A registered collection: name, strict schema, validation policy, indexes
#[derive(Clone, Debug)]
pub struct CollectionDef {
    pub name: String,
    pub schema: CollectionSchema,
    pub mode: ValidationMode,
    pub indexes: Vec<IndexSpec>,
}

impl CollectionDef {
    #[must_use]
    pub fn new(name: impl Into<String>, schema: CollectionSchema, mode: ValidationMode) -> Self {
        Self {
            name: name.into(),
            schema,
            mode,
            indexes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    /// Apply the schema according to the validation mode
    pub fn check(&self, doc: &Document) -> MetaStoreResult<()> {
        match (self.schema.validate(doc), self.mode) {
            (Ok(()), _) => Ok(()),
            (Err(violations), ValidationMode::Strict) => Err(MetaStoreError::InvalidSchema {
                collection: self.name.clone(),
                violations,
            }),
            (Err(violations), ValidationMode::Warn) => {
                for violation in &violations {
                    warn!(collection = %self.name, %violation, "schema violation, keeping record");
                }
                Ok(())
            }
        }
    }
}

/// Options of an update call
#[derive(Clone, Copy, Debug, Default)]
pub struct UpdateOptions {
    /// Create the document when nothing matches
    pub upsert: bool,
    /// Update every match instead of the first
    pub multi: bool,
    pub concern: WriteConcern,
}

/// Outcome of an update call
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched: u64,
    /// `_id` of the document created by an upsert
    pub upserted: Option<String>,
}

/// Persistence backend of the metadata store
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Short backend name used in logs
    fn kind(&self) -> &'static str;

    /// Round trip to verify the store is reachable
    async fn ping(&self) -> MetaStoreResult<()>;

    /// Create the collection if needed and register its rules
    async fn ensure_collection(&self, def: &CollectionDef) -> MetaStoreResult<()>;

    async fn insert(&self, collection: &str, doc: Document, concern: WriteConcern) -> MetaStoreResult<String>;

    async fn find(&self, collection: &str, filter: &Filter) -> MetaStoreResult<Vec<Document>>;

    /// Apply `update` atomically to the matching documents
    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        options: UpdateOptions,
    ) -> MetaStoreResult<UpdateResult>;

    async fn delete(&self, collection: &str, filter: &Filter, concern: WriteConcern) -> MetaStoreResult<u64>;

    async fn replica_config(&self) -> MetaStoreResult<Option<ReplicaSetConfig>>;

    async fn initiate_replica_set(&self, config: ReplicaSetConfig) -> MetaStoreResult<()>;

    /// Replace the replica-set config. The stored version must be exactly
    /// one below `config.version`.
    async fn reconfigure_replica_set(&self, config: ReplicaSetConfig) -> MetaStoreResult<()>;

    async fn replica_status(&self) -> MetaStoreResult<ReplicaSetStatus>;

    async fn set_feature_version(&self, version: &str) -> MetaStoreResult<()>;

    async fn feature_version(&self) -> MetaStoreResult<Option<String>>;
}

/// Documents of one collection keyed by `_id`
pub(crate) type DocumentMap = BTreeMap<String, Document>;

/// Validate and key a document for insertion into `docs`
pub(crate) fn prepare_insert(
    def: Option<&CollectionDef>,
    collection: &str,
    docs: &DocumentMap,
    mut doc: Document,
) -> MetaStoreResult<(String, Document)> {
    let id = match document_id(&doc) {
        Some(id) => id,
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            doc.insert(ID_FIELD.to_string(), Value::from(id.clone()));
            id
        }
    };
    if docs.contains_key(&id) {
        return Err(MetaStoreError::DuplicateKey {
            collection: collection.to_string(),
            index: ID_FIELD.to_string(),
        });
    }
    if let Some(def) = def {
        def.check(&doc)?;
        check_unique(def, docs, &[(id.clone(), &doc)])?;
    }
    Ok((id, doc))
}

/// Compute the documents written by an update without touching `docs`
pub(crate) fn plan_update(
    def: Option<&CollectionDef>,
    docs: &DocumentMap,
    filter: &Filter,
    update: &Update,
    options: UpdateOptions,
) -> MetaStoreResult<(Vec<(String, Document)>, UpdateResult)> {
    let mut writes = Vec::new();
    for (id, doc) in docs {
        if !filter.matches(doc) {
            continue;
        }
        let mut updated = doc.clone();
        update.apply(&mut updated);
        writes.push((id.clone(), updated));
        if !options.multi {
            break;
        }
    }
    let mut result = UpdateResult {
        matched: writes.len() as u64,
        upserted: None,
    };
    if writes.is_empty() && options.upsert {
        let seeded = seed_upsert(filter, update);
        let id = document_id(&seeded).unwrap_or_default();
        result.upserted = Some(id.clone());
        writes.push((id, seeded));
    }
    if let Some(def) = def {
        for (_, doc) in &writes {
            def.check(doc)?;
        }
        let pending: Vec<(String, &Document)> = writes.iter().map(|(id, d)| (id.clone(), d)).collect();
        check_unique(def, docs, &pending)?;
    }
    Ok((writes, result))
}

/// Reject writes that would give two documents the same unique key
fn check_unique(def: &CollectionDef, docs: &DocumentMap, pending: &[(String, &Document)]) -> MetaStoreResult<()> {
    for index in def.indexes.iter().filter(|i| i.unique) {
        for (i, (id, doc)) in pending.iter().enumerate() {
            let Some(key) = index.key_of(doc) else { continue };
            let clash_stored = docs
                .iter()
                .filter(|(other_id, _)| *other_id != id && !pending.iter().any(|(p, _)| p == *other_id))
                .any(|(_, other)| index.key_of(other).as_ref() == Some(&key));
            let clash_pending = pending
                .iter()
                .skip(i + 1)
                .any(|(_, other)| index.key_of(other).as_ref() == Some(&key));
            if clash_stored || clash_pending {
                return Err(MetaStoreError::DuplicateKey {
                    collection: def.name.clone(),
                    index: index.name(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, FieldType};
    use serde_json::json;

    fn def() -> CollectionDef {
        CollectionDef::new(
            "blocks",
            CollectionSchema::new([
                FieldSpec::required("chunk", FieldType::String),
                FieldSpec::required("fragment", FieldType::Integer),
                FieldSpec::optional("upload_mode", FieldType::Boolean),
            ]),
            ValidationMode::Strict,
        )
        .with_index(IndexSpec::unique(["chunk", "fragment"]))
    }

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_insert_rejects_unique_clash() {
        let def = def();
        let mut docs = DocumentMap::new();
        let (id, d) = prepare_insert(Some(&def), "blocks", &docs, doc(json!({"chunk": "c", "fragment": 0}))).unwrap();
        docs.insert(id, d);

        let err = prepare_insert(Some(&def), "blocks", &docs, doc(json!({"chunk": "c", "fragment": 0}))).unwrap_err();
        assert!(matches!(err, MetaStoreError::DuplicateKey { .. }));
        assert!(prepare_insert(Some(&def), "blocks", &docs, doc(json!({"chunk": "c", "fragment": 1}))).is_ok());
    }

    #[test]
    fn test_upsert_matches_existing() {
        let def = def();
        let mut docs = DocumentMap::new();
        let (id, d) = prepare_insert(
            Some(&def),
            "blocks",
            &docs,
            doc(json!({"_id": "b1", "chunk": "c", "fragment": 0, "upload_mode": true})),
        )
        .unwrap();
        docs.insert(id, d);

        let options = UpdateOptions {
            upsert: true,
            ..UpdateOptions::default()
        };
        let filter = Filter::all().eq("chunk", "c").eq("fragment", 0);
        let (writes, result) =
            plan_update(Some(&def), &docs, &filter, &Update::new().unset("upload_mode"), options).unwrap();

        assert_eq!(result.matched, 1);
        assert!(result.upserted.is_none());
        assert_eq!(writes[0].0, "b1");
        assert!(!writes[0].1.contains_key("upload_mode"));
    }

    #[test]
    fn test_strict_update_rejects_bad_type() {
        let def = def();
        let options = UpdateOptions {
            upsert: true,
            ..UpdateOptions::default()
        };
        let filter = Filter::all().eq("chunk", "c");
        let err = plan_update(
            Some(&def),
            &DocumentMap::new(),
            &filter,
            &Update::new().set("fragment", "zero"),
            options,
        )
        .unwrap_err();
        assert!(matches!(err, MetaStoreError::InvalidSchema { .. }));
    }
}

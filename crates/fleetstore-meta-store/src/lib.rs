//! Fleetstore Metadata Store - document persistence for placement records
//!
//! The [`MetaClient`] is the single, explicitly constructed handle to the
//! metadata store. It owns the connection discipline (unlimited initial
//! retries, fail-fast writes while disconnected, a watchdog that escalates
//! prolonged disconnection), the collection registry with strict schemas,
//! and the replica-set administration commands. Storage itself is delegated
//! to a [`DocumentBackend`]: [`RedbBackend`] for durable single-file storage
//! and [`MemoryBackend`] for ephemeral deployments and tests.

pub mod backend;
pub mod client;
pub mod document;
pub mod error;
pub mod memory;
pub mod records;
pub mod redb_backend;
pub mod replica;
pub mod schema;

pub use backend::{CollectionDef, DocumentBackend, IndexSpec, UpdateOptions, UpdateResult, WriteConcern};
pub use client::{Collection, MEMORY_URL, MetaClient, StoreEvent, to_document};
pub use document::{Document, Filter, Update};
pub use error::{MetaStoreError, MetaStoreResult};
pub use memory::MemoryBackend;
pub use records::PlacementRecords;
pub use redb_backend::RedbBackend;
pub use replica::{MemberState, MemberStatus, ReplicaMember, ReplicaSetConfig, ReplicaSetStatus};
pub use schema::{CollectionSchema, FieldSpec, FieldType, SchemaViolation, ValidationMode};

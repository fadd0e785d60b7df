//! Storage seams consumed by the evaluator.
//!
//! Relationship and attribute facts sit behind [`RelationshipReader`] and
//! [`RelationshipWriter`]; compiled schemas behind [`SchemaReader`] and
//! [`SchemaWriter`]. Backends are swappable; the in-memory ones live in the
//! submodules.

use crate::{
    error::Result,
    models::{Attribute, AttributeFilter, AttributeValue, Entity, Subject, Tuple, TupleFilter},
    schema::{CompiledSchema, SchemaRecord},
    token::SnapshotToken,
};
use async_trait::async_trait;
use std::sync::Arc;

pub mod memory;
pub mod schema;

pub use memory::InMemoryRelationshipStore;
pub use schema::InMemorySchemaStore;

/// Snapshot reads of relationship and attribute facts.
///
/// Every read takes a snapshot token; a no-op token reads the tenant head.
/// A tenant without committed changes reads as empty at snapshot 0, and an
/// entity without matching facts is an empty, successful result. Whether a
/// tenant exists at all is answered by its schema.
#[async_trait]
pub trait RelationshipReader: Send + Sync {
    /// Subjects holding `relation` on `entity`
    async fn query_relationships(
        &self,
        tenant_id: &str,
        entity: &Entity,
        relation: &str,
        snapshot: SnapshotToken,
    ) -> Result<Vec<Subject>>;

    async fn query_attribute(
        &self,
        tenant_id: &str,
        entity: &Entity,
        attribute: &str,
        snapshot: SnapshotToken,
    ) -> Result<Option<AttributeValue>>;

    async fn read_relationships(
        &self,
        tenant_id: &str,
        filter: &TupleFilter,
        snapshot: SnapshotToken,
    ) -> Result<Vec<Tuple>>;

    async fn read_attributes(
        &self,
        tenant_id: &str,
        filter: &AttributeFilter,
        snapshot: SnapshotToken,
    ) -> Result<Vec<Attribute>>;

    /// Token of the latest committed change on the tenant
    async fn head_snapshot(&self, tenant_id: &str) -> Result<SnapshotToken>;

    /// Pin `snapshot` to a readable version: a no-op token becomes the head,
    /// tokens outside the retained window fail like a read would.
    async fn resolve_snapshot(
        &self,
        tenant_id: &str,
        snapshot: SnapshotToken,
    ) -> Result<SnapshotToken>;
}

/// Atomic, per-tenant linearizable mutations
#[async_trait]
pub trait RelationshipWriter: Send + Sync {
    /// Upsert all tuples and attributes as one committed change
    async fn write(
        &self,
        tenant_id: &str,
        tuples: Vec<Tuple>,
        attributes: Vec<Attribute>,
    ) -> Result<SnapshotToken>;

    /// Remove exactly these tuples as one committed change. Tuples that are
    /// not stored are ignored.
    async fn delete_tuples(&self, tenant_id: &str, tuples: Vec<Tuple>) -> Result<SnapshotToken>;

    /// Remove every fact matching the filters as one committed change
    async fn delete(
        &self,
        tenant_id: &str,
        tuple_filter: &TupleFilter,
        attribute_filter: &AttributeFilter,
    ) -> Result<SnapshotToken>;
}

/// Lookup table of compiled schemas keyed by (tenant, version)
#[async_trait]
pub trait SchemaReader: Send + Sync {
    async fn read_schema(&self, tenant_id: &str, version: &str) -> Result<Arc<CompiledSchema>>;

    /// Most recently written version of the tenant's schema
    async fn head_version(&self, tenant_id: &str) -> Result<String>;
}

#[async_trait]
pub trait SchemaWriter: Send + Sync {
    /// Records must share one (tenant, version).
    async fn write_schema(&self, records: Vec<SchemaRecord>) -> Result<()>;
}

use crate::{
    error::{RebacError, Result},
    models::{Attribute, AttributeFilter, AttributeValue, Entity, Subject, Tuple, TupleFilter},
    repository::{RelationshipReader, RelationshipWriter},
    token::SnapshotToken,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// (entity type, entity id, relation or attribute name)
type FactKey = (String, String, String);

fn tuple_key(tuple: &Tuple) -> FactKey {
    (
        tuple.entity.entity_type.clone(),
        tuple.entity.id.clone(),
        tuple.relation.clone(),
    )
}

fn attribute_key(attribute: &Attribute) -> FactKey {
    (
        attribute.entity.entity_type.clone(),
        attribute.entity.id.clone(),
        attribute.name.clone(),
    )
}

fn entity_key(entity: &Entity, name: &str) -> FactKey {
    (entity.entity_type.clone(), entity.id.clone(), name.to_string())
}

/// A fact together with the snapshot range it is visible in
struct Row<T> {
    fact: T,
    created: u64,
    deleted: Option<u64>,
}

impl<T> Row<T> {
    fn visible_at(&self, version: u64) -> bool {
        self.created <= version && self.deleted.map_or(true, |deleted| deleted > version)
    }

    fn is_live(&self) -> bool {
        self.deleted.is_none()
    }
}

struct Rows<T> {
    rows: Vec<Row<T>>,
    index: HashMap<FactKey, Vec<usize>>,
}

impl<T> Default for Rows<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> Rows<T> {
    fn keyed<'a>(&'a self, key: &FactKey) -> impl Iterator<Item = &'a Row<T>> + 'a {
        self.index
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(move |&position| self.rows.get(position))
    }

    fn positions(&self, key: &FactKey) -> Vec<usize> {
        self.index.get(key).cloned().unwrap_or_default()
    }

    fn push(&mut self, key: FactKey, fact: T, created: u64) {
        let position = self.rows.len();
        self.rows.push(Row {
            fact,
            created,
            deleted: None,
        });
        self.index.entry(key).or_default().push(position);
    }

    fn visible(&self, version: u64) -> impl Iterator<Item = &T> + '_ {
        self.rows
            .iter()
            .filter(move |row| row.visible_at(version))
            .map(|row| &row.fact)
    }

    fn delete_where(&mut self, version: u64, matches: impl Fn(&T) -> bool) -> usize {
        let mut deleted = 0;
        for row in self.rows.iter_mut().filter(|row| row.is_live()) {
            if matches(&row.fact) {
                row.deleted = Some(version);
                deleted += 1;
            }
        }
        deleted
    }

    /// Drop rows invisible at every snapshot from `oldest` on.
    fn prune(&mut self, oldest: u64, key: impl Fn(&T) -> FactKey) {
        let before = self.rows.len();
        self.rows
            .retain(|row| row.deleted.map_or(true, |deleted| deleted > oldest));
        if self.rows.len() == before {
            return;
        }
        self.index.clear();
        for (position, row) in self.rows.iter().enumerate() {
            self.index.entry(key(&row.fact)).or_default().push(position);
        }
    }
}

#[derive(Default)]
struct TenantLog {
    head: u64,
    oldest: u64,
    tuples: Rows<Tuple>,
    attributes: Rows<Attribute>,
}

impl TenantLog {
    fn resolve(&self, snapshot: SnapshotToken) -> Result<u64> {
        match snapshot {
            SnapshotToken::Noop => Ok(self.head),
            SnapshotToken::Version(version) if version > self.head => {
                Err(RebacError::InvalidArgument(format!(
                    "snapshot {} is ahead of the latest committed snapshot {}",
                    version, self.head
                )))
            }
            SnapshotToken::Version(version) if version < self.oldest => {
                Err(RebacError::StaleSnapshot {
                    requested: version,
                    oldest: self.oldest,
                })
            }
            SnapshotToken::Version(version) => Ok(version),
        }
    }
}

/// In-memory multi-version relationship store.
///
/// Rows are never mutated except for their deletion marker, so a read at a
/// snapshot sees exactly the writes committed at or before it. Writes on a
/// tenant are serialized by the tenant lock; reads hold the lock only for
/// the duration of a single query.
pub struct InMemoryRelationshipStore {
    tenants: DashMap<String, Arc<RwLock<TenantLog>>>,
    retained_snapshots: Option<u64>,
}

impl InMemoryRelationshipStore {
    pub fn new() -> Self {
        Self {
            tenants: DashMap::new(),
            retained_snapshots: None,
        }
    }

    /// Keep only the most recent `snapshots` snapshots readable per tenant.
    pub fn with_retention(mut self, snapshots: u64) -> Self {
        self.retained_snapshots = Some(snapshots.max(1));
        self
    }

    /// A tenant without committed changes reads as empty at snapshot 0.
    fn tenant(&self, tenant_id: &str) -> Arc<RwLock<TenantLog>> {
        self.tenants
            .get(tenant_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    fn tenant_or_create(&self, tenant_id: &str) -> Arc<RwLock<TenantLog>> {
        self.tenants
            .entry(tenant_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn apply_retention(&self, log: &mut TenantLog) {
        let Some(retained) = self.retained_snapshots else {
            return;
        };
        let oldest = (log.head + 1).saturating_sub(retained);
        if oldest > log.oldest {
            log.oldest = oldest;
            log.tuples.prune(oldest, tuple_key);
            log.attributes.prune(oldest, attribute_key);
        }
    }
}

impl Default for InMemoryRelationshipStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelationshipReader for InMemoryRelationshipStore {
    async fn query_relationships(
        &self,
        tenant_id: &str,
        entity: &Entity,
        relation: &str,
        snapshot: SnapshotToken,
    ) -> Result<Vec<Subject>> {
        let tenant = self.tenant(tenant_id);
        let log = tenant.read();
        let version = log.resolve(snapshot)?;
        Ok(log
            .tuples
            .keyed(&entity_key(entity, relation))
            .filter(|row| row.visible_at(version))
            .map(|row| row.fact.subject.clone())
            .collect())
    }

    async fn query_attribute(
        &self,
        tenant_id: &str,
        entity: &Entity,
        attribute: &str,
        snapshot: SnapshotToken,
    ) -> Result<Option<AttributeValue>> {
        let tenant = self.tenant(tenant_id);
        let log = tenant.read();
        let version = log.resolve(snapshot)?;
        Ok(log
            .attributes
            .keyed(&entity_key(entity, attribute))
            .filter(|row| row.visible_at(version))
            .last()
            .map(|row| row.fact.value.clone()))
    }

    async fn read_relationships(
        &self,
        tenant_id: &str,
        filter: &TupleFilter,
        snapshot: SnapshotToken,
    ) -> Result<Vec<Tuple>> {
        let tenant = self.tenant(tenant_id);
        let log = tenant.read();
        let version = log.resolve(snapshot)?;
        Ok(log
            .tuples
            .visible(version)
            .filter(|tuple| filter.matches(tuple))
            .cloned()
            .collect())
    }

    async fn read_attributes(
        &self,
        tenant_id: &str,
        filter: &AttributeFilter,
        snapshot: SnapshotToken,
    ) -> Result<Vec<Attribute>> {
        let tenant = self.tenant(tenant_id);
        let log = tenant.read();
        let version = log.resolve(snapshot)?;
        Ok(log
            .attributes
            .visible(version)
            .filter(|attribute| filter.matches(attribute))
            .cloned()
            .collect())
    }

    async fn head_snapshot(&self, tenant_id: &str) -> Result<SnapshotToken> {
        let tenant = self.tenant(tenant_id);
        let head = tenant.read().head;
        Ok(SnapshotToken::Version(head))
    }

    async fn resolve_snapshot(
        &self,
        tenant_id: &str,
        snapshot: SnapshotToken,
    ) -> Result<SnapshotToken> {
        let tenant = self.tenant(tenant_id);
        let version = tenant.read().resolve(snapshot)?;
        Ok(SnapshotToken::Version(version))
    }
}

#[async_trait]
impl RelationshipWriter for InMemoryRelationshipStore {
    async fn write(
        &self,
        tenant_id: &str,
        tuples: Vec<Tuple>,
        attributes: Vec<Attribute>,
    ) -> Result<SnapshotToken> {
        let tenant = self.tenant_or_create(tenant_id);
        let mut guard = tenant.write();
        let log = &mut *guard;
        let version = log.head + 1;
        let (mut inserted, mut upserted) = (0usize, 0usize);

        for tuple in tuples {
            let key = tuple_key(&tuple);
            let exists = log
                .tuples
                .keyed(&key)
                .any(|row| row.is_live() && row.fact == tuple);
            if !exists {
                log.tuples.push(key, tuple, version);
                inserted += 1;
            }
        }

        for attribute in attributes {
            let key = attribute_key(&attribute);
            let mut unchanged = false;
            for position in log.attributes.positions(&key) {
                if let Some(row) = log.attributes.rows.get_mut(position) {
                    if !row.is_live() {
                        continue;
                    }
                    if row.fact.value == attribute.value {
                        unchanged = true;
                    } else {
                        row.deleted = Some(version);
                    }
                }
            }
            if !unchanged {
                log.attributes.push(key, attribute, version);
                upserted += 1;
            }
        }

        log.head = version;
        self.apply_retention(log);
        debug!(
            tenant_id,
            version, inserted, upserted, "Committed relationship write"
        );
        Ok(SnapshotToken::Version(version))
    }

    async fn delete_tuples(&self, tenant_id: &str, tuples: Vec<Tuple>) -> Result<SnapshotToken> {
        if tuples.is_empty() {
            return Err(RebacError::InvalidArgument(
                "delete requires at least one tuple".to_string(),
            ));
        }

        let tenant = self.tenant_or_create(tenant_id);
        let mut guard = tenant.write();
        let log = &mut *guard;
        let version = log.head + 1;
        let mut deleted = 0usize;

        for tuple in tuples {
            for position in log.tuples.positions(&tuple_key(&tuple)) {
                if let Some(row) = log.tuples.rows.get_mut(position) {
                    if row.is_live() && row.fact == tuple {
                        row.deleted = Some(version);
                        deleted += 1;
                    }
                }
            }
        }

        log.head = version;
        self.apply_retention(log);
        debug!(tenant_id, version, deleted, "Committed tuple delete");
        Ok(SnapshotToken::Version(version))
    }

    async fn delete(
        &self,
        tenant_id: &str,
        tuple_filter: &TupleFilter,
        attribute_filter: &AttributeFilter,
    ) -> Result<SnapshotToken> {
        if tuple_filter.is_empty() && attribute_filter.is_empty() {
            return Err(RebacError::InvalidArgument(
                "delete requires a tuple or attribute filter".to_string(),
            ));
        }

        let tenant = self.tenant_or_create(tenant_id);
        let mut guard = tenant.write();
        let log = &mut *guard;
        let version = log.head + 1;

        let tuples = if tuple_filter.is_empty() {
            0
        } else {
            log.tuples
                .delete_where(version, |tuple| tuple_filter.matches(tuple))
        };
        let attributes = if attribute_filter.is_empty() {
            0
        } else {
            log.attributes
                .delete_where(version, |attribute| attribute_filter.matches(attribute))
        };

        log.head = version;
        self.apply_retention(log);
        debug!(
            tenant_id,
            version, tuples, attributes, "Committed relationship delete"
        );
        Ok(SnapshotToken::Version(version))
    }
}

use crate::{
    config::EngineConfig,
    error::Result,
    invoke::Invoker,
    models::{Attribute, AttributeFilter, CheckRequest, CheckResponse, Tuple, TupleFilter},
    repository::{
        InMemoryRelationshipStore, InMemorySchemaStore, RelationshipReader, RelationshipWriter,
        SchemaReader, SchemaWriter,
    },
    rules::RuleDefinition,
    schema::{CompiledSchema, EntityDefinition, Schema},
    token::SnapshotToken,
    tuple::{parse_entity, parse_subject, parse_tuple},
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Tenant used by the embedded engine
pub const DEFAULT_TENANT_ID: &str = "default";

/// Embedded, single-tenant permission engine backed by the in-memory stores.
///
/// The schema is validated and pinned to a fresh version at construction.
/// Relationship strings use the textual tuple form, e.g.
/// `organization:mhy#sre@user:bob`.
pub struct Engine {
    invoker: Invoker,
    store: Arc<InMemoryRelationshipStore>,
    schema: Arc<CompiledSchema>,
}

impl Engine {
    pub async fn new(schema: Schema, relationships: &[&str]) -> Result<Self> {
        Self::with_config(schema, relationships, EngineConfig::default()).await
    }

    pub async fn with_config(
        schema: Schema,
        relationships: &[&str],
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        schema.validate()?;

        let version = Uuid::new_v4().simple().to_string();
        let schemas = Arc::new(InMemorySchemaStore::new());
        schemas
            .write_schema(schema.to_records(DEFAULT_TENANT_ID, &version)?)
            .await?;
        let compiled = schemas.read_schema(DEFAULT_TENANT_ID, &version).await?;

        let store = match config.store.retained_snapshots {
            Some(snapshots) => InMemoryRelationshipStore::new().with_retention(snapshots),
            None => InMemoryRelationshipStore::new(),
        };
        let store = Arc::new(store);
        let tuples = parse_relationships(&compiled, relationships)?;
        let snapshot = store.write(DEFAULT_TENANT_ID, tuples, Vec::new()).await?;

        info!(
            schema_version = %version,
            entities = schema.entities.len(),
            rules = schema.rules.len(),
            relationships = relationships.len(),
            snap_token = %snapshot,
            "Permission engine ready"
        );

        Ok(Self {
            invoker: Invoker::new(schemas, store.clone(), &config),
            store,
            schema: compiled,
        })
    }

    /// Whether `subject` (`type:id` or `type:id#relation`) may perform
    /// `action` on `entity` (`type:id`) at the latest snapshot.
    pub async fn check(&self, subject: &str, action: &str, entity: &str) -> Result<bool> {
        let request = CheckRequest::new(
            DEFAULT_TENANT_ID,
            parse_entity(entity)?,
            action,
            parse_subject(subject)?,
        );
        let response = self.invoker.check(&request).await?;
        Ok(response.can.is_allowed())
    }

    /// Full check with explicit snapshot, depth and context. An empty tenant
    /// id means the default tenant.
    pub async fn check_request(&self, request: &CheckRequest) -> Result<CheckResponse> {
        if request.tenant_id.is_empty() {
            let mut request = request.clone();
            request.tenant_id = DEFAULT_TENANT_ID.to_string();
            return self.invoker.check(&request).await;
        }
        self.invoker.check(request).await
    }

    pub async fn write_relationships(&self, relationships: &[&str]) -> Result<SnapshotToken> {
        let tuples = parse_relationships(&self.schema, relationships)?;
        let count = tuples.len();
        let snapshot = self.store.write(DEFAULT_TENANT_ID, tuples, Vec::new()).await?;
        info!(count, snap_token = %snapshot, "Wrote relationships");
        Ok(snapshot)
    }

    pub async fn write_attributes(&self, attributes: Vec<Attribute>) -> Result<SnapshotToken> {
        for attribute in &attributes {
            self.schema.validate_attribute(attribute)?;
        }
        let count = attributes.len();
        let snapshot = self.store.write(DEFAULT_TENANT_ID, Vec::new(), attributes).await?;
        info!(count, snap_token = %snapshot, "Wrote attributes");
        Ok(snapshot)
    }

    /// Remove exactly the given relationships, e.g. `organization:mhy#sre@user:bob`.
    /// A plain subject never removes a subject-set tuple for the same subject.
    pub async fn delete_relationships(&self, relationships: &[&str]) -> Result<SnapshotToken> {
        let tuples = relationships
            .iter()
            .map(|relationship| parse_tuple(relationship))
            .collect::<Result<Vec<_>>>()?;
        let count = tuples.len();
        let snapshot = self.store.delete_tuples(DEFAULT_TENANT_ID, tuples).await?;
        info!(count, snap_token = %snapshot, "Deleted relationships");
        Ok(snapshot)
    }

    /// Remove every relationship matching `filter`.
    pub async fn delete_relationships_matching(&self, filter: &TupleFilter) -> Result<SnapshotToken> {
        let snapshot = self
            .store
            .delete(DEFAULT_TENANT_ID, filter, &AttributeFilter::new())
            .await?;
        info!(?filter, snap_token = %snapshot, "Deleted matching relationships");
        Ok(snapshot)
    }

    pub async fn delete_attributes(&self, filter: &AttributeFilter) -> Result<SnapshotToken> {
        let snapshot = self
            .store
            .delete(DEFAULT_TENANT_ID, &TupleFilter::new(), filter)
            .await?;
        info!(?filter, snap_token = %snapshot, "Deleted attributes");
        Ok(snapshot)
    }

    pub async fn read_relationships(
        &self,
        filter: &TupleFilter,
        snapshot: SnapshotToken,
    ) -> Result<Vec<Tuple>> {
        self.store
            .read_relationships(DEFAULT_TENANT_ID, filter, snapshot)
            .await
    }

    pub async fn read_attributes(
        &self,
        filter: &AttributeFilter,
        snapshot: SnapshotToken,
    ) -> Result<Vec<Attribute>> {
        self.store
            .read_attributes(DEFAULT_TENANT_ID, filter, snapshot)
            .await
    }

    pub async fn head_snapshot(&self) -> Result<SnapshotToken> {
        self.store.head_snapshot(DEFAULT_TENANT_ID).await
    }

    pub fn entity_definitions(&self) -> Vec<&EntityDefinition> {
        self.schema.entity_definitions()
    }

    pub fn rule_definitions(&self) -> Vec<&RuleDefinition> {
        self.schema.rule_definitions()
    }

    pub fn schema_version(&self) -> &str {
        self.schema.version()
    }

    pub fn invoker(&self) -> &Invoker {
        &self.invoker
    }
}

/// Parse and validate textual relationships against the pinned schema.
fn parse_relationships(schema: &CompiledSchema, relationships: &[&str]) -> Result<Vec<Tuple>> {
    relationships
        .iter()
        .map(|relationship| {
            let tuple = parse_tuple(relationship)?;
            schema.validate_tuple(&tuple)?;
            Ok(tuple)
        })
        .collect()
}

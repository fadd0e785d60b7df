use crate::{
    error::{RebacError, Result},
    repository::{SchemaReader, SchemaWriter},
    schema::{CompiledSchema, Schema, SchemaRecord},
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// In-memory schema store. Versions are immutable once written; the most
/// recent write per tenant becomes its head version.
#[derive(Default)]
pub struct InMemorySchemaStore {
    schemas: DashMap<(String, String), Arc<CompiledSchema>>,
    heads: DashMap<String, String>,
}

impl InMemorySchemaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SchemaReader for InMemorySchemaStore {
    async fn read_schema(&self, tenant_id: &str, version: &str) -> Result<Arc<CompiledSchema>> {
        self.schemas
            .get(&(tenant_id.to_string(), version.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                RebacError::NotFound(format!(
                    "schema version '{}' for tenant '{}'",
                    version, tenant_id
                ))
            })
    }

    async fn head_version(&self, tenant_id: &str) -> Result<String> {
        self.heads
            .get(tenant_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RebacError::NotFound(format!("schema for tenant '{}'", tenant_id)))
    }
}

#[async_trait]
impl SchemaWriter for InMemorySchemaStore {
    async fn write_schema(&self, records: Vec<SchemaRecord>) -> Result<()> {
        let (tenant_id, version) = match records.first() {
            Some(first) => (first.tenant_id.clone(), first.version.clone()),
            None => {
                return Err(RebacError::InvalidArgument(
                    "schema write without definitions".to_string(),
                ))
            }
        };
        if records
            .iter()
            .any(|r| r.tenant_id != tenant_id || r.version != version)
        {
            return Err(RebacError::InvalidArgument(
                "schema records must share one tenant and version".to_string(),
            ));
        }

        let key = (tenant_id.clone(), version.clone());
        if self.schemas.contains_key(&key) {
            return Err(RebacError::Conflict(format!(
                "schema version '{}' already exists for tenant '{}'",
                version, tenant_id
            )));
        }

        let schema = Schema::from_records(&records)?;
        let compiled = CompiledSchema::new(&tenant_id, &version, schema)?;
        self.schemas.insert(key, Arc::new(compiled));
        self.heads.insert(tenant_id.clone(), version.clone());
        debug!(
            tenant_id = %tenant_id,
            version = %version,
            definitions = records.len(),
            "Stored schema version"
        );
        Ok(())
    }
}

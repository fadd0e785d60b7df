use crate::{
    check::CheckEngine,
    config::EngineConfig,
    error::{RebacError, Result},
    models::{CheckRequest, CheckResponse, CheckResponseMetadata, CheckResult, Decision, Entity, Subject},
    repository::{RelationshipReader, SchemaReader},
    token::SnapshotToken,
    tuple::{
        validate_entity, validate_name, validate_schema_version, validate_subject,
        validate_tenant_id,
    },
};
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Everything a check result depends on. Requests carrying context values
/// are never cached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    tenant_id: String,
    schema_version: String,
    snapshot: SnapshotToken,
    entity: Entity,
    subject: Subject,
    permission: String,
    depth: u32,
}

struct CheckCache {
    entries: DashMap<CacheKey, CheckResult, ahash::RandomState>,
    max_entries: usize,
}

impl CheckCache {
    fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::with_hasher(ahash::RandomState::new()),
            max_entries,
        }
    }

    fn get(&self, key: &CacheKey) -> Option<CheckResult> {
        self.entries.get(key).map(|entry| *entry.value())
    }

    fn insert(&self, key: CacheKey, result: CheckResult) {
        if self.entries.len() >= self.max_entries {
            debug!(entries = self.entries.len(), "Check cache full, clearing");
            self.entries.clear();
        }
        self.entries.insert(key, result);
    }
}

/// Entry point for check requests: validates identifiers, pins the schema
/// version and snapshot, applies defaults, and runs the evaluator under the
/// configured deadline.
pub struct Invoker {
    engine: CheckEngine,
    schema_reader: Arc<dyn SchemaReader>,
    relationship_reader: Arc<dyn RelationshipReader>,
    default_depth: u32,
    timeout: Option<Duration>,
    cache: Option<CheckCache>,
}

impl Invoker {
    pub fn new(
        schema_reader: Arc<dyn SchemaReader>,
        relationship_reader: Arc<dyn RelationshipReader>,
        config: &EngineConfig,
    ) -> Self {
        let engine = CheckEngine::new(schema_reader.clone(), relationship_reader.clone())
            .with_parallel_branches(config.parallel_branches);
        let cache = config
            .cache
            .enabled
            .then(|| CheckCache::new(config.cache.max_entries));

        Self {
            engine,
            schema_reader,
            relationship_reader,
            default_depth: config.default_depth,
            timeout: config.check_timeout(),
            cache,
        }
    }

    fn validate(&self, request: &CheckRequest) -> Result<()> {
        validate_tenant_id(&request.tenant_id)?;
        validate_schema_version(&request.metadata.schema_version)?;
        validate_entity(&request.entity)?;
        validate_subject(&request.subject)?;
        if request.subject.is_wildcard() {
            return Err(RebacError::InvalidArgument(format!(
                "cannot check permissions for wildcard subject '{}'",
                request.subject
            )));
        }
        validate_name("permission", &request.permission)?;
        for name in request.context.keys() {
            validate_name("context value", name)?;
        }
        Ok(())
    }

    #[instrument(
        skip(self, request),
        fields(
            tenant_id = %request.tenant_id,
            entity = %request.entity,
            permission = %request.permission,
            subject = %request.subject
        )
    )]
    pub async fn check(&self, request: &CheckRequest) -> Result<CheckResponse> {
        if let Err(error) = self.validate(request) {
            warn!(%error, "Rejected check request");
            return Err(error);
        }

        let mut resolved = request.clone();
        if resolved.metadata.schema_version.is_empty() {
            resolved.metadata.schema_version =
                self.schema_reader.head_version(&request.tenant_id).await?;
        }
        // pinned tokens are re-checked against retention before a cache hit
        resolved.metadata.snap_token = self
            .relationship_reader
            .resolve_snapshot(&request.tenant_id, request.metadata.snap_token)
            .await?;
        let depth = *resolved.metadata.depth.get_or_insert(self.default_depth);

        let cache_key = match self.cache {
            Some(_) if resolved.context.is_empty() => Some(CacheKey {
                tenant_id: resolved.tenant_id.clone(),
                schema_version: resolved.metadata.schema_version.clone(),
                snapshot: resolved.metadata.snap_token,
                entity: resolved.entity.clone(),
                subject: resolved.subject.clone(),
                permission: resolved.permission.clone(),
                depth,
            }),
            _ => None,
        };
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(can) = cache.get(key) {
                debug!(?can, "Check cache hit");
                return Ok(CheckResponse {
                    can,
                    metadata: CheckResponseMetadata {
                        check_count: 0,
                        snap_token: resolved.metadata.snap_token,
                        schema_version: resolved.metadata.schema_version,
                    },
                });
            }
        }

        let evaluation = self.engine.check(&resolved);
        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, evaluation)
                .await
                .map_err(|_| RebacError::DeadlineExceeded(limit))?,
            None => evaluation.await,
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(%error, kind = %error.kind(), "Check failed");
                return Err(error);
            }
        };

        if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
            cache.insert(key, outcome.result);
        }
        debug!(
            can = ?outcome.result,
            check_count = outcome.check_count,
            snap_token = %outcome.snap_token,
            "Check complete"
        );

        Ok(CheckResponse {
            can: outcome.result,
            metadata: CheckResponseMetadata {
                check_count: outcome.check_count,
                snap_token: outcome.snap_token,
                schema_version: outcome.schema_version,
            },
        })
    }

    /// Tri-state form of [`Invoker::check`]; errors keep their kind and are
    /// never reported as denials.
    pub async fn decide(&self, request: &CheckRequest) -> Decision {
        match self.check(request).await {
            Ok(response) => response.can.into(),
            Err(error) => Decision::Error(error.kind()),
        }
    }

    /// Evaluate independent requests concurrently. Results keep request order.
    pub async fn batch_check(&self, requests: &[CheckRequest]) -> Vec<Result<CheckResponse>> {
        join_all(requests.iter().map(|request| self.check(request))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::Tuple;
    use crate::repository::{
        InMemoryRelationshipStore, InMemorySchemaStore, RelationshipWriter, SchemaWriter,
    };
    use crate::schema::{EntityDefinition, Expression, Schema, SubjectReference};

    async fn setup(config: EngineConfig) -> (Invoker, Arc<InMemoryRelationshipStore>) {
        let schema = Schema::new().entity(EntityDefinition::new("user")).entity(
            EntityDefinition::new("repository")
                .relation("maintainer", [SubjectReference::entity("user")])
                .relation("reader", [SubjectReference::entity("user")])
                .permission("push", Expression::relation("maintainer"))
                .permission("pull", Expression::relation("reader").or(Expression::permission("push"))),
        );
        let schemas = Arc::new(InMemorySchemaStore::new());
        schemas.write_schema(schema.to_records("t1", "v1").unwrap()).await.unwrap();
        let store = Arc::new(InMemoryRelationshipStore::new());
        store
            .write("t1", vec!["repository:core#maintainer@user:ana".parse::<Tuple>().unwrap()], vec![])
            .await
            .unwrap();
        (Invoker::new(schemas, store.clone(), &config), store)
    }

    fn pull(subject: &str) -> CheckRequest {
        CheckRequest::new(
            "t1",
            Entity::new("repository", "core"),
            "pull",
            Subject::user(subject),
        )
    }

    #[tokio::test]
    async fn test_defaults_resolve_to_head() {
        let (invoker, store) = setup(EngineConfig::default()).await;
        let response = invoker.check(&pull("ana")).await.unwrap();
        assert_eq!(response.can, CheckResult::Allowed);
        assert_eq!(response.metadata.schema_version, "v1");
        assert_eq!(response.metadata.snap_token, store.head_snapshot("t1").await.unwrap());
        assert!(response.metadata.check_count >= 2);
    }

    #[tokio::test]
    async fn test_invalid_identifiers_rejected() {
        let (invoker, _) = setup(EngineConfig::default()).await;

        let mut bad_tenant = pull("ana");
        bad_tenant.tenant_id = "bad tenant".to_string();
        let mut bad_permission = pull("ana");
        bad_permission.permission = "pull!".to_string();
        let bad_version = pull("ana").with_schema_version("v1/../v2");
        let wildcard = CheckRequest::new(
            "t1",
            Entity::new("repository", "core"),
            "pull",
            Subject::wildcard("user"),
        );

        for request in [bad_tenant, bad_permission, bad_version, wildcard] {
            let err = invoker.check(&request).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
    }

    #[tokio::test]
    async fn test_decide_keeps_error_kind() {
        let (invoker, _) = setup(EngineConfig::default()).await;
        assert_eq!(invoker.decide(&pull("ana")).await, Decision::Allowed);
        assert_eq!(invoker.decide(&pull("bob")).await, Decision::Denied);
        assert_eq!(
            invoker.decide(&pull("ana").with_depth(0)).await,
            Decision::Error(ErrorKind::DepthExceeded)
        );

        let mut unknown_tenant = pull("ana");
        unknown_tenant.tenant_id = "t2".to_string();
        assert_eq!(
            invoker.decide(&unknown_tenant).await,
            Decision::Error(ErrorKind::NotFound)
        );
    }

    #[tokio::test]
    async fn test_cache_is_keyed_by_snapshot() {
        let mut config = EngineConfig::default();
        config.cache.enabled = true;
        let (invoker, store) = setup(config).await;

        let first = invoker.check(&pull("bob")).await.unwrap();
        assert_eq!(first.can, CheckResult::Denied);
        let cached = invoker.check(&pull("bob")).await.unwrap();
        assert_eq!(cached.can, CheckResult::Denied);
        assert_eq!(cached.metadata.check_count, 0);

        store
            .write("t1", vec!["repository:core#reader@user:bob".parse::<Tuple>().unwrap()], vec![])
            .await
            .unwrap();
        let fresh = invoker.check(&pull("bob")).await.unwrap();
        assert_eq!(fresh.can, CheckResult::Allowed);

        // the old snapshot still answers from its own entry
        let pinned = invoker
            .check(&pull("bob").at_snapshot(first.metadata.snap_token))
            .await
            .unwrap();
        assert_eq!(pinned.can, CheckResult::Denied);
    }

    #[tokio::test]
    async fn test_tenant_without_relationships_is_denied() {
        let schema = Schema::new().entity(EntityDefinition::new("user")).entity(
            EntityDefinition::new("repository")
                .relation("reader", [SubjectReference::entity("user")])
                .permission("pull", Expression::relation("reader")),
        );
        let schemas = Arc::new(InMemorySchemaStore::new());
        schemas.write_schema(schema.to_records("t1", "v1").unwrap()).await.unwrap();
        let invoker = Invoker::new(
            schemas,
            Arc::new(InMemoryRelationshipStore::new()),
            &EngineConfig::default(),
        );

        let response = invoker.check(&pull("ana")).await.unwrap();
        assert_eq!(response.can, CheckResult::Denied);
        assert_eq!(response.metadata.snap_token, SnapshotToken::Version(0));

        let mut unknown_tenant = pull("ana");
        unknown_tenant.tenant_id = "t2".to_string();
        let err = invoker.check(&unknown_tenant).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_cached_answer_expires_with_retention() {
        let mut config = EngineConfig::default();
        config.cache.enabled = true;

        let schema = Schema::new().entity(EntityDefinition::new("user")).entity(
            EntityDefinition::new("repository")
                .relation("reader", [SubjectReference::entity("user")])
                .permission("pull", Expression::relation("reader")),
        );
        let schemas = Arc::new(InMemorySchemaStore::new());
        schemas.write_schema(schema.to_records("t1", "v1").unwrap()).await.unwrap();
        let store = Arc::new(InMemoryRelationshipStore::new().with_retention(1));
        let first = store
            .write("t1", vec!["repository:core#reader@user:ana".parse::<Tuple>().unwrap()], vec![])
            .await
            .unwrap();
        let invoker = Invoker::new(schemas, store.clone(), &config);

        let pinned = pull("ana").at_snapshot(first);
        assert_eq!(invoker.check(&pinned).await.unwrap().can, CheckResult::Allowed);
        assert_eq!(invoker.check(&pinned).await.unwrap().metadata.check_count, 0);

        store
            .write("t1", vec!["repository:core#reader@user:bob".parse::<Tuple>().unwrap()], vec![])
            .await
            .unwrap();
        let err = invoker.check(&pinned).await.unwrap_err();
        assert!(matches!(err, RebacError::StaleSnapshot { .. }));
        assert_eq!(invoker.decide(&pinned).await, Decision::Error(ErrorKind::StaleSnapshot));
    }

    #[tokio::test]
    async fn test_batch_check_preserves_order() {
        let (invoker, _) = setup(EngineConfig::default()).await;
        let results = invoker
            .batch_check(&[pull("ana"), pull("bob"), pull("ana").with_schema_version("v9")])
            .await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().can, CheckResult::Allowed);
        assert_eq!(results[1].as_ref().unwrap().can, CheckResult::Denied);
        assert!(matches!(results[2], Err(RebacError::NotFound(_))));
    }
}

use crate::{
    error::{RebacError, Result},
    models::{AttributeValue, CheckRequest, CheckResult, Entity, Subject},
    repository::{RelationshipReader, SchemaReader},
    schema::{Argument, CompiledSchema, Expression},
    token::SnapshotToken,
};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::debug;

/// Depth budget used when a request does not carry one.
pub const DEFAULT_DEPTH: u32 = 20;

/// Result of one top-level evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub result: CheckResult,
    pub check_count: u32,
    /// Snapshot the evaluation actually read at
    pub snap_token: SnapshotToken,
    pub schema_version: String,
}

/// Permission evaluator.
///
/// Resolves the requested permission to its expression on the pinned schema
/// version and walks it against one relationship snapshot:
/// - relation leaves query the store, matching exact subjects, declared
///   wildcards, and expanding subject sets
/// - permission leaves recurse on the same entity
/// - rule leaves bind attributes and context values to a typed predicate
/// - tuple-to-userset leaves recurse on every related entity
///
/// Every descent into another (entity, name) pair consumes one unit of the
/// depth budget.
pub struct CheckEngine {
    schema_reader: Arc<dyn SchemaReader>,
    relationship_reader: Arc<dyn RelationshipReader>,
    parallel_branches: bool,
}

impl CheckEngine {
    pub fn new(
        schema_reader: Arc<dyn SchemaReader>,
        relationship_reader: Arc<dyn RelationshipReader>,
    ) -> Self {
        Self {
            schema_reader,
            relationship_reader,
            parallel_branches: true,
        }
    }

    /// Evaluate set-operation branches one after another instead of as
    /// concurrent tasks. Results are identical either way.
    pub fn with_parallel_branches(mut self, enabled: bool) -> Self {
        self.parallel_branches = enabled;
        self
    }

    pub async fn check(&self, request: &CheckRequest) -> Result<CheckOutcome> {
        let tenant_id = request.tenant_id.as_str();
        let version = if request.metadata.schema_version.is_empty() {
            self.schema_reader.head_version(tenant_id).await?
        } else {
            request.metadata.schema_version.clone()
        };
        let schema = self.schema_reader.read_schema(tenant_id, &version).await?;
        schema.resolve_expression(&request.entity.entity_type, &request.permission)?;

        let snapshot = self
            .relationship_reader
            .resolve_snapshot(tenant_id, request.metadata.snap_token)
            .await?;
        let budget = request.metadata.depth.unwrap_or(DEFAULT_DEPTH);

        let evaluation = Arc::new(Evaluation {
            reader: self.relationship_reader.clone(),
            schema,
            tenant_id: tenant_id.to_string(),
            snapshot,
            subject: request.subject.clone(),
            context: request.context.clone(),
            budget,
            memo: DashMap::with_hasher(ahash::RandomState::new()),
            check_count: AtomicU32::new(0),
            parallel: self.parallel_branches,
        });

        let resolution = evaluation
            .clone()
            .check_entity(
                request.entity.clone(),
                request.permission.clone(),
                budget,
                None,
            )
            .await?;

        Ok(CheckOutcome {
            result: CheckResult::from_allowed(resolution.allowed),
            check_count: evaluation.check_count.load(Ordering::Relaxed),
            snap_token: snapshot,
            schema_version: version,
        })
    }
}

/// One (entity, relation or permission) question for the fixed subject
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubCheck {
    entity: Entity,
    name: String,
}

/// Ancestors of the sub-check being evaluated
struct PathNode {
    key: SubCheck,
    parent: Path,
}

type Path = Option<Arc<PathNode>>;

fn on_path(path: &Path, key: &SubCheck) -> bool {
    let mut node = path.as_deref();
    while let Some(current) = node {
        if &current.key == key {
            return true;
        }
        node = current.parent.as_deref();
    }
    false
}

#[derive(Debug, Clone, Copy)]
struct Resolution {
    allowed: bool,
    /// Depends on a cycle cut, so must not be memoized
    provisional: bool,
}

impl Resolution {
    fn settled(allowed: bool) -> Self {
        Self {
            allowed,
            provisional: false,
        }
    }

    fn cycle() -> Self {
        Self {
            allowed: false,
            provisional: true,
        }
    }

    fn negate(self) -> Self {
        Self {
            allowed: !self.allowed,
            provisional: self.provisional,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Combine {
    Union,
    Intersection,
}

impl Combine {
    /// Branch value that decides the whole combinator
    fn decisive(self) -> bool {
        matches!(self, Self::Union)
    }
}

fn schema_mismatch(error: RebacError) -> RebacError {
    match error {
        RebacError::NotFound(what) => RebacError::SchemaMismatch(format!("undeclared {}", what)),
        other => other,
    }
}

/// State shared by every sub-check of one top-level check
struct Evaluation {
    reader: Arc<dyn RelationshipReader>,
    schema: Arc<CompiledSchema>,
    tenant_id: String,
    snapshot: SnapshotToken,
    subject: Subject,
    context: BTreeMap<String, AttributeValue>,
    budget: u32,
    /// Settled results and the smallest depth they were computed with
    memo: DashMap<SubCheck, (bool, u32), ahash::RandomState>,
    check_count: AtomicU32,
    parallel: bool,
}

impl Evaluation {
    fn check_entity(
        self: Arc<Self>,
        entity: Entity,
        name: String,
        depth: u32,
        path: Path,
    ) -> BoxFuture<'static, Result<Resolution>> {
        async move {
            let key = SubCheck { entity, name };
            if on_path(&path, &key) {
                debug!(entity = %key.entity, name = %key.name, "Cycle cut");
                return Ok(Resolution::cycle());
            }

            let memoized = self.memo.get(&key).map(|entry| *entry.value());
            if let Some((allowed, computed_at)) = memoized {
                if computed_at <= depth {
                    return Ok(Resolution::settled(allowed));
                }
            }

            if depth == 0 {
                return Err(RebacError::DepthExceeded {
                    budget: self.budget,
                });
            }

            self.check_count.fetch_add(1, Ordering::Relaxed);
            let expression = self
                .schema
                .resolve_expression(&key.entity.entity_type, &key.name)
                .map_err(schema_mismatch)?;
            self.schema
                .verify_references(&key.entity.entity_type, &key.name)?;
            debug!(
                entity = %key.entity,
                name = %key.name,
                subject = %self.subject,
                depth,
                "Evaluating sub-check"
            );

            let node = Arc::new(PathNode {
                key: key.clone(),
                parent: path,
            });
            let resolution = self
                .clone()
                .evaluate(key.entity.clone(), expression, depth, Some(node))
                .await?;

            if !resolution.provisional {
                self.memo
                    .entry(key)
                    .and_modify(|stored| {
                        if depth < stored.1 {
                            *stored = (resolution.allowed, depth);
                        }
                    })
                    .or_insert((resolution.allowed, depth));
            }
            Ok(resolution)
        }
        .boxed()
    }

    fn evaluate(
        self: Arc<Self>,
        entity: Entity,
        expression: Expression,
        depth: u32,
        path: Path,
    ) -> BoxFuture<'static, Result<Resolution>> {
        async move {
            match expression {
                Expression::Relation(relation) => {
                    self.check_direct(entity, relation, depth, path).await
                }
                Expression::Permission(name) => {
                    self.check_entity(entity, name, depth - 1, path).await
                }
                Expression::Rule { name, arguments } => {
                    self.check_rule(entity, name, arguments).await
                }
                Expression::TupleToUserset { tupleset, computed } => {
                    self.check_tuple_to_userset(entity, tupleset, computed, depth, path)
                        .await
                }
                Expression::Union(children) => {
                    let branches = children
                        .into_iter()
                        .map(|child| self.clone().evaluate(entity.clone(), child, depth, path.clone()))
                        .collect();
                    self.combine(Combine::Union, branches).await
                }
                Expression::Intersection(children) => {
                    let branches = children
                        .into_iter()
                        .map(|child| self.clone().evaluate(entity.clone(), child, depth, path.clone()))
                        .collect();
                    self.combine(Combine::Intersection, branches).await
                }
                Expression::Exclusion { base, subtract } => {
                    let base = self.clone().evaluate(entity.clone(), *base, depth, path.clone());
                    let subtract = self
                        .clone()
                        .evaluate(entity, *subtract, depth, path)
                        .map(|outcome| outcome.map(Resolution::negate))
                        .boxed();
                    self.combine(Combine::Intersection, vec![base, subtract]).await
                }
            }
        }
        .boxed()
    }

    async fn check_direct(
        self: Arc<Self>,
        entity: Entity,
        relation: String,
        depth: u32,
        path: Path,
    ) -> Result<Resolution> {
        let wildcard_declared = self
            .schema
            .lookup(&entity.entity_type)
            .map_err(schema_mismatch)?
            .get_relation(&relation)
            .map(|definition| definition.allows_wildcard(&self.subject.subject_type))
            .ok_or_else(|| {
                RebacError::SchemaMismatch(format!(
                    "undeclared relation '{}' on entity type '{}'",
                    relation, entity.entity_type
                ))
            })?;

        let subjects = self
            .reader
            .query_relationships(&self.tenant_id, &entity, &relation, self.snapshot)
            .await?;

        let mut branches = Vec::new();
        for subject in subjects {
            if subject == self.subject {
                return Ok(Resolution::settled(true));
            }
            if subject.is_wildcard() {
                if wildcard_declared
                    && subject.subject_type == self.subject.subject_type
                    && !self.subject.is_subject_set()
                {
                    return Ok(Resolution::settled(true));
                }
                continue;
            }
            if let Some(subject_relation) = subject.relation.clone() {
                branches.push(self.clone().check_entity(
                    subject.as_entity(),
                    subject_relation,
                    depth - 1,
                    path.clone(),
                ));
            }
        }

        if branches.is_empty() {
            return Ok(Resolution::settled(false));
        }
        self.combine(Combine::Union, branches).await
    }

    async fn check_tuple_to_userset(
        self: Arc<Self>,
        entity: Entity,
        tupleset: String,
        computed: String,
        depth: u32,
        path: Path,
    ) -> Result<Resolution> {
        self.schema
            .lookup(&entity.entity_type)
            .map_err(schema_mismatch)?
            .get_relation(&tupleset)
            .ok_or_else(|| {
                RebacError::SchemaMismatch(format!(
                    "undeclared relation '{}' on entity type '{}'",
                    tupleset, entity.entity_type
                ))
            })?;

        let related = self
            .reader
            .query_relationships(&self.tenant_id, &entity, &tupleset, self.snapshot)
            .await?;

        let branches: Vec<_> = related
            .into_iter()
            .filter(|subject| !subject.is_wildcard())
            .map(|subject| {
                self.clone()
                    .check_entity(subject.as_entity(), computed.clone(), depth - 1, path.clone())
            })
            .collect();

        if branches.is_empty() {
            return Ok(Resolution::settled(false));
        }
        self.combine(Combine::Union, branches).await
    }

    async fn check_rule(
        self: Arc<Self>,
        entity: Entity,
        name: String,
        arguments: Vec<Argument>,
    ) -> Result<Resolution> {
        let rule = self.schema.rule(&name).map_err(schema_mismatch)?;
        if rule.parameters.len() != arguments.len() {
            return Err(RebacError::SchemaMismatch(format!(
                "rule '{}' takes {} arguments, {} given",
                name,
                rule.parameters.len(),
                arguments.len()
            )));
        }

        let mut bindings = HashMap::with_capacity(arguments.len());
        for (parameter, argument) in rule.parameters.iter().zip(arguments) {
            let value = match argument {
                Argument::Literal(value) => value,
                Argument::Context(key) => self.context.get(&key).cloned().ok_or_else(|| {
                    RebacError::InvalidArgument(format!(
                        "rule '{}' needs context value '{}'",
                        name, key
                    ))
                })?,
                Argument::Attribute(attribute) => self
                    .reader
                    .query_attribute(&self.tenant_id, &entity, &attribute, self.snapshot)
                    .await?
                    .unwrap_or_else(|| parameter.attribute_type.default_value()),
            };
            bindings.insert(parameter.name.clone(), value);
        }

        let allowed = rule.evaluate(&bindings)?;
        debug!(entity = %entity, rule = %name, allowed, "Evaluated rule");
        Ok(Resolution::settled(allowed))
    }

    /// Combine branch results. A decisive branch settles the combinator at
    /// once and drops its siblings; otherwise the lowest-index error wins over
    /// the non-decisive result so outcomes do not depend on scheduling.
    fn combine(
        &self,
        mode: Combine,
        branches: Vec<BoxFuture<'static, Result<Resolution>>>,
    ) -> BoxFuture<'static, Result<Resolution>> {
        let parallel = self.parallel && branches.len() > 1;
        async move {
            let decisive = mode.decisive();
            let mut provisional = false;
            let mut first_error: Option<(usize, RebacError)> = None;

            if parallel {
                let mut tasks = JoinSet::new();
                for (index, branch) in branches.into_iter().enumerate() {
                    tasks.spawn(async move { (index, branch.await) });
                }
                while let Some(joined) = tasks.join_next().await {
                    let (index, outcome) = joined.map_err(|e| {
                        RebacError::Internal(anyhow::anyhow!("sub-check task failed: {}", e))
                    })?;
                    match outcome {
                        Ok(resolution) if resolution.allowed == decisive => return Ok(resolution),
                        Ok(resolution) => provisional |= resolution.provisional,
                        Err(error) => {
                            if first_error.as_ref().map_or(true, |(seen, _)| index < *seen) {
                                first_error = Some((index, error));
                            }
                        }
                    }
                }
            } else {
                for (index, branch) in branches.into_iter().enumerate() {
                    match branch.await {
                        Ok(resolution) if resolution.allowed == decisive => return Ok(resolution),
                        Ok(resolution) => provisional |= resolution.provisional,
                        Err(error) => {
                            if first_error.is_none() {
                                first_error = Some((index, error));
                            }
                        }
                    }
                }
            }

            match first_error {
                Some((_, error)) => Err(error),
                None => Ok(Resolution {
                    allowed: !decisive,
                    provisional,
                }),
            }
        }
        .boxed()
    }
}

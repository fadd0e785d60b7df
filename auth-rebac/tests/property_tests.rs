//! Behavioural guarantees of the evaluator
//!
//! - repeated checks agree
//! - pinned snapshots ignore concurrent writes
//! - adding tuples never revokes union-only permissions
//! - exclusion, depth budgets and cyclic membership data
//! - store failures surface as errors, never as denials

use async_trait::async_trait;
use auth_rebac::{
    Attribute, AttributeFilter, AttributeValue, CheckRequest, CheckResult, Decision, EngineConfig,
    Entity, EntityDefinition, ErrorKind, Expression, InMemoryRelationshipStore, InMemorySchemaStore,
    Invoker, RebacError, RelationshipReader, RelationshipWriter, Schema, SchemaWriter,
    SnapshotToken, Subject, SubjectReference, Tuple, TupleFilter,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const USERS: [&str; 4] = ["ana", "bo", "cy", "di"];
const ROLES: [&str; 4] = ["viewer", "editor", "owner", "banned"];

fn document_schema() -> Schema {
    let users = || [SubjectReference::entity("user")];

    Schema::new()
        .entity(EntityDefinition::new("user"))
        .entity(EntityDefinition::new("group").relation(
            "member",
            [
                SubjectReference::entity("user"),
                SubjectReference::subject_set("group", "member"),
            ],
        ))
        .entity(
            EntityDefinition::new("document")
                .relation("viewer", users())
                .relation("editor", users())
                .relation("owner", users())
                .relation("banned", users())
                .relation("readers", [SubjectReference::subject_set("group", "member")])
                .permission(
                    "edit",
                    Expression::relation("editor").or(Expression::relation("owner")),
                )
                .permission(
                    "view",
                    Expression::relation("viewer")
                        .or(Expression::permission("edit"))
                        .or(Expression::relation("readers")),
                )
                .permission(
                    "comment",
                    Expression::permission("view").but_not(Expression::relation("banned")),
                ),
        )
}

async fn schema_store(schema: &Schema) -> Arc<InMemorySchemaStore> {
    let schemas = Arc::new(InMemorySchemaStore::new());
    schemas
        .write_schema(schema.to_records("t1", "v1").unwrap())
        .await
        .unwrap();
    schemas
}

fn request(permission: &str, user: &str) -> CheckRequest {
    CheckRequest::new(
        "t1",
        Entity::new("document", "plan"),
        permission,
        Subject::user(user),
    )
}

fn role_tuple(user: usize, role: usize) -> Tuple {
    Tuple::new(
        Entity::new("document", "plan"),
        ROLES[role],
        Subject::user(USERS[user]),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_checks_agree() {
    let schemas = schema_store(&document_schema()).await;
    let store = Arc::new(InMemoryRelationshipStore::new());
    let mut tuples = vec!["document:plan#readers@group:g0#member".parse::<Tuple>().unwrap()];
    for i in 0..16 {
        tuples.push(format!("group:g{}#member@group:g{}#member", i, i + 1).parse().unwrap());
    }
    tuples.push("group:g16#member@user:ana".parse().unwrap());
    store.write("t1", tuples, vec![]).await.unwrap();

    let invoker = Invoker::new(schemas, store, &EngineConfig::default());
    for user in ["ana", "bo"] {
        let first = invoker.check(&request("view", user)).await.unwrap();
        for _ in 0..20 {
            let again = invoker.check(&request("view", user)).await.unwrap();
            assert_eq!(again.can, first.can, "{} view", user);
        }
    }
    assert!(invoker.check(&request("view", "ana")).await.unwrap().can.is_allowed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pinned_snapshot_ignores_concurrent_writes() {
    let schemas = schema_store(&document_schema()).await;
    let store = Arc::new(InMemoryRelationshipStore::new());
    let pinned = store
        .write("t1", vec![role_tuple(0, 0)], vec![])
        .await
        .unwrap();
    let invoker = Arc::new(Invoker::new(schemas, store.clone(), &EngineConfig::default()));

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            for user in 1..USERS.len() {
                for role in 0..3 {
                    store
                        .write("t1", vec![role_tuple(user, role)], vec![])
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..4 {
        let invoker = invoker.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..25 {
                for user in &USERS[1..] {
                    let response = invoker
                        .check(&request("view", user).at_snapshot(pinned))
                        .await
                        .unwrap();
                    assert_eq!(response.can, CheckResult::Denied, "{} at {}", user, pinned);
                    assert_eq!(response.metadata.snap_token, pinned);
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    writer.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }

    let latest = invoker.check(&request("view", "di")).await.unwrap();
    assert_eq!(latest.can, CheckResult::Allowed);
}

async fn union_results(existing: &[(usize, usize)]) -> Vec<bool> {
    let schemas = schema_store(&document_schema()).await;
    let store = Arc::new(InMemoryRelationshipStore::new());
    let tuples = existing.iter().map(|&(user, role)| role_tuple(user, role)).collect();
    store.write("t1", tuples, vec![]).await.unwrap();
    let invoker = Invoker::new(schemas, store, &EngineConfig::default());

    let mut results = Vec::new();
    for user in USERS {
        for permission in ["edit", "view"] {
            let response = invoker.check(&request(permission, user)).await.unwrap();
            results.push(response.can.is_allowed());
        }
    }
    results
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_adding_a_tuple_never_revokes_union_permissions(
        existing in prop::collection::vec((0..USERS.len(), 0..ROLES.len()), 0..8),
        added in (0..USERS.len(), 0..ROLES.len()),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let mut extended = existing.clone();
        extended.push(added);
        let before = runtime.block_on(union_results(&existing));
        let after = runtime.block_on(union_results(&extended));

        for (index, (was, now)) in before.iter().zip(after.iter()).enumerate() {
            prop_assert!(!*was || *now, "check {} went from ALLOWED to DENIED", index);
        }
    }
}

#[tokio::test]
async fn test_exclusion_truth_table() {
    let schemas = schema_store(&document_schema()).await;
    let store = Arc::new(InMemoryRelationshipStore::new());
    store
        .write(
            "t1",
            vec![
                // ana: view, not banned; bo: view and banned; cy: banned only
                role_tuple(0, 0),
                role_tuple(1, 0),
                role_tuple(1, 3),
                role_tuple(2, 3),
            ],
            vec![],
        )
        .await
        .unwrap();
    let invoker = Invoker::new(schemas, store, &EngineConfig::default());

    for (user, expected) in [("ana", true), ("bo", false), ("cy", false), ("di", false)] {
        let response = invoker.check(&request("comment", user)).await.unwrap();
        assert_eq!(response.can.is_allowed(), expected, "{} comment", user);
    }
}

async fn cyclic_groups(member_of_last: bool) -> Invoker {
    let schemas = schema_store(&document_schema()).await;
    let store = Arc::new(InMemoryRelationshipStore::new());
    let mut tuples: Vec<Tuple> = vec![
        "group:a#member@group:b#member".parse().unwrap(),
        "group:b#member@group:c#member".parse().unwrap(),
        "group:c#member@group:a#member".parse().unwrap(),
    ];
    if member_of_last {
        tuples.push("group:c#member@user:ana".parse().unwrap());
    }
    store.write("t1", tuples, vec![]).await.unwrap();
    Invoker::new(schemas, store, &EngineConfig::default())
}

fn group_member(user: &str, depth: u32) -> CheckRequest {
    CheckRequest::new("t1", Entity::new("group", "a"), "member", Subject::user(user)).with_depth(depth)
}

#[tokio::test]
async fn test_depth_budget_against_membership_cycle() {
    // a -> b -> c -> a is a cycle of length 3
    let invoker = cyclic_groups(false).await;

    let err = invoker.check(&group_member("ana", 2)).await.unwrap_err();
    assert!(matches!(err, RebacError::DepthExceeded { budget: 2 }));

    for budget in [3, 4, 20, 200] {
        let response = invoker.check(&group_member("ana", budget)).await.unwrap();
        assert_eq!(response.can, CheckResult::Denied, "budget {}", budget);
    }

    let invoker = cyclic_groups(true).await;
    let err = invoker.check(&group_member("ana", 2)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DepthExceeded);
    let response = invoker.check(&group_member("ana", 3)).await.unwrap();
    assert_eq!(response.can, CheckResult::Allowed);
}

#[tokio::test]
async fn test_writing_a_tuple_twice_changes_nothing() {
    let once = InMemoryRelationshipStore::new();
    let twice = InMemoryRelationshipStore::new();
    let tuple = role_tuple(0, 1);

    once.write("t1", vec![tuple.clone()], vec![]).await.unwrap();
    twice.write("t1", vec![tuple.clone()], vec![]).await.unwrap();
    twice.write("t1", vec![tuple.clone()], vec![]).await.unwrap();

    let all = TupleFilter::new();
    assert_eq!(
        once.read_relationships("t1", &all, SnapshotToken::noop()).await.unwrap(),
        twice.read_relationships("t1", &all, SnapshotToken::noop()).await.unwrap()
    );
    assert_eq!(
        twice
            .query_relationships("t1", &tuple.entity, "editor", SnapshotToken::noop())
            .await
            .unwrap(),
        vec![Subject::user("ana")]
    );
}

/// Fails every query for one relation and delays the rest
struct FaultyReader {
    inner: InMemoryRelationshipStore,
    failing_relation: Option<&'static str>,
    delay: Option<Duration>,
}

#[async_trait]
impl RelationshipReader for FaultyReader {
    async fn query_relationships(
        &self,
        tenant_id: &str,
        entity: &Entity,
        relation: &str,
        snapshot: SnapshotToken,
    ) -> auth_rebac::Result<Vec<Subject>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_relation == Some(relation) {
            return Err(RebacError::StoreUnavailable("replica offline".to_string()));
        }
        self.inner
            .query_relationships(tenant_id, entity, relation, snapshot)
            .await
    }

    async fn query_attribute(
        &self,
        tenant_id: &str,
        entity: &Entity,
        attribute: &str,
        snapshot: SnapshotToken,
    ) -> auth_rebac::Result<Option<AttributeValue>> {
        self.inner
            .query_attribute(tenant_id, entity, attribute, snapshot)
            .await
    }

    async fn read_relationships(
        &self,
        tenant_id: &str,
        filter: &TupleFilter,
        snapshot: SnapshotToken,
    ) -> auth_rebac::Result<Vec<Tuple>> {
        self.inner.read_relationships(tenant_id, filter, snapshot).await
    }

    async fn read_attributes(
        &self,
        tenant_id: &str,
        filter: &AttributeFilter,
        snapshot: SnapshotToken,
    ) -> auth_rebac::Result<Vec<Attribute>> {
        self.inner.read_attributes(tenant_id, filter, snapshot).await
    }

    async fn head_snapshot(&self, tenant_id: &str) -> auth_rebac::Result<SnapshotToken> {
        self.inner.head_snapshot(tenant_id).await
    }

    async fn resolve_snapshot(
        &self,
        tenant_id: &str,
        snapshot: SnapshotToken,
    ) -> auth_rebac::Result<SnapshotToken> {
        self.inner.resolve_snapshot(tenant_id, snapshot).await
    }
}

async fn faulty_invoker(
    failing_relation: Option<&'static str>,
    delay: Option<Duration>,
    config: EngineConfig,
) -> Invoker {
    let schemas = schema_store(&document_schema()).await;
    let inner = InMemoryRelationshipStore::new();
    inner
        .write("t1", vec![role_tuple(0, 0)], vec![])
        .await
        .unwrap();
    let reader = Arc::new(FaultyReader {
        inner,
        failing_relation,
        delay,
    });
    Invoker::new(schemas, reader, &config)
}

#[tokio::test]
async fn test_store_failure_is_not_a_denial() {
    let invoker = faulty_invoker(Some("banned"), None, EngineConfig::default()).await;

    let err = invoker.check(&request("comment", "ana")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    assert!(err.is_retryable());
    assert_eq!(
        invoker.decide(&request("comment", "ana")).await,
        Decision::Error(ErrorKind::StoreUnavailable)
    );

    // a decisive branch elsewhere still settles the union
    let response = invoker.check(&request("view", "ana")).await.unwrap();
    assert_eq!(response.can, CheckResult::Allowed);
}

#[tokio::test]
async fn test_deadline_aborts_the_check_tree() {
    let config = EngineConfig {
        check_timeout_ms: Some(20),
        ..EngineConfig::default()
    };
    let invoker = faulty_invoker(None, Some(Duration::from_millis(500)), config).await;

    let err = invoker.check(&request("view", "ana")).await.unwrap_err();
    assert!(matches!(err, RebacError::DeadlineExceeded(_)));
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
}

#[tokio::test]
async fn test_undeclared_reference_is_a_schema_mismatch() {
    // written without validation, as an external compiler might
    let schema = Schema::new().entity(EntityDefinition::new("user")).entity(
        EntityDefinition::new("document")
            .relation("viewer", [SubjectReference::entity("user")])
            .permission("view", Expression::relation("viewer").and(Expression::relation("approver")))
            .permission("browse", Expression::tuple_to_userset("parent", "view")),
    );
    assert!(schema.validate().is_err());

    let schemas = schema_store(&schema).await;
    let store = Arc::new(InMemoryRelationshipStore::new());
    store.write("t1", vec![role_tuple(0, 0)], vec![]).await.unwrap();
    let invoker = Invoker::new(schemas, store, &EngineConfig::default());

    let err = invoker.check(&request("view", "ana")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    // a denied sibling does not hide the undeclared reference
    let err = invoker.check(&request("view", "bo")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    // nor does an empty traversal through an undeclared relation
    let err = invoker.check(&request("browse", "ana")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    // an empty relation is still a denial, not an error
    let response = invoker.check(&request("viewer", "bo")).await.unwrap();
    assert_eq!(response.can, CheckResult::Denied);
}

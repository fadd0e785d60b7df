//! Relationship-based permission evaluation engine for RustCare Engine
//!
//! This crate answers "may subject S perform permission P on entity E?" from:
//! - a compiled schema of entity types, relations, permission expressions and rules
//! - relationship tuples and attributes read at a consistent snapshot
//! - a depth budget bounding recursion through cyclic relationship data
//!
//! # Core Concepts
//!
//! - **Tuple**: `entityType:entityID#relation@subjectType:subjectID[#subjectRelation]`
//! - **Subject set**: every subject holding a relation on another entity, e.g. `team:ops#member`
//! - **Tuple-to-userset**: follow a relation to related entities and evaluate a permission there
//! - **Snapshot token**: an opaque marker of a committed point in relationship history
//!
//! # Example
//!
//! ```rust,ignore
//! use auth_rebac::{Engine, EntityDefinition, Expression, Schema, SubjectReference};
//!
//! #[tokio::main]
//! async fn main() -> auth_rebac::Result<()> {
//!     let schema = Schema::new()
//!         .entity(EntityDefinition::new("user"))
//!         .entity(
//!             EntityDefinition::new("document")
//!                 .relation("owner", [SubjectReference::entity("user")])
//!                 .action("edit", Expression::relation("owner")),
//!         );
//!
//!     let engine = Engine::new(schema, &["document:readme#owner@user:alice"]).await?;
//!     assert!(engine.check("user:alice", "edit", "document:readme").await?);
//!     Ok(())
//! }
//! ```

pub mod check;
pub mod config;
pub mod engine;
pub mod error;
pub mod invoke;
pub mod models;
pub mod repository;
pub mod rules;
pub mod schema;
pub mod telemetry;
pub mod token;
pub mod tuple;

pub use check::{CheckEngine, CheckOutcome, DEFAULT_DEPTH};
pub use config::EngineConfig;
pub use engine::{Engine, DEFAULT_TENANT_ID};
pub use error::*;
pub use invoke::Invoker;
pub use models::*;
pub use repository::{
    InMemoryRelationshipStore, InMemorySchemaStore, RelationshipReader, RelationshipWriter,
    SchemaReader, SchemaWriter,
};
pub use rules::*;
pub use schema::*;
pub use token::SnapshotToken;
pub use tuple::{parse_entity, parse_subject, parse_tuple};

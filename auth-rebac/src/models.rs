use crate::error::ErrorKind;
use crate::token::SnapshotToken;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Subject id that, when declared on a relation, stands for every subject of a type.
pub const WILDCARD: &str = "*";

/// A concrete entity (resource) identified by type and id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: String,
    pub id: String,
}

impl Entity {
    pub fn new(entity_type: &str, id: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

/// A subject holding a relation. With `relation` set it is a subject set:
/// every subject holding `relation` on the entity `subject_type:id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subject {
    pub subject_type: String,
    pub id: String,
    pub relation: Option<String>,
}

impl Subject {
    pub fn new(subject_type: &str, id: &str) -> Self {
        Self {
            subject_type: subject_type.to_string(),
            id: id.to_string(),
            relation: None,
        }
    }

    pub fn user(user_id: &str) -> Self {
        Self::new("user", user_id)
    }

    pub fn subject_set(subject_type: &str, id: &str, relation: &str) -> Self {
        Self {
            subject_type: subject_type.to_string(),
            id: id.to_string(),
            relation: Some(relation.to_string()),
        }
    }

    pub fn wildcard(subject_type: &str) -> Self {
        Self::new(subject_type, WILDCARD)
    }

    pub fn is_wildcard(&self) -> bool {
        self.id == WILDCARD
    }

    pub fn is_subject_set(&self) -> bool {
        self.relation.is_some()
    }

    /// The entity a subject set points at.
    pub fn as_entity(&self) -> Entity {
        Entity::new(&self.subject_type, &self.id)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.relation {
            Some(ref relation) => write!(f, "{}:{}#{}", self.subject_type, self.id, relation),
            None => write!(f, "{}:{}", self.subject_type, self.id),
        }
    }
}

/// Relationship tuple: subject holds `relation` on entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tuple {
    pub entity: Entity,
    pub relation: String,
    pub subject: Subject,
}

impl Tuple {
    pub fn new(entity: Entity, relation: &str, subject: Subject) -> Self {
        Self {
            entity,
            relation: relation.to_string(),
            subject,
        }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.entity, self.relation, self.subject)
    }
}

/// Type of an attribute or rule parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    Boolean,
    Integer,
    Double,
    String,
    BooleanArray,
    IntegerArray,
    DoubleArray,
    StringArray,
}

impl AttributeType {
    /// Value bound to a rule parameter when the attribute was never written.
    pub fn default_value(self) -> AttributeValue {
        match self {
            Self::Boolean => AttributeValue::Boolean(false),
            Self::Integer => AttributeValue::Integer(0),
            Self::Double => AttributeValue::Double(0.0),
            Self::String => AttributeValue::String(String::new()),
            Self::BooleanArray => AttributeValue::BooleanArray(Vec::new()),
            Self::IntegerArray => AttributeValue::IntegerArray(Vec::new()),
            Self::DoubleArray => AttributeValue::DoubleArray(Vec::new()),
            Self::StringArray => AttributeValue::StringArray(Vec::new()),
        }
    }
}

/// Typed attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeValue {
    Boolean(bool),
    Integer(i64),
    Double(f64),
    String(String),
    BooleanArray(Vec<bool>),
    IntegerArray(Vec<i64>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
}

impl AttributeValue {
    pub fn attribute_type(&self) -> AttributeType {
        match self {
            Self::Boolean(_) => AttributeType::Boolean,
            Self::Integer(_) => AttributeType::Integer,
            Self::Double(_) => AttributeType::Double,
            Self::String(_) => AttributeType::String,
            Self::BooleanArray(_) => AttributeType::BooleanArray,
            Self::IntegerArray(_) => AttributeType::IntegerArray,
            Self::DoubleArray(_) => AttributeType::DoubleArray,
            Self::StringArray(_) => AttributeType::StringArray,
        }
    }
}

/// Attribute fact on an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub entity: Entity,
    pub name: String,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn new(entity: Entity, name: &str, value: AttributeValue) -> Self {
        Self {
            entity,
            name: name.to_string(),
            value,
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}${}", self.entity, self.name)
    }
}

/// Constraint on the relation of a tuple's subject
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectRelationFilter {
    #[default]
    Any,
    /// Plain subjects only
    Absent,
    Exactly(String),
}

impl SubjectRelationFilter {
    fn matches(&self, relation: Option<&String>) -> bool {
        match self {
            Self::Any => true,
            Self::Absent => relation.is_none(),
            Self::Exactly(expected) => relation == Some(expected),
        }
    }
}

/// Filter over relationship tuples. Unset fields match anything; empty id
/// lists match any id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleFilter {
    pub entity_type: Option<String>,
    pub entity_ids: Vec<String>,
    pub relation: Option<String>,
    pub subject_type: Option<String>,
    pub subject_ids: Vec<String>,
    pub subject_relation: SubjectRelationFilter,
}

impl TupleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, entity_type: &str, ids: &[&str]) -> Self {
        self.entity_type = Some(entity_type.to_string());
        self.entity_ids = ids.iter().map(|id| id.to_string()).collect();
        self
    }

    pub fn relation(mut self, relation: &str) -> Self {
        self.relation = Some(relation.to_string());
        self
    }

    pub fn subject(mut self, subject_type: &str, ids: &[&str]) -> Self {
        self.subject_type = Some(subject_type.to_string());
        self.subject_ids = ids.iter().map(|id| id.to_string()).collect();
        self
    }

    pub fn subject_relation(mut self, relation: &str) -> Self {
        self.subject_relation = SubjectRelationFilter::Exactly(relation.to_string());
        self
    }

    /// Match only subjects without a relation, e.g. `user:bob` but not
    /// `user:bob#friend`.
    pub fn plain_subjects(mut self) -> Self {
        self.subject_relation = SubjectRelationFilter::Absent;
        self
    }

    /// Filter matching exactly one tuple.
    pub fn exact(tuple: &Tuple) -> Self {
        let filter = Self::new()
            .entity(&tuple.entity.entity_type, &[tuple.entity.id.as_str()])
            .relation(&tuple.relation)
            .subject(&tuple.subject.subject_type, &[tuple.subject.id.as_str()]);
        match tuple.subject.relation {
            Some(ref relation) => filter.subject_relation(relation),
            None => filter.plain_subjects(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn matches(&self, tuple: &Tuple) -> bool {
        fn field(filter: &Option<String>, value: &str) -> bool {
            filter.as_deref().map_or(true, |expected| expected == value)
        }
        fn ids(filter: &[String], value: &str) -> bool {
            filter.is_empty() || filter.iter().any(|id| id == value)
        }

        field(&self.entity_type, &tuple.entity.entity_type)
            && ids(&self.entity_ids, &tuple.entity.id)
            && field(&self.relation, &tuple.relation)
            && field(&self.subject_type, &tuple.subject.subject_type)
            && ids(&self.subject_ids, &tuple.subject.id)
            && self.subject_relation.matches(tuple.subject.relation.as_ref())
    }
}

/// Filter over attribute facts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeFilter {
    pub entity_type: Option<String>,
    pub entity_ids: Vec<String>,
    pub attributes: Vec<String>,
}

impl AttributeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, entity_type: &str, ids: &[&str]) -> Self {
        self.entity_type = Some(entity_type.to_string());
        self.entity_ids = ids.iter().map(|id| id.to_string()).collect();
        self
    }

    pub fn attributes(mut self, names: &[&str]) -> Self {
        self.attributes = names.iter().map(|name| name.to_string()).collect();
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn matches(&self, attribute: &Attribute) -> bool {
        self.entity_type
            .as_deref()
            .map_or(true, |t| t == attribute.entity.entity_type)
            && (self.entity_ids.is_empty() || self.entity_ids.contains(&attribute.entity.id))
            && (self.attributes.is_empty() || self.attributes.contains(&attribute.name))
    }
}

/// Outcome of a permission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckResult {
    Allowed,
    Denied,
}

impl CheckResult {
    pub fn from_allowed(allowed: bool) -> Self {
        if allowed {
            Self::Allowed
        } else {
            Self::Denied
        }
    }

    pub fn is_allowed(self) -> bool {
        self == Self::Allowed
    }
}

/// Tri-state decision handed back to transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allowed,
    Denied,
    Error(ErrorKind),
}

impl From<CheckResult> for Decision {
    fn from(result: CheckResult) -> Self {
        match result {
            CheckResult::Allowed => Self::Allowed,
            CheckResult::Denied => Self::Denied,
        }
    }
}

/// Check request metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckMetadata {
    /// No-op token means "latest".
    pub snap_token: SnapshotToken,
    /// Empty means the latest schema version of the tenant.
    pub schema_version: String,
    /// `None` falls back to the configured default budget.
    pub depth: Option<u32>,
}

/// Permission check request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    pub tenant_id: String,
    pub entity: Entity,
    pub subject: Subject,
    pub permission: String,
    pub metadata: CheckMetadata,
    /// Named values for rule arguments supplied by the caller.
    pub context: BTreeMap<String, AttributeValue>,
}

impl CheckRequest {
    pub fn new(tenant_id: &str, entity: Entity, permission: &str, subject: Subject) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            entity,
            subject,
            permission: permission.to_string(),
            metadata: CheckMetadata::default(),
            context: BTreeMap::new(),
        }
    }

    pub fn at_snapshot(mut self, token: SnapshotToken) -> Self {
        self.metadata.snap_token = token;
        self
    }

    pub fn with_schema_version(mut self, version: &str) -> Self {
        self.metadata.schema_version = version.to_string();
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.metadata.depth = Some(depth);
        self
    }

    pub fn with_context(mut self, name: &str, value: AttributeValue) -> Self {
        self.context.insert(name.to_string(), value);
        self
    }
}

/// Metadata describing how a check was answered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResponseMetadata {
    /// Number of sub-checks evaluated (memoized ones excluded).
    pub check_count: u32,
    pub snap_token: SnapshotToken,
    pub schema_version: String,
}

/// Permission check response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub can: CheckResult,
    pub metadata: CheckResponseMetadata,
}

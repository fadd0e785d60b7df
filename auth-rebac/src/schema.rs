use crate::{
    error::{RebacError, Result},
    models::{Attribute, AttributeType, AttributeValue, Subject, Tuple},
    rules::RuleDefinition,
    tuple::validate_name,
};
use petgraph::{algo::toposort, graphmap::DiGraphMap};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Subject types a relation accepts
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectReference {
    /// Concrete subjects of a declared type, e.g. `@user`
    Type(String),
    /// Every subject of a type at once, e.g. `@user:*`
    Wildcard(String),
    /// Subject sets, e.g. `@team#member`
    SubjectSet { entity_type: String, relation: String },
    /// Built-in unconstrained subject type
    Any,
}

impl SubjectReference {
    pub fn entity(entity_type: &str) -> Self {
        Self::Type(entity_type.to_string())
    }

    pub fn wildcard(entity_type: &str) -> Self {
        Self::Wildcard(entity_type.to_string())
    }

    pub fn subject_set(entity_type: &str, relation: &str) -> Self {
        Self::SubjectSet {
            entity_type: entity_type.to_string(),
            relation: relation.to_string(),
        }
    }

    pub fn accepts(&self, subject: &Subject) -> bool {
        match self {
            Self::Type(t) => {
                subject.relation.is_none() && !subject.is_wildcard() && &subject.subject_type == t
            }
            Self::Wildcard(t) => {
                subject.relation.is_none() && subject.is_wildcard() && &subject.subject_type == t
            }
            Self::SubjectSet {
                entity_type,
                relation,
            } => &subject.subject_type == entity_type && subject.relation.as_ref() == Some(relation),
            Self::Any => !subject.is_wildcard(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDefinition {
    pub name: String,
    pub subjects: Vec<SubjectReference>,
}

impl RelationDefinition {
    pub fn allows_wildcard(&self, subject_type: &str) -> bool {
        self.subjects
            .iter()
            .any(|s| matches!(s, SubjectReference::Wildcard(t) if t == subject_type))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    Permission,
    Action,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionDefinition {
    pub name: String,
    pub kind: PermissionKind,
    pub expression: Expression,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDefinition {
    pub name: String,
    pub attribute_type: AttributeType,
}

/// Argument bound to a rule parameter at a rule leaf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Argument {
    /// Attribute of the entity being checked
    Attribute(String),
    /// Value supplied with the check request
    Context(String),
    Literal(AttributeValue),
}

/// Permission expression tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expression {
    /// Subjects holding a relation directly (or through subject sets)
    Relation(String),
    /// Another permission or action on the same entity
    Permission(String),
    Rule {
        name: String,
        arguments: Vec<Argument>,
    },
    /// Follow `tupleset` to related entities and evaluate `computed` there
    TupleToUserset { tupleset: String, computed: String },
    Union(Vec<Expression>),
    Intersection(Vec<Expression>),
    Exclusion {
        base: Box<Expression>,
        subtract: Box<Expression>,
    },
}

impl Expression {
    pub fn relation(name: &str) -> Self {
        Self::Relation(name.to_string())
    }

    pub fn permission(name: &str) -> Self {
        Self::Permission(name.to_string())
    }

    pub fn rule(name: &str, arguments: Vec<Argument>) -> Self {
        Self::Rule {
            name: name.to_string(),
            arguments,
        }
    }

    pub fn tuple_to_userset(tupleset: &str, computed: &str) -> Self {
        Self::TupleToUserset {
            tupleset: tupleset.to_string(),
            computed: computed.to_string(),
        }
    }

    pub fn exclusion(base: Expression, subtract: Expression) -> Self {
        Self::Exclusion {
            base: Box::new(base),
            subtract: Box::new(subtract),
        }
    }

    pub fn or(self, other: Expression) -> Self {
        match self {
            Self::Union(mut children) => {
                children.push(other);
                Self::Union(children)
            }
            expression => Self::Union(vec![expression, other]),
        }
    }

    pub fn and(self, other: Expression) -> Self {
        match self {
            Self::Intersection(mut children) => {
                children.push(other);
                Self::Intersection(children)
            }
            expression => Self::Intersection(vec![expression, other]),
        }
    }

    pub fn but_not(self, other: Expression) -> Self {
        Self::exclusion(self, other)
    }

    fn permission_references<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Permission(name) => out.push(name),
            Self::Union(children) | Self::Intersection(children) => {
                children.iter().for_each(|c| c.permission_references(out))
            }
            Self::Exclusion { base, subtract } => {
                base.permission_references(out);
                subtract.permission_references(out);
            }
            Self::Relation(_) | Self::Rule { .. } | Self::TupleToUserset { .. } => {}
        }
    }
}

/// Name resolved on an entity type
#[derive(Debug, Clone, Copy)]
pub enum Reference<'a> {
    Relation(&'a RelationDefinition),
    Permission(&'a PermissionDefinition),
}

/// Entity type definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub name: String,
    #[serde(default)]
    pub relations: Vec<RelationDefinition>,
    #[serde(default)]
    pub permissions: Vec<PermissionDefinition>,
    #[serde(default)]
    pub attributes: Vec<AttributeDefinition>,
}

impl EntityDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            relations: Vec::new(),
            permissions: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn relation(mut self, name: &str, subjects: impl IntoIterator<Item = SubjectReference>) -> Self {
        self.relations.push(RelationDefinition {
            name: name.to_string(),
            subjects: subjects.into_iter().collect(),
        });
        self
    }

    pub fn permission(mut self, name: &str, expression: Expression) -> Self {
        self.permissions.push(PermissionDefinition {
            name: name.to_string(),
            kind: PermissionKind::Permission,
            expression,
        });
        self
    }

    pub fn action(mut self, name: &str, expression: Expression) -> Self {
        self.permissions.push(PermissionDefinition {
            name: name.to_string(),
            kind: PermissionKind::Action,
            expression,
        });
        self
    }

    pub fn attribute(mut self, name: &str, attribute_type: AttributeType) -> Self {
        self.attributes.push(AttributeDefinition {
            name: name.to_string(),
            attribute_type,
        });
        self
    }

    pub fn get_relation(&self, name: &str) -> Option<&RelationDefinition> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn get_permission(&self, name: &str) -> Option<&PermissionDefinition> {
        self.permissions.iter().find(|p| p.name == name)
    }

    pub fn get_attribute(&self, name: &str) -> Option<&AttributeDefinition> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn reference(&self, name: &str) -> Option<Reference<'_>> {
        self.get_relation(name)
            .map(Reference::Relation)
            .or_else(|| self.get_permission(name).map(Reference::Permission))
    }
}

/// A serialized schema definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Definition {
    Entity(EntityDefinition),
    Rule(RuleDefinition),
}

impl Definition {
    pub fn name(&self) -> &str {
        match self {
            Self::Entity(entity) => &entity.name,
            Self::Rule(rule) => &rule.name,
        }
    }
}

/// Schema-write unit keyed by (tenant, version, definition name)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRecord {
    pub tenant_id: String,
    pub version: String,
    pub name: String,
    pub serialized_definition: Vec<u8>,
}

impl SchemaRecord {
    pub fn definition(&self) -> Result<Definition> {
        let definition: Definition = serde_json::from_slice(&self.serialized_definition)?;
        if definition.name() != self.name {
            return Err(RebacError::InvalidSchema(format!(
                "record '{}' holds definition '{}'",
                self.name,
                definition.name()
            )));
        }
        Ok(definition)
    }
}

/// Compiled schema: entity and rule definitions as produced by a schema compiler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub entities: Vec<EntityDefinition>,
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, entity: EntityDefinition) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn rule(mut self, rule: RuleDefinition) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn to_records(&self, tenant_id: &str, version: &str) -> Result<Vec<SchemaRecord>> {
        let definitions = self
            .entities
            .iter()
            .cloned()
            .map(Definition::Entity)
            .chain(self.rules.iter().cloned().map(Definition::Rule));

        definitions
            .map(|definition| {
                Ok(SchemaRecord {
                    tenant_id: tenant_id.to_string(),
                    version: version.to_string(),
                    name: definition.name().to_string(),
                    serialized_definition: serde_json::to_vec(&definition)?,
                })
            })
            .collect()
    }

    pub fn from_records(records: &[SchemaRecord]) -> Result<Self> {
        let mut schema = Self::new();
        for record in records {
            match record.definition()? {
                Definition::Entity(entity) => schema.entities.push(entity),
                Definition::Rule(rule) => schema.rules.push(rule),
            }
        }
        Ok(schema)
    }

    /// Validate the schema is well-formed: unique names, resolvable subject
    /// types and expression references, no permission reference cycles.
    pub fn validate(&self) -> Result<()> {
        let invalid = |e: RebacError| RebacError::InvalidSchema(e.to_string());

        let mut definitions = HashSet::new();
        for name in self
            .entities
            .iter()
            .map(|e| e.name.as_str())
            .chain(self.rules.iter().map(|r| r.name.as_str()))
        {
            validate_name("definition", name).map_err(invalid)?;
            if !definitions.insert(name) {
                return Err(RebacError::InvalidSchema(format!(
                    "definition '{}' declared twice",
                    name
                )));
            }
        }

        for rule in &self.rules {
            rule.validate()?;
        }

        let entities: HashMap<&str, &EntityDefinition> =
            self.entities.iter().map(|e| (e.name.as_str(), e)).collect();
        let rules: HashMap<&str, &RuleDefinition> =
            self.rules.iter().map(|r| (r.name.as_str(), r)).collect();

        for entity in &self.entities {
            let mut names = HashSet::new();
            for name in entity
                .relations
                .iter()
                .map(|r| r.name.as_str())
                .chain(entity.permissions.iter().map(|p| p.name.as_str()))
                .chain(entity.attributes.iter().map(|a| a.name.as_str()))
            {
                validate_name("member", name).map_err(invalid)?;
                if !names.insert(name) {
                    return Err(RebacError::InvalidSchema(format!(
                        "'{}' declared twice on entity '{}'",
                        name, entity.name
                    )));
                }
            }

            for relation in &entity.relations {
                validate_relation(entity, relation, &entities)?;
            }

            for permission in &entity.permissions {
                validate_expression(entity, &permission.expression, &entities, &rules).map_err(
                    |e| {
                        RebacError::InvalidSchema(format!(
                            "{}.{}: {}",
                            entity.name, permission.name, e
                        ))
                    },
                )?;
            }
        }

        self.check_permission_cycles()
    }

    /// Permission-to-permission references on one entity type must form a DAG.
    /// Tuple-to-userset hops cross to other entity instances and are bounded
    /// at evaluation time instead.
    fn check_permission_cycles(&self) -> Result<()> {
        let mut graph: DiGraphMap<(&str, &str), ()> = DiGraphMap::new();
        for entity in &self.entities {
            for permission in &entity.permissions {
                let from = (entity.name.as_str(), permission.name.as_str());
                graph.add_node(from);
                let mut references = Vec::new();
                permission.expression.permission_references(&mut references);
                for target in references {
                    graph.add_edge(from, (entity.name.as_str(), target), ());
                }
            }
        }

        toposort(&graph, None).map(|_| ()).map_err(|cycle| {
            let (entity, permission) = cycle.node_id();
            RebacError::InvalidSchema(format!(
                "permission '{}.{}' references itself",
                entity, permission
            ))
        })
    }
}

fn validate_relation(
    entity: &EntityDefinition,
    relation: &RelationDefinition,
    entities: &HashMap<&str, &EntityDefinition>,
) -> Result<()> {
    if relation.subjects.is_empty() {
        return Err(RebacError::InvalidSchema(format!(
            "relation '{}.{}' accepts no subjects",
            entity.name, relation.name
        )));
    }
    for subject in &relation.subjects {
        let resolved = match subject {
            SubjectReference::Any => true,
            SubjectReference::Type(t) | SubjectReference::Wildcard(t) => entities.contains_key(t.as_str()),
            SubjectReference::SubjectSet {
                entity_type,
                relation,
            } => entities
                .get(entity_type.as_str())
                .map_or(false, |target| target.reference(relation).is_some()),
        };
        if !resolved {
            return Err(RebacError::InvalidSchema(format!(
                "relation '{}.{}' references undeclared subject type {:?}",
                entity.name, relation.name, subject
            )));
        }
    }
    Ok(())
}

fn validate_expression(
    entity: &EntityDefinition,
    expression: &Expression,
    entities: &HashMap<&str, &EntityDefinition>,
    rules: &HashMap<&str, &RuleDefinition>,
) -> Result<()> {
    match expression {
        Expression::Relation(name) => entity
            .get_relation(name)
            .map(|_| ())
            .ok_or_else(|| RebacError::SchemaMismatch(format!("undeclared relation '{}'", name))),
        Expression::Permission(name) => entity
            .get_permission(name)
            .map(|_| ())
            .ok_or_else(|| RebacError::SchemaMismatch(format!("undeclared permission '{}'", name))),
        Expression::Rule { name, arguments } => {
            let rule = rules
                .get(name.as_str())
                .ok_or_else(|| RebacError::SchemaMismatch(format!("undeclared rule '{}'", name)))?;
            if rule.parameters.len() != arguments.len() {
                return Err(RebacError::SchemaMismatch(format!(
                    "rule '{}' takes {} arguments, {} given",
                    name,
                    rule.parameters.len(),
                    arguments.len()
                )));
            }
            for (parameter, argument) in rule.parameters.iter().zip(arguments) {
                let argument_type = match argument {
                    Argument::Attribute(attribute) => entity
                        .get_attribute(attribute)
                        .map(|a| a.attribute_type)
                        .ok_or_else(|| {
                            RebacError::SchemaMismatch(format!("undeclared attribute '{}'", attribute))
                        })?,
                    Argument::Literal(value) => value.attribute_type(),
                    Argument::Context(_) => continue,
                };
                if argument_type != parameter.attribute_type {
                    return Err(RebacError::SchemaMismatch(format!(
                        "rule '{}' expects {:?} for '{}'",
                        name, parameter.attribute_type, parameter.name
                    )));
                }
            }
            Ok(())
        }
        Expression::TupleToUserset { tupleset, computed } => {
            let relation = entity.get_relation(tupleset).ok_or_else(|| {
                RebacError::SchemaMismatch(format!("undeclared relation '{}'", tupleset))
            })?;
            let mut resolvable = false;
            for subject in &relation.subjects {
                match subject {
                    SubjectReference::Type(t) => {
                        resolvable |= entities
                            .get(t.as_str())
                            .map_or(false, |target| target.reference(computed).is_some());
                    }
                    SubjectReference::Any => resolvable = true,
                    other => {
                        return Err(RebacError::SchemaMismatch(format!(
                            "relation '{}' used for traversal must reference plain entity types, found {:?}",
                            tupleset, other
                        )));
                    }
                }
            }
            if resolvable {
                Ok(())
            } else {
                Err(RebacError::SchemaMismatch(format!(
                    "no entity type reachable through '{}' declares '{}'",
                    tupleset, computed
                )))
            }
        }
        Expression::Union(children) | Expression::Intersection(children) => {
            if children.is_empty() {
                return Err(RebacError::SchemaMismatch("empty set operation".to_string()));
            }
            children
                .iter()
                .try_for_each(|child| validate_expression(entity, child, entities, rules))
        }
        Expression::Exclusion { base, subtract } => {
            validate_expression(entity, base, entities, rules)?;
            validate_expression(entity, subtract, entities, rules)
        }
    }
}

/// Permissions whose expressions reference undeclared names. Stored schemas
/// are not required to pass [`Schema::validate`].
fn unresolved_references(
    entities: &HashMap<String, EntityDefinition>,
    rules: &HashMap<String, RuleDefinition>,
) -> HashMap<String, HashMap<String, String>> {
    let entity_refs: HashMap<&str, &EntityDefinition> =
        entities.iter().map(|(name, e)| (name.as_str(), e)).collect();
    let rule_refs: HashMap<&str, &RuleDefinition> =
        rules.iter().map(|(name, r)| (name.as_str(), r)).collect();

    let mut mismatches: HashMap<String, HashMap<String, String>> = HashMap::new();
    for entity in entities.values() {
        for permission in &entity.permissions {
            if let Err(error) =
                validate_expression(entity, &permission.expression, &entity_refs, &rule_refs)
            {
                let reason = match error {
                    RebacError::SchemaMismatch(reason) => reason,
                    other => other.to_string(),
                };
                mismatches
                    .entry(entity.name.clone())
                    .or_default()
                    .insert(permission.name.clone(), reason);
            }
        }
    }
    mismatches
}

/// Schema pinned to one (tenant, version), indexed for lookups
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    tenant_id: String,
    version: String,
    entities: HashMap<String, EntityDefinition>,
    rules: HashMap<String, RuleDefinition>,
    /// Entity type -> permission -> reason its expression cannot be evaluated
    mismatches: HashMap<String, HashMap<String, String>>,
}

impl CompiledSchema {
    pub fn new(tenant_id: &str, version: &str, schema: Schema) -> Result<Self> {
        let mut entities = HashMap::with_capacity(schema.entities.len());
        for entity in schema.entities {
            if let Some(previous) = entities.insert(entity.name.clone(), entity) {
                return Err(RebacError::InvalidSchema(format!(
                    "definition '{}' declared twice",
                    previous.name
                )));
            }
        }
        let mut rules = HashMap::with_capacity(schema.rules.len());
        for rule in schema.rules {
            if entities.contains_key(&rule.name) {
                return Err(RebacError::InvalidSchema(format!(
                    "definition '{}' declared twice",
                    rule.name
                )));
            }
            if let Some(previous) = rules.insert(rule.name.clone(), rule) {
                return Err(RebacError::InvalidSchema(format!(
                    "definition '{}' declared twice",
                    previous.name
                )));
            }
        }
        let mismatches = unresolved_references(&entities, &rules);
        Ok(Self {
            tenant_id: tenant_id.to_string(),
            version: version.to_string(),
            entities,
            rules,
            mismatches,
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Entity type by name.
    pub fn lookup(&self, entity_type: &str) -> Result<&EntityDefinition> {
        self.entities.get(entity_type).ok_or_else(|| {
            RebacError::NotFound(format!(
                "entity type '{}' in schema version '{}'",
                entity_type, self.version
            ))
        })
    }

    /// Expression behind a permission, action or relation name. A relation
    /// resolves to a direct relation leaf.
    pub fn resolve_expression(&self, entity_type: &str, name: &str) -> Result<Expression> {
        match self.lookup(entity_type)?.reference(name) {
            Some(Reference::Relation(relation)) => Ok(Expression::Relation(relation.name.clone())),
            Some(Reference::Permission(permission)) => Ok(permission.expression.clone()),
            None => Err(RebacError::NotFound(format!(
                "'{}' on entity type '{}'",
                name, entity_type
            ))),
        }
    }

    /// Fails with `SchemaMismatch` when the expression behind `name` references
    /// relations, permissions, attributes or rules the entity type does not
    /// declare.
    pub fn verify_references(&self, entity_type: &str, name: &str) -> Result<()> {
        match self
            .mismatches
            .get(entity_type)
            .and_then(|permissions| permissions.get(name))
        {
            Some(reason) => Err(RebacError::SchemaMismatch(format!(
                "{}.{}: {}",
                entity_type, name, reason
            ))),
            None => Ok(()),
        }
    }

    pub fn rule(&self, name: &str) -> Result<&RuleDefinition> {
        self.rules
            .get(name)
            .ok_or_else(|| RebacError::NotFound(format!("rule '{}'", name)))
    }

    pub fn entity_definitions(&self) -> Vec<&EntityDefinition> {
        let mut definitions: Vec<_> = self.entities.values().collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub fn rule_definitions(&self) -> Vec<&RuleDefinition> {
        let mut definitions: Vec<_> = self.rules.values().collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// A tuple may only be written if its relation exists and accepts the subject.
    pub fn validate_tuple(&self, tuple: &Tuple) -> Result<()> {
        let entity = self
            .lookup(&tuple.entity.entity_type)
            .map_err(|e| RebacError::InvalidArgument(e.to_string()))?;
        let relation = entity.get_relation(&tuple.relation).ok_or_else(|| {
            RebacError::InvalidArgument(format!(
                "unknown relation '{}' for entity type '{}'",
                tuple.relation, tuple.entity.entity_type
            ))
        })?;
        if relation.subjects.iter().any(|s| s.accepts(&tuple.subject)) {
            Ok(())
        } else {
            Err(RebacError::InvalidArgument(format!(
                "relation '{}.{}' does not accept subject '{}'",
                entity.name, relation.name, tuple.subject
            )))
        }
    }

    pub fn validate_attribute(&self, attribute: &Attribute) -> Result<()> {
        let entity = self
            .lookup(&attribute.entity.entity_type)
            .map_err(|e| RebacError::InvalidArgument(e.to_string()))?;
        let definition = entity.get_attribute(&attribute.name).ok_or_else(|| {
            RebacError::InvalidArgument(format!(
                "unknown attribute '{}' for entity type '{}'",
                attribute.name, entity.name
            ))
        })?;
        if definition.attribute_type == attribute.value.attribute_type() {
            Ok(())
        } else {
            Err(RebacError::InvalidArgument(format!(
                "attribute '{}.{}' expects {:?}",
                entity.name, attribute.name, definition.attribute_type
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Entity;
    use crate::rules::{Comparison, Operand, Predicate};

    fn document_schema() -> Schema {
        Schema::new()
            .entity(EntityDefinition::new("user"))
            .entity(
                EntityDefinition::new("team")
                    .relation("member", [SubjectReference::entity("user")]),
            )
            .entity(
                EntityDefinition::new("document")
                    .relation("owner", [SubjectReference::entity("user")])
                    .relation(
                        "viewer",
                        [
                            SubjectReference::entity("user"),
                            SubjectReference::wildcard("user"),
                            SubjectReference::subject_set("team", "member"),
                        ],
                    )
                    .relation("team", [SubjectReference::entity("team")])
                    .attribute("public", AttributeType::Boolean)
                    .permission(
                        "view",
                        Expression::relation("viewer")
                            .or(Expression::relation("owner"))
                            .or(Expression::tuple_to_userset("team", "member")),
                    )
                    .action("edit", Expression::permission("view").and(Expression::relation("owner")))
                    .action(
                        "read",
                        Expression::rule("is_true", vec![Argument::Attribute("public".to_string())]),
                    ),
            )
            .rule(
                RuleDefinition::new("is_true", Predicate::Is(Operand::param("flag")))
                    .parameter("flag", AttributeType::Boolean),
            )
    }

    #[test]
    fn test_valid_schema() {
        document_schema().validate().unwrap();
    }

    #[test]
    fn test_undeclared_relation_reference() {
        let schema = Schema::new().entity(
            EntityDefinition::new("document").permission("view", Expression::relation("viewer")),
        );
        assert!(matches!(schema.validate(), Err(RebacError::InvalidSchema(_))));
    }

    #[test]
    fn test_undeclared_subject_type() {
        let schema = Schema::new()
            .entity(EntityDefinition::new("document").relation("viewer", [SubjectReference::entity("user")]));
        assert!(matches!(schema.validate(), Err(RebacError::InvalidSchema(_))));
    }

    #[test]
    fn test_duplicate_member_names() {
        let schema = Schema::new().entity(EntityDefinition::new("user")).entity(
            EntityDefinition::new("document")
                .relation("viewer", [SubjectReference::entity("user")])
                .permission("viewer", Expression::relation("viewer")),
        );
        assert!(matches!(schema.validate(), Err(RebacError::InvalidSchema(_))));
    }

    #[test]
    fn test_permission_cycle_rejected() {
        let schema = Schema::new().entity(EntityDefinition::new("user")).entity(
            EntityDefinition::new("document")
                .relation("owner", [SubjectReference::entity("user")])
                .permission("a", Expression::permission("b").or(Expression::relation("owner")))
                .permission("b", Expression::permission("a")),
        );
        let err = schema.validate().unwrap_err();
        assert!(err.to_string().contains("references itself"), "{}", err);
    }

    #[test]
    fn test_recursive_hierarchy_is_not_a_cycle() {
        let schema = Schema::new().entity(EntityDefinition::new("user")).entity(
            EntityDefinition::new("folder")
                .relation("parent", [SubjectReference::entity("folder")])
                .relation("viewer", [SubjectReference::entity("user")])
                .permission(
                    "view",
                    Expression::relation("viewer").or(Expression::tuple_to_userset("parent", "view")),
                ),
        );
        schema.validate().unwrap();
    }

    #[test]
    fn test_rule_argument_types_checked() {
        let schema = Schema::new()
            .entity(
                EntityDefinition::new("account")
                    .attribute("balance", AttributeType::Double)
                    .action(
                        "withdraw",
                        Expression::rule("positive", vec![Argument::Attribute("balance".to_string())]),
                    ),
            )
            .rule(
                RuleDefinition::new(
                    "positive",
                    Predicate::compare(
                        Operand::param("amount"),
                        Comparison::Gt,
                        Operand::Literal(AttributeValue::Integer(0)),
                    ),
                )
                .parameter("amount", AttributeType::Integer),
            );
        assert!(matches!(schema.validate(), Err(RebacError::InvalidSchema(_))));
    }

    #[test]
    fn test_records_round_trip_through_bytes() {
        let schema = document_schema();
        let records = schema.to_records("t1", "v1").unwrap();
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.tenant_id == "t1" && r.version == "v1"));
        assert_eq!(Schema::from_records(&records).unwrap(), schema);
    }

    #[test]
    fn test_resolve_expression() {
        let compiled = CompiledSchema::new("t1", "v1", document_schema()).unwrap();
        assert_eq!(
            compiled.resolve_expression("document", "owner").unwrap(),
            Expression::relation("owner")
        );
        assert!(matches!(
            compiled.resolve_expression("document", "share"),
            Err(RebacError::NotFound(_))
        ));
        assert!(matches!(compiled.lookup("folder"), Err(RebacError::NotFound(_))));
    }

    #[test]
    fn test_unvalidated_references_are_recorded() {
        let compiled = CompiledSchema::new("t1", "v1", document_schema()).unwrap();
        assert!(compiled.verify_references("document", "view").is_ok());
        assert!(compiled.verify_references("document", "owner").is_ok());

        let broken = Schema::new().entity(EntityDefinition::new("user")).entity(
            EntityDefinition::new("document")
                .relation("viewer", [SubjectReference::entity("user")])
                .permission("view", Expression::relation("viewer").and(Expression::relation("approver")))
                .permission("browse", Expression::tuple_to_userset("parent", "view")),
        );
        let compiled = CompiledSchema::new("t1", "v1", broken).unwrap();
        assert!(matches!(
            compiled.verify_references("document", "view"),
            Err(RebacError::SchemaMismatch(_))
        ));
        assert!(matches!(
            compiled.verify_references("document", "browse"),
            Err(RebacError::SchemaMismatch(_))
        ));
        assert!(compiled.verify_references("document", "viewer").is_ok());
    }

    #[test]
    fn test_validate_tuple_against_relation() {
        let compiled = CompiledSchema::new("t1", "v1", document_schema()).unwrap();
        let doc = Entity::new("document", "1");

        assert!(compiled
            .validate_tuple(&Tuple::new(doc.clone(), "viewer", Subject::wildcard("user")))
            .is_ok());
        assert!(compiled
            .validate_tuple(&Tuple::new(doc.clone(), "viewer", Subject::subject_set("team", "a", "member")))
            .is_ok());
        // owner does not declare the wildcard
        assert!(compiled
            .validate_tuple(&Tuple::new(doc.clone(), "owner", Subject::wildcard("user")))
            .is_err());
        assert!(compiled
            .validate_tuple(&Tuple::new(doc.clone(), "owner", Subject::new("team", "a")))
            .is_err());
        assert!(compiled
            .validate_tuple(&Tuple::new(doc, "editor", Subject::user("bob")))
            .is_err());
    }

    #[test]
    fn test_validate_attribute_type() {
        let compiled = CompiledSchema::new("t1", "v1", document_schema()).unwrap();
        let doc = Entity::new("document", "1");
        assert!(compiled
            .validate_attribute(&Attribute::new(doc.clone(), "public", AttributeValue::Boolean(true)))
            .is_ok());
        assert!(compiled
            .validate_attribute(&Attribute::new(doc, "public", AttributeValue::Integer(1)))
            .is_err());
    }
}

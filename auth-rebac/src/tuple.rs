//! Textual relationship forms and identifier validation.
//!
//! - entity: `type:id`
//! - subject: `type:id` or `type:id#relation`
//! - tuple: `entityType:entityID#relation@subjectType:subjectID[#subjectRelation]`

use crate::{
    error::{RebacError, Result},
    models::{Entity, Subject, Tuple, WILDCARD},
};
use lazy_static::lazy_static;
use regex::Regex;
use std::str::FromStr;

lazy_static! {
    static ref NAME_REGEX: Regex = Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]{0,63}$").unwrap();
    static ref ID_REGEX: Regex = Regex::new(r"^([a-zA-Z0-9_\-\.+:|]{1,128}|\*)$").unwrap();
    static ref TENANT_REGEX: Regex = Regex::new(r"^[a-zA-Z0-9_\-]{1,64}$").unwrap();
    static ref VERSION_REGEX: Regex = Regex::new(r"^[a-zA-Z0-9_\-\.]{1,64}$").unwrap();
}

/// Type, relation, permission and attribute names.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if NAME_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(RebacError::InvalidArgument(format!("invalid {} name '{}'", kind, name)))
    }
}

pub fn validate_tenant_id(tenant_id: &str) -> Result<()> {
    if TENANT_REGEX.is_match(tenant_id) {
        Ok(())
    } else {
        Err(RebacError::InvalidArgument(format!("invalid tenant id '{}'", tenant_id)))
    }
}

/// An empty schema version means the latest one.
pub fn validate_schema_version(version: &str) -> Result<()> {
    if version.is_empty() || VERSION_REGEX.is_match(version) {
        Ok(())
    } else {
        Err(RebacError::InvalidArgument(format!("invalid schema version '{}'", version)))
    }
}

fn validate_id(id: &str) -> Result<()> {
    if ID_REGEX.is_match(id) {
        Ok(())
    } else {
        Err(RebacError::InvalidArgument(format!("invalid identifier '{}'", id)))
    }
}

/// Entities are always concrete; the wildcard id is reserved for subjects.
pub fn validate_entity(entity: &Entity) -> Result<()> {
    validate_name("entity type", &entity.entity_type)?;
    validate_id(&entity.id)?;
    if entity.id == WILDCARD {
        return Err(RebacError::InvalidArgument(format!(
            "entity '{}' cannot use the wildcard id",
            entity
        )));
    }
    Ok(())
}

pub fn validate_subject(subject: &Subject) -> Result<()> {
    validate_name("subject type", &subject.subject_type)?;
    validate_id(&subject.id)?;
    if let Some(ref relation) = subject.relation {
        validate_name("subject relation", relation)?;
        if subject.is_wildcard() {
            return Err(RebacError::InvalidArgument(format!(
                "wildcard subject '{}' cannot carry a relation",
                subject
            )));
        }
    }
    Ok(())
}

pub fn validate_tuple(tuple: &Tuple) -> Result<()> {
    validate_entity(&tuple.entity)?;
    validate_name("relation", &tuple.relation)?;
    validate_subject(&tuple.subject)
}

fn split_type_and_id(input: &str) -> Result<(&str, &str)> {
    match input.split_once(':') {
        Some((kind, id)) if !kind.is_empty() && !id.is_empty() => Ok((kind, id)),
        _ => Err(RebacError::InvalidTuple(format!("expected 'type:id', got '{}'", input))),
    }
}

/// Parses `type:id`.
pub fn parse_entity(input: &str) -> Result<Entity> {
    let (entity_type, id) = split_type_and_id(input.trim())?;
    let entity = Entity::new(entity_type, id);
    validate_entity(&entity).map_err(|e| RebacError::InvalidTuple(e.to_string()))?;
    Ok(entity)
}

/// Parses `type:id` or `type:id#relation`.
pub fn parse_subject(input: &str) -> Result<Subject> {
    let input = input.trim();
    let (reference, relation) = match input.split_once('#') {
        Some((reference, relation)) if !relation.is_empty() => (reference, Some(relation)),
        Some(_) => {
            return Err(RebacError::InvalidTuple(format!("empty relation in '{}'", input)));
        }
        None => (input, None),
    };
    let (subject_type, id) = split_type_and_id(reference)?;
    let subject = Subject {
        subject_type: subject_type.to_string(),
        id: id.to_string(),
        relation: relation.map(str::to_string),
    };
    validate_subject(&subject).map_err(|e| RebacError::InvalidTuple(e.to_string()))?;
    Ok(subject)
}

/// Parses the full textual tuple form.
pub fn parse_tuple(input: &str) -> Result<Tuple> {
    let input = input.trim();
    let (left, subject) = input
        .split_once('@')
        .ok_or_else(|| RebacError::InvalidTuple(format!("missing '@' in '{}'", input)))?;
    let (entity, relation) = left
        .split_once('#')
        .ok_or_else(|| RebacError::InvalidTuple(format!("missing relation in '{}'", input)))?;

    let tuple = Tuple {
        entity: parse_entity(entity)?,
        relation: relation.to_string(),
        subject: parse_subject(subject)?,
    };
    validate_name("relation", &tuple.relation)
        .map_err(|e| RebacError::InvalidTuple(format!("{} in '{}'", e, input)))?;
    Ok(tuple)
}

impl FromStr for Entity {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self> {
        parse_entity(s)
    }
}

impl FromStr for Subject {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self> {
        parse_subject(s)
    }
}

impl FromStr for Tuple {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self> {
        parse_tuple(s)
    }
}

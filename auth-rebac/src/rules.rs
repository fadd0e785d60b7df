//! Attribute-based rules referenced from permission expressions.
//!
//! A rule declares typed parameters and a predicate over them. Expressions
//! call a rule with arguments bound from entity attributes, request context,
//! or literals; see [`crate::schema::Argument`].

use crate::{
    error::{RebacError, Result},
    models::{AttributeType, AttributeValue},
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleParameter {
    pub name: String,
    pub attribute_type: AttributeType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub name: String,
    pub parameters: Vec<RuleParameter>,
    pub predicate: Predicate,
}

impl RuleDefinition {
    pub fn new(name: &str, predicate: Predicate) -> Self {
        Self {
            name: name.to_string(),
            parameters: Vec::new(),
            predicate,
        }
    }

    pub fn parameter(mut self, name: &str, attribute_type: AttributeType) -> Self {
        self.parameters.push(RuleParameter {
            name: name.to_string(),
            attribute_type,
        });
        self
    }

    pub fn parameter_type(&self, name: &str) -> Option<AttributeType> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.attribute_type)
    }

    /// Parameters must be unique and every operand must name one of them.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for parameter in &self.parameters {
            if !seen.insert(parameter.name.as_str()) {
                return Err(RebacError::InvalidSchema(format!(
                    "rule '{}' declares parameter '{}' twice",
                    self.name, parameter.name
                )));
            }
        }
        self.predicate.validate_operands(&|name| seen.contains(name)).map_err(|name| {
            RebacError::InvalidSchema(format!(
                "rule '{}' uses undeclared parameter '{}'",
                self.name, name
            ))
        })
    }

    /// Evaluates the predicate over bound arguments, checking their types first.
    pub fn evaluate(&self, bindings: &HashMap<String, AttributeValue>) -> Result<bool> {
        for parameter in &self.parameters {
            match bindings.get(&parameter.name) {
                Some(value) if value.attribute_type() == parameter.attribute_type => {}
                Some(value) => {
                    return Err(RebacError::SchemaMismatch(format!(
                        "rule '{}' expects {:?} for '{}', got {:?}",
                        self.name,
                        parameter.attribute_type,
                        parameter.name,
                        value.attribute_type()
                    )));
                }
                None => {
                    return Err(RebacError::SchemaMismatch(format!(
                        "rule '{}' is missing argument '{}'",
                        self.name, parameter.name
                    )));
                }
            }
        }
        self.predicate.evaluate(bindings)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    fn holds(self, ordering: Option<Ordering>) -> bool {
        match (self, ordering) {
            (Self::Ne, None) => true,
            (_, None) => false,
            (Self::Eq, Some(o)) => o == Ordering::Equal,
            (Self::Ne, Some(o)) => o != Ordering::Equal,
            (Self::Lt, Some(o)) => o == Ordering::Less,
            (Self::Le, Some(o)) => o != Ordering::Greater,
            (Self::Gt, Some(o)) => o == Ordering::Greater,
            (Self::Ge, Some(o)) => o != Ordering::Less,
        }
    }

    fn is_equality(self) -> bool {
        matches!(self, Self::Eq | Self::Ne)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Param(String),
    Literal(AttributeValue),
}

impl Operand {
    pub fn param(name: &str) -> Self {
        Self::Param(name.to_string())
    }

    fn resolve<'a>(&'a self, bindings: &'a HashMap<String, AttributeValue>) -> Result<&'a AttributeValue> {
        match self {
            Self::Literal(value) => Ok(value),
            Self::Param(name) => bindings.get(name).ok_or_else(|| {
                RebacError::SchemaMismatch(format!("unbound rule parameter '{}'", name))
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Compare {
        left: Operand,
        op: Comparison,
        right: Operand,
    },
    Contains {
        collection: Operand,
        element: Operand,
    },
    Is(Operand),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn compare(left: Operand, op: Comparison, right: Operand) -> Self {
        Self::Compare { left, op, right }
    }

    pub fn contains(collection: Operand, element: Operand) -> Self {
        Self::Contains {
            collection,
            element,
        }
    }

    fn validate_operands(&self, declared: &dyn Fn(&str) -> bool) -> std::result::Result<(), String> {
        let check = |operand: &Operand| match operand {
            Operand::Param(name) if !declared(name) => Err(name.clone()),
            _ => Ok(()),
        };
        match self {
            Self::Compare { left, right, .. } => {
                check(left)?;
                check(right)
            }
            Self::Contains {
                collection,
                element,
            } => {
                check(collection)?;
                check(element)
            }
            Self::Is(operand) => check(operand),
            Self::All(children) | Self::Any(children) => children
                .iter()
                .try_for_each(|child| child.validate_operands(declared)),
            Self::Not(child) => child.validate_operands(declared),
        }
    }

    pub fn evaluate(&self, bindings: &HashMap<String, AttributeValue>) -> Result<bool> {
        match self {
            Self::Compare { left, op, right } => {
                compare(left.resolve(bindings)?, *op, right.resolve(bindings)?)
            }
            Self::Contains {
                collection,
                element,
            } => contains(collection.resolve(bindings)?, element.resolve(bindings)?),
            Self::Is(operand) => match operand.resolve(bindings)? {
                AttributeValue::Boolean(value) => Ok(*value),
                other => Err(RebacError::SchemaMismatch(format!(
                    "expected a boolean, got {:?}",
                    other.attribute_type()
                ))),
            },
            Self::All(children) => {
                for child in children {
                    if !child.evaluate(bindings)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Any(children) => {
                for child in children {
                    if child.evaluate(bindings)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Not(child) => Ok(!child.evaluate(bindings)?),
        }
    }
}

fn compare(left: &AttributeValue, op: Comparison, right: &AttributeValue) -> Result<bool> {
    use AttributeValue::*;

    let ordering = match (left, right) {
        (Integer(l), Integer(r)) => Some(l.cmp(r)),
        (Integer(l), Double(r)) => (*l as f64).partial_cmp(r),
        (Double(l), Integer(r)) => l.partial_cmp(&(*r as f64)),
        (Double(l), Double(r)) => l.partial_cmp(r),
        (String(l), String(r)) => Some(l.cmp(r)),
        (Boolean(l), Boolean(r)) if op.is_equality() => Some(l.cmp(r)),
        (l, r) if op.is_equality() && l.attribute_type() == r.attribute_type() => {
            Some(if l == r { Ordering::Equal } else { Ordering::Less })
        }
        (l, r) => {
            return Err(RebacError::SchemaMismatch(format!(
                "cannot apply {:?} to {:?} and {:?}",
                op,
                l.attribute_type(),
                r.attribute_type()
            )));
        }
    };
    Ok(op.holds(ordering))
}

fn contains(collection: &AttributeValue, element: &AttributeValue) -> Result<bool> {
    use AttributeValue::*;

    match (collection, element) {
        (BooleanArray(values), Boolean(e)) => Ok(values.contains(e)),
        (IntegerArray(values), Integer(e)) => Ok(values.contains(e)),
        (DoubleArray(values), Double(e)) => Ok(values.contains(e)),
        (DoubleArray(values), Integer(e)) => Ok(values.contains(&(*e as f64))),
        (StringArray(values), String(e)) => Ok(values.contains(e)),
        (c, e) => Err(RebacError::SchemaMismatch(format!(
            "cannot look for {:?} in {:?}",
            e.attribute_type(),
            c.attribute_type()
        ))),
    }
}

//! Query predicates over record fields.
//!
//! [`Criteria`] is serializable so builders can carry it in TOML config and
//! chunk plans can ship it to remote workers. Stores may push parts of it
//! down to their backend; [`Criteria::matches`] is the reference semantics.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Record, compare_values, values_equal};

/// A predicate over record fields. Field names may be dotted paths.
///
/// Array-valued fields match `eq`/`in` when any element matches, the way a
/// document store treats multikey fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criteria {
    /// Matches every record.
    #[default]
    All,
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    Nin { field: String, values: Vec<Value> },
    Gt { field: String, value: Value },
    Gte { field: String, value: Value },
    Lt { field: String, value: Value },
    Lte { field: String, value: Value },
    Exists { field: String, exists: bool },
    Regex { field: String, pattern: String },
    And(Vec<Criteria>),
    Or(Vec<Criteria>),
    Not(Box<Criteria>),
}

impl Criteria {
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::In {
            field: field.into(),
            values,
        }
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self::Exists {
            field: field.into(),
            exists: true,
        }
    }

    /// Conjunction that folds away `All` operands.
    pub fn and(self, other: Criteria) -> Criteria {
        match (self, other) {
            (Criteria::All, c) | (c, Criteria::All) => c,
            (Criteria::And(mut left), Criteria::And(right)) => {
                left.extend(right);
                Criteria::And(left)
            }
            (Criteria::And(mut left), c) => {
                left.push(c);
                Criteria::And(left)
            }
            (a, b) => Criteria::And(vec![a, b]),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Criteria::All)
    }

    /// Evaluate against a record. Invalid regex patterns never match.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Criteria::All => true,
            Criteria::Eq { field, value } => field_any(record, field, |v| values_equal(v, value)),
            Criteria::Ne { field, value } => !field_any(record, field, |v| values_equal(v, value)),
            Criteria::In { field, values } => {
                field_any(record, field, |v| values.iter().any(|c| values_equal(v, c)))
            }
            Criteria::Nin { field, values } => {
                !field_any(record, field, |v| values.iter().any(|c| values_equal(v, c)))
            }
            Criteria::Gt { field, value } => compare_field(record, field, value, |o| o == Ordering::Greater),
            Criteria::Gte { field, value } => compare_field(record, field, value, |o| o != Ordering::Less),
            Criteria::Lt { field, value } => compare_field(record, field, value, |o| o == Ordering::Less),
            Criteria::Lte { field, value } => compare_field(record, field, value, |o| o != Ordering::Greater),
            Criteria::Exists { field, exists } => record.contains(field) == *exists,
            Criteria::Regex { field, pattern } => match compiled(pattern) {
                Some(re) => field_any(record, field, |v| v.as_str().is_some_and(|s| re.is_match(s))),
                None => false,
            },
            Criteria::And(parts) => parts.iter().all(|c| c.matches(record)),
            Criteria::Or(parts) => parts.iter().any(|c| c.matches(record)),
            Criteria::Not(inner) => !inner.matches(record),
        }
    }

    /// Check regex patterns up front so config errors surface at load time.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Criteria::Regex { pattern, .. } => Regex::new(pattern)
                .map(|_| ())
                .map_err(|e| format!("invalid regex '{pattern}': {e}")),
            Criteria::And(parts) | Criteria::Or(parts) => {
                parts.iter().try_for_each(Criteria::validate)
            }
            Criteria::Not(inner) => inner.validate(),
            _ => Ok(()),
        }
    }
}

/// Compiled `regex` patterns by source text; `None` marks an invalid one.
static PATTERNS: LazyLock<RwLock<HashMap<String, Option<Regex>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Compile `pattern` once per process and reuse it for every record.
fn compiled(pattern: &str) -> Option<Regex> {
    if let Ok(cache) = PATTERNS.read() {
        if let Some(hit) = cache.get(pattern) {
            return hit.clone();
        }
    }
    let re = Regex::new(pattern).ok();
    if let Ok(mut cache) = PATTERNS.write() {
        cache.insert(pattern.to_string(), re.clone());
    }
    re
}

/// True when the field's value (or any element of an array value) satisfies `pred`.
fn field_any(record: &Record, field: &str, pred: impl Fn(&Value) -> bool) -> bool {
    match record.get(field) {
        None => false,
        Some(Value::Array(items)) => pred(&Value::Array(items.clone())) || items.iter().any(&pred),
        Some(v) => pred(v),
    }
}

fn compare_field(record: &Record, field: &str, bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    record
        .get(field)
        .and_then(|v| compare_values(v, bound))
        .is_some_and(accept)
}

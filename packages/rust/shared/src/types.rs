//! Core data model: keys, records, and timestamp handling.

use std::cmp::Ordering;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{MatbuildError, Result};

/// Build-timestamp field stamped on every record written by the Load phase.
pub const BUILD_TIME_FIELD: &str = "_bt";

// ---------------------------------------------------------------------------
// Key
// ---------------------------------------------------------------------------

/// Identity of a record within a Store.
///
/// Unique within one Store, not globally. Composite keys are ordered lists of
/// component keys (one per key field).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Str(String),
    Composite(Vec<Key>),
}

impl Key {
    /// Convert a JSON value into a key. Floats, booleans, objects and null
    /// are rejected.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(Self::Str(s.clone())),
            Value::Number(n) => n.as_i64().map(Self::Int).ok_or_else(|| {
                MatbuildError::validation(format!("non-integer numeric key: {n}"))
            }),
            Value::Array(items) => items
                .iter()
                .map(Self::from_value)
                .collect::<Result<Vec<_>>>()
                .map(Self::Composite),
            other => Err(MatbuildError::validation(format!(
                "unsupported key value: {other}"
            ))),
        }
    }

    /// The JSON representation stored in key fields.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(i) => Value::from(*i),
            Self::Str(s) => Value::String(s.clone()),
            Self::Composite(parts) => Value::Array(parts.iter().map(Key::to_value).collect()),
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::Composite(parts) => {
                write!(f, "(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{part}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A document: mapping from field name to JSON value.
///
/// Field accessors take dotted paths (`output.energy`) and walk nested objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(pub Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wrap a JSON object. Anything else is a validation error.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(MatbuildError::validation(format!(
                "record must be a JSON object, got: {other}"
            ))),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Look up a (possibly dotted) field path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.0.get(first)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Set a (possibly dotted) field path, creating intermediate objects.
    /// A non-object value sitting on the path is replaced.
    pub fn set(&mut self, path: &str, value: Value) {
        let segments: Vec<&str> = path.split('.').collect();
        let (last, parents) = match segments.split_last() {
            Some(split) => split,
            None => return,
        };
        let mut current = &mut self.0;
        for segment in parents {
            let slot = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            current = match slot {
                Value::Object(map) => map,
                _ => return,
            };
        }
        current.insert(last.to_string(), value);
    }

    /// Remove a top-level or dotted field, returning its value.
    pub fn remove(&mut self, path: &str) -> Option<Value> {
        match path.rsplit_once('.') {
            None => self.0.remove(path),
            Some((parent, last)) => {
                let mut current = &mut self.0;
                for segment in parent.split('.') {
                    current = current.get_mut(segment)?.as_object_mut()?;
                }
                current.remove(last)
            }
        }
    }

    /// Extract the record's key from one or more key fields.
    ///
    /// A single field yields that field's key; several fields yield a
    /// [`Key::Composite`] in field order.
    pub fn key(&self, fields: &[String]) -> Result<Key> {
        let lookup = |field: &String| {
            self.get(field)
                .ok_or_else(|| MatbuildError::validation(format!("record is missing key field '{field}'")))
                .and_then(Key::from_value)
        };
        match fields {
            [] => Err(MatbuildError::validation("no key fields given")),
            [single] => lookup(single),
            many => many.iter().map(lookup).collect::<Result<Vec<_>>>().map(Key::Composite),
        }
    }

    /// Parse the LastUpdated timestamp stored under `field`.
    pub fn last_updated(&self, field: &str) -> Option<DateTime<Utc>> {
        self.get(field).and_then(parse_timestamp)
    }

    pub fn set_last_updated(&mut self, field: &str, at: DateTime<Utc>) {
        self.set(field, timestamp_value(at));
    }

    /// Copy only the listed field paths into a new record. An empty list
    /// returns the whole record.
    pub fn project(&self, properties: &[String]) -> Record {
        if properties.is_empty() {
            return self.clone();
        }
        let mut out = Record::new();
        for path in properties {
            if let Some(value) = self.get(path) {
                out.set(path, value.clone());
            }
        }
        out
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Parse a LastUpdated value: an RFC 3339 string or integer epoch millis.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Encode a timestamp as stored in records. Full sub-second precision is kept
/// so a value copied from source to target compares equal after a round trip.
pub fn timestamp_value(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

// ---------------------------------------------------------------------------
// Value comparison
// ---------------------------------------------------------------------------

/// Equality used by criteria and key matching: numbers compare by value
/// (`1 == 1.0`), everything else structurally.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i == j,
            _ => x.as_f64() == y.as_f64(),
        },
        _ => a == b,
    }
}

/// Ordering used by range criteria. Strings that both parse as RFC 3339
/// timestamps compare chronologically. Mismatched types are unordered.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => Some(i.cmp(&j)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => {
            match (parse_timestamp(a), parse_timestamp(b)) {
                (Some(s), Some(t)) => Some(s.cmp(&t)),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_from_json_values() {
        assert_eq!(Key::from_value(&json!("mp-1")).unwrap(), Key::from("mp-1"));
        assert_eq!(Key::from_value(&json!(42)).unwrap(), Key::Int(42));
        assert_eq!(
            Key::from_value(&json!(["mp-1", 3])).unwrap(),
            Key::Composite(vec![Key::from("mp-1"), Key::Int(3)])
        );
        assert!(Key::from_value(&json!(1.5)).is_err());
        assert!(Key::from_value(&json!(null)).is_err());
    }

    #[test]
    fn key_display() {
        let key = Key::Composite(vec![Key::from("Fe-O"), Key::Int(2)]);
        assert_eq!(key.to_string(), "(Fe-O, 2)");
    }

    #[test]
    fn record_nested_access() {
        let mut rec = Record::from_value(json!({"output": {"energy": -3.2}})).unwrap();
        assert_eq!(rec.get("output.energy"), Some(&json!(-3.2)));
        assert!(rec.get("output.missing").is_none());

        rec.set("input.incar.ENCUT", json!(520));
        assert_eq!(rec.get("input.incar.ENCUT"), Some(&json!(520)));

        assert_eq!(rec.remove("output.energy"), Some(json!(-3.2)));
        assert!(!rec.contains("output.energy"));
    }

    #[test]
    fn record_composite_key() {
        let rec = Record::from_value(json!({"chemsys": "Fe-O", "class": 1})).unwrap();
        let key = rec.key(&["chemsys".into(), "class".into()]).unwrap();
        assert_eq!(key, Key::Composite(vec![Key::from("Fe-O"), Key::Int(1)]));
        assert!(rec.key(&["task_id".into()]).is_err());
    }

    #[test]
    fn projection_keeps_listed_paths() {
        let rec = Record::from_value(json!({
            "task_id": "t1",
            "output": {"energy": 1.0, "forces": [0, 0]},
            "junk": true
        }))
        .unwrap();
        let projected = rec.project(&["task_id".into(), "output.energy".into()]);
        assert_eq!(
            projected.into_value(),
            json!({"task_id": "t1", "output": {"energy": 1.0}})
        );
    }

    #[test]
    fn timestamps_roundtrip_with_full_precision() {
        let now = Utc::now();
        let parsed = parse_timestamp(&timestamp_value(now)).unwrap();
        assert_eq!(parsed, now);

        let millis = parse_timestamp(&json!(1_700_000_000_000_i64)).unwrap();
        assert_eq!(millis.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn value_comparison() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert_eq!(compare_values(&json!(2), &json!(10)), Some(Ordering::Less));
        assert_eq!(
            compare_values(&json!("2024-01-02T00:00:00Z"), &json!("2024-01-01T23:00:00+00:00")),
            Some(Ordering::Greater)
        );
        assert_eq!(compare_values(&json!("a"), &json!(1)), None);
    }
}

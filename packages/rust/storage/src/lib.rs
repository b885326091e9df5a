//! Document-collection storage layer.
//!
//! The [`Store`] trait is the capability surface the build pipeline consumes:
//! criteria queries, keyed upserts, deletes, indexes and the `newer_in`
//! staleness primitive. Two backends ship with it:
//!
//! - [`MemoryStore`]: process-local, used by tests and ad-hoc runs
//! - [`SqliteStore`]: embedded libSQL database holding JSON documents
//!
//! Stores are shared as `Arc<dyn Store>` between builders and chunk workers.

mod memory;
mod migrations;
mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use matbuild_shared::{Criteria, Key, Record, Result};

pub use memory::MemoryStore;
pub use sqlite::{RunLogEntry, SqliteStore};

/// A keyed collection of JSON records.
#[async_trait]
pub trait Store: Send + Sync {
    /// Human-readable store name used in logs and errors.
    fn name(&self) -> &str;

    /// Identity field.
    fn key(&self) -> &str;

    /// Staleness timestamp field.
    fn last_updated_field(&self) -> &str;

    /// Records matching `criteria` in natural order, projected onto
    /// `properties` (all fields when empty).
    async fn query(&self, criteria: &Criteria, properties: &[String]) -> Result<Vec<Record>>;

    async fn query_one(&self, criteria: &Criteria, properties: &[String]) -> Result<Option<Record>> {
        Ok(self.query(criteria, properties).await?.into_iter().next())
    }

    async fn count(&self, criteria: &Criteria) -> Result<usize> {
        Ok(self.query(criteria, &[self.key().to_string()]).await?.len())
    }

    /// Distinct values of `field` among matching records, in first-seen
    /// order. Array values contribute their elements.
    async fn distinct(&self, field: &str, criteria: &Criteria) -> Result<Vec<Value>> {
        let docs = self.query(criteria, &[field.to_string()]).await?;
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for doc in &docs {
            let values: Vec<&Value> = match doc.get(field) {
                Some(Value::Array(items)) => items.iter().collect(),
                Some(v) => vec![v],
                None => continue,
            };
            for v in values {
                if seen.insert(v.to_string()) {
                    out.push(v.clone());
                }
            }
        }
        Ok(out)
    }

    /// Upsert `docs`, matching existing records on `key_fields` (the store
    /// key when empty). A batch is applied atomically: on error nothing from
    /// it is visible. Returns the number of records written.
    async fn update(&self, docs: Vec<Record>, key_fields: &[String]) -> Result<usize>;

    /// Delete the records matching `criteria`, then upsert `docs`, as one
    /// atomic step: on error the store is left exactly as it was. Returns
    /// the number of records written.
    async fn replace(
        &self,
        criteria: &Criteria,
        docs: Vec<Record>,
        key_fields: &[String],
    ) -> Result<usize>;

    /// Delete matching records, returning how many were removed.
    async fn remove_docs(&self, criteria: &Criteria) -> Result<usize>;

    /// Create an index on `field`. Idempotent; returns `true` when the index
    /// was newly created.
    async fn ensure_index(&self, field: &str, unique: bool) -> Result<bool>;

    /// Most recent LastUpdated in the store.
    async fn last_updated(&self) -> Result<Option<DateTime<Utc>>> {
        let lu = self.last_updated_field().to_string();
        let docs = self.query(&Criteria::All, &[lu.clone()]).await?;
        Ok(docs.iter().filter_map(|d| d.last_updated(&lu)).max())
    }

    /// Keys of `self` whose record in `other` is older, or (when
    /// `exhaustive`) missing. Compared key by key, never against a global
    /// maximum.
    async fn newer_in(
        &self,
        other: &dyn Store,
        criteria: &Criteria,
        exhaustive: bool,
    ) -> Result<Vec<Key>> {
        let source = key_timestamps(self.as_dyn(), criteria, self.key(), false).await?;
        if source.is_empty() {
            return Ok(Vec::new());
        }
        let target = latest_by_key(key_timestamps(other, &Criteria::All, other.key(), true).await?, false);
        let (order, source) = ordered_latest(source);

        Ok(order
            .into_iter()
            .filter(|key| match target.get(key) {
                None => exhaustive,
                Some(built) => source[key] > *built,
            })
            .collect())
    }

    /// Upcast helper so default methods can hand `self` to free functions.
    fn as_dyn(&self) -> &dyn Store;
}

/// `(key, LastUpdated)` pairs for every matching record.
///
/// Records without a usable key are skipped; records without a timestamp get
/// the minimum timestamp so they always look out of date. With `flatten`,
/// array-valued fields yield one pair per element (a target record listing
/// the source keys it was built from).
pub async fn key_timestamps(
    store: &dyn Store,
    criteria: &Criteria,
    field: &str,
    flatten: bool,
) -> Result<Vec<(Key, DateTime<Utc>)>> {
    let lu_field = store.last_updated_field();
    let docs = store
        .query(criteria, &[field.to_string(), lu_field.to_string()])
        .await?;

    let mut out = Vec::with_capacity(docs.len());
    for doc in &docs {
        let at = doc.last_updated(lu_field).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let values: Vec<&Value> = match doc.get(field) {
            Some(Value::Array(items)) if flatten => items.iter().collect(),
            Some(v) => vec![v],
            None => {
                tracing::debug!(store = store.name(), field, "record without key field skipped");
                continue;
            }
        };
        for v in values {
            match Key::from_value(v) {
                Ok(key) => out.push((key, at)),
                Err(e) => tracing::debug!(store = store.name(), error = %e, "unusable key skipped"),
            }
        }
    }
    Ok(out)
}

/// Collapse pairs to one timestamp per key: the latest when `newest`, else
/// the earliest.
pub fn latest_by_key(
    pairs: Vec<(Key, DateTime<Utc>)>,
    newest: bool,
) -> HashMap<Key, DateTime<Utc>> {
    let mut map: HashMap<Key, DateTime<Utc>> = HashMap::with_capacity(pairs.len());
    for (key, at) in pairs {
        map.entry(key)
            .and_modify(|cur| {
                if (newest && at > *cur) || (!newest && at < *cur) {
                    *cur = at;
                }
            })
            .or_insert(at);
    }
    map
}

/// First-seen key order plus the newest timestamp per key.
pub fn ordered_latest(
    pairs: Vec<(Key, DateTime<Utc>)>,
) -> (Vec<Key>, HashMap<Key, DateTime<Utc>>) {
    let mut order = Vec::new();
    let mut map: HashMap<Key, DateTime<Utc>> = HashMap::with_capacity(pairs.len());
    for (key, at) in pairs {
        match map.get_mut(&key) {
            Some(cur) => {
                if at > *cur {
                    *cur = at;
                }
            }
            None => {
                order.push(key.clone());
                map.insert(key, at);
            }
        }
    }
    (order, map)
}

/// Resolve the fields an upsert matches on.
pub(crate) fn effective_key_fields(store: &dyn Store, key_fields: &[String]) -> Vec<String> {
    if key_fields.is_empty() {
        vec![store.key().to_string()]
    } else {
        key_fields.to_vec()
    }
}

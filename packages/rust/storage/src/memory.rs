//! Process-local [`Store`] backed by a vector of records.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use matbuild_shared::{Criteria, MatbuildError, Record, Result, values_equal};

use crate::{Store, effective_key_fields};

/// In-memory store. Insertion order is the natural iteration order.
///
/// Unique indexes are enforced on write. [`MemoryStore::set_offline`] makes
/// every call fail with `StoreUnavailable`, which lets callers exercise
/// connection-loss paths without a real database.
pub struct MemoryStore {
    name: String,
    key: String,
    last_updated_field: String,
    docs: RwLock<Vec<Record>>,
    /// field -> unique
    indexes: RwLock<BTreeMap<String, bool>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            last_updated_field: "last_updated".into(),
            docs: RwLock::new(Vec::new()),
            indexes: RwLock::new(BTreeMap::new()),
            offline: AtomicBool::new(false),
        }
    }

    pub fn with_last_updated_field(mut self, field: impl Into<String>) -> Self {
        self.last_updated_field = field.into();
        self
    }

    /// Simulate losing (or regaining) the connection.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(MatbuildError::unavailable(&self.name, "store is offline"));
        }
        Ok(())
    }

    /// Fail if two records in `docs` share a value of a unique field.
    fn check_unique(&self, docs: &[Record], unique_fields: &[String]) -> Result<()> {
        for field in unique_fields {
            let mut seen: Vec<&serde_json::Value> = Vec::new();
            for doc in docs {
                if let Some(v) = doc.get(field) {
                    if seen.iter().any(|s| values_equal(s, v)) {
                        return Err(MatbuildError::conflict(
                            &self.name,
                            format!("duplicate value {v} for unique field '{field}'"),
                        ));
                    }
                    seen.push(v);
                }
            }
        }
        Ok(())
    }

    /// Apply an optional delete plus an upsert to a copy of the records and
    /// publish it only when every unique index still holds.
    async fn write(
        &self,
        remove: Option<&Criteria>,
        docs: Vec<Record>,
        key_fields: &[String],
    ) -> Result<usize> {
        self.check_online()?;
        let fields = effective_key_fields(self, key_fields);
        for doc in &docs {
            doc.key(&fields)?;
        }

        let unique_fields: Vec<String> = self
            .indexes
            .read()
            .await
            .iter()
            .filter(|(_, unique)| **unique)
            .map(|(field, _)| field.clone())
            .collect();

        let mut guard = self.docs.write().await;
        let mut next = guard.clone();
        if let Some(criteria) = remove {
            next.retain(|d| !criteria.matches(d));
        }
        let written = docs.len();
        for doc in docs {
            match next.iter_mut().find(|existing| same_key(existing, &doc, &fields)) {
                Some(existing) => *existing = doc,
                None => next.push(doc),
            }
        }
        self.check_unique(&next, &unique_fields)?;
        *guard = next;
        Ok(written)
    }
}

fn same_key(a: &Record, b: &Record, fields: &[String]) -> bool {
    fields.iter().all(|f| match (a.get(f), b.get(f)) {
        (Some(x), Some(y)) => values_equal(x, y),
        _ => false,
    })
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn last_updated_field(&self) -> &str {
        &self.last_updated_field
    }

    async fn query(&self, criteria: &Criteria, properties: &[String]) -> Result<Vec<Record>> {
        self.check_online()?;
        let docs = self.docs.read().await;
        Ok(docs
            .iter()
            .filter(|d| criteria.matches(d))
            .map(|d| d.project(properties))
            .collect())
    }

    async fn update(&self, docs: Vec<Record>, key_fields: &[String]) -> Result<usize> {
        self.write(None, docs, key_fields).await
    }

    async fn replace(
        &self,
        criteria: &Criteria,
        docs: Vec<Record>,
        key_fields: &[String],
    ) -> Result<usize> {
        self.write(Some(criteria), docs, key_fields).await
    }

    async fn remove_docs(&self, criteria: &Criteria) -> Result<usize> {
        self.check_online()?;
        let mut docs = self.docs.write().await;
        let before = docs.len();
        docs.retain(|d| !criteria.matches(d));
        Ok(before - docs.len())
    }

    async fn ensure_index(&self, field: &str, unique: bool) -> Result<bool> {
        self.check_online()?;
        let mut indexes = self.indexes.write().await;
        if indexes.get(field) == Some(&unique) {
            return Ok(false);
        }
        if unique {
            let docs = self.docs.read().await;
            self.check_unique(&docs, &[field.to_string()])?;
        }
        indexes.insert(field.to_string(), unique);
        Ok(true)
    }

    fn as_dyn(&self) -> &dyn Store {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: serde_json::Value) -> Record {
        Record::from_value(v).unwrap()
    }

    #[tokio::test]
    async fn upsert_replaces_by_key_and_keeps_order() {
        let store = MemoryStore::new("materials", "material_id");
        store
            .update(
                vec![
                    rec(json!({"material_id": "mp-2", "v": 1})),
                    rec(json!({"material_id": "mp-1", "v": 1})),
                ],
                &[],
            )
            .await
            .unwrap();
        store
            .update(vec![rec(json!({"material_id": "mp-2", "v": 2}))], &[])
            .await
            .unwrap();

        let docs = store.query(&Criteria::All, &[]).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].get("v"), Some(&json!(2)));
        assert_eq!(docs[1].get("material_id"), Some(&json!("mp-1")));
    }

    #[tokio::test]
    async fn composite_key_upsert() {
        let store = MemoryStore::new("classes", "class_id");
        let key = vec!["formula".to_string(), "class".to_string()];
        store
            .update(
                vec![
                    rec(json!({"formula": "Fe2O3", "class": 0, "n": 1})),
                    rec(json!({"formula": "Fe2O3", "class": 1, "n": 1})),
                ],
                &key,
            )
            .await
            .unwrap();
        store
            .update(vec![rec(json!({"formula": "Fe2O3", "class": 1, "n": 7}))], &key)
            .await
            .unwrap();

        assert_eq!(store.count(&Criteria::All).await.unwrap(), 2);
        let docs = store.query(&Criteria::All, &[]).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].get("n"), Some(&json!(7)));
    }

    #[tokio::test]
    async fn missing_key_field_is_rejected() {
        let store = MemoryStore::new("materials", "material_id");
        let err = store
            .update(vec![rec(json!({"formula": "NaCl"}))], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, MatbuildError::Validation { .. }));
    }

    #[tokio::test]
    async fn unique_index_rejects_whole_batch() {
        let store = MemoryStore::new("materials", "material_id");
        assert!(store.ensure_index("formula", true).await.unwrap());
        assert!(!store.ensure_index("formula", true).await.unwrap());

        store
            .update(vec![rec(json!({"material_id": "mp-1", "formula": "NaCl"}))], &[])
            .await
            .unwrap();
        let err = store
            .update(
                vec![
                    rec(json!({"material_id": "mp-3", "formula": "KCl"})),
                    rec(json!({"material_id": "mp-2", "formula": "NaCl"})),
                ],
                &[],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MatbuildError::LoadConflict { .. }));
        assert_eq!(store.query(&Criteria::All, &[]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejected_replace_keeps_old_records() {
        let store = MemoryStore::new("classes", "class_id");
        store
            .update(
                vec![
                    rec(json!({"class_id": "a", "formula": "Fe2O3", "vol": 1})),
                    rec(json!({"class_id": "b", "formula": "Fe2O3", "vol": 2})),
                    rec(json!({"class_id": "c", "formula": "NaCl", "vol": 3})),
                ],
                &[],
            )
            .await
            .unwrap();
        store.ensure_index("vol", true).await.unwrap();

        let fe = Criteria::equals("formula", "Fe2O3");
        let err = store
            .replace(
                &fe,
                vec![
                    rec(json!({"class_id": "x", "formula": "Fe2O3", "vol": 5})),
                    rec(json!({"class_id": "y", "formula": "Fe2O3", "vol": 5})),
                ],
                &[],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MatbuildError::LoadConflict { .. }));
        assert_eq!(store.count(&fe).await.unwrap(), 2);

        let written = store
            .replace(&fe, vec![rec(json!({"class_id": "x", "formula": "Fe2O3", "vol": 5}))], &[])
            .await
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(store.distinct("class_id", &Criteria::All).await.unwrap(), vec![json!("c"), json!("x")]);
    }

    #[tokio::test]
    async fn offline_store_is_unavailable() {
        let store = MemoryStore::new("tasks", "task_id");
        store.set_offline(true);
        let err = store.query(&Criteria::All, &[]).await.unwrap_err();
        assert!(err.is_retryable());
        store.set_offline(false);
        assert!(store.query(&Criteria::All, &[]).await.is_ok());
    }

    #[tokio::test]
    async fn remove_docs_counts() {
        let store = MemoryStore::new("tasks", "task_id");
        store
            .update(
                vec![
                    rec(json!({"task_id": 1, "state": "failed"})),
                    rec(json!({"task_id": 2, "state": "successful"})),
                    rec(json!({"task_id": 3, "state": "failed"})),
                ],
                &[],
            )
            .await
            .unwrap();
        let removed = store
            .remove_docs(&Criteria::equals("state", "failed"))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.query(&Criteria::All, &[]).await.unwrap().len(), 1);
    }
}

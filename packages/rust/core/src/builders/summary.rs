//! Summary builder: one record per key, assembled from property stores.
//!
//! Property kinds are data, not code. Each entry of the [`PropertyMap`] names
//! a store and how to read it, and the builder walks the map the same way
//! for every kind.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use matbuild_shared::{BuildSettings, Criteria, Key, PropertyMode, Record, Result};
use matbuild_storage::Store;

use crate::builder::{Builder, Extract, FetchBatch, ItemOutput};
use crate::builders::{DEFAULT_BATCH_SIZE, batch_criteria};
use crate::chunking::{Chunk, ChunkPlan, ChunkPlanner};
use crate::load::{LoadMode, Loader};
use crate::staleness::StalenessIndex;

/// How one property kind is read.
#[derive(Clone)]
pub struct PropertySpec {
    /// Store holding documents of this kind, keyed by the driving key field.
    pub store: Arc<dyn Store>,
    /// One document (the newest) or all of them.
    pub mode: PropertyMode,
    /// Extra filter for this kind.
    pub filter: Criteria,
    /// Fields copied from each document; all when empty.
    pub fields: Vec<String>,
}

impl PropertySpec {
    pub fn single(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            mode: PropertyMode::Single,
            filter: Criteria::All,
            fields: Vec::new(),
        }
    }

    pub fn list(store: Arc<dyn Store>) -> Self {
        Self {
            mode: PropertyMode::List,
            ..Self::single(store)
        }
    }

    pub fn with_filter(mut self, filter: Criteria) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }
}

/// Property kind → how to read it, iterated in kind order.
pub type PropertyMap = BTreeMap<String, PropertySpec>;

/// One driving record plus every property document found for its key.
#[derive(Debug, Clone)]
pub struct SummaryItem {
    pub key: Key,
    pub base: Record,
    /// kind → documents, newest first.
    pub properties: BTreeMap<String, Vec<Record>>,
    /// Newest LastUpdated over the base and all property documents.
    pub last_updated: Option<DateTime<Utc>>,
}

struct SummaryFetcher {
    source: Arc<dyn Store>,
    base: Criteria,
    properties: Arc<PropertyMap>,
}

#[async_trait]
impl FetchBatch for SummaryFetcher {
    type Item = SummaryItem;

    async fn fetch(&self, keys: &[Key]) -> Result<Vec<SummaryItem>> {
        let key_field = self.source.key();
        let bases = self
            .source
            .query(&batch_criteria(&self.base, key_field, keys), &[])
            .await?;

        // kind -> key -> (timestamp, doc)
        let mut found: BTreeMap<&str, HashMap<Key, Vec<(Option<DateTime<Utc>>, Record)>>> =
            BTreeMap::new();
        for (kind, spec) in self.properties.iter() {
            let lu_field = spec.store.last_updated_field();
            let projection = if spec.fields.is_empty() {
                Vec::new()
            } else {
                let mut p = spec.fields.clone();
                p.push(key_field.to_string());
                p.push(lu_field.to_string());
                p
            };
            let docs = spec
                .store
                .query(&batch_criteria(&spec.filter, key_field, keys), &projection)
                .await?;

            let by_key = found.entry(kind.as_str()).or_default();
            for doc in docs {
                if let Ok(key) = doc.key(&[key_field.to_string()]) {
                    by_key.entry(key).or_default().push((doc.last_updated(lu_field), doc));
                }
            }
        }

        let lu_field = self.source.last_updated_field();
        let mut items = Vec::with_capacity(bases.len());
        for base in bases {
            let Ok(key) = base.key(&[key_field.to_string()]) else {
                continue;
            };
            let mut last_updated = base.last_updated(lu_field);
            let mut properties = BTreeMap::new();
            for (kind, by_key) in found.iter_mut() {
                let Some(mut docs) = by_key.remove(&key) else {
                    continue;
                };
                // Newest first; stable so ties keep natural order.
                docs.sort_by(|a, b| b.0.cmp(&a.0));
                last_updated = last_updated.max(docs[0].0);
                properties.insert(kind.to_string(), docs.into_iter().map(|(_, d)| d).collect());
            }
            items.push(SummaryItem {
                key,
                base,
                properties,
                last_updated,
            });
        }
        Ok(items)
    }
}

/// Builds one summary record per driving key.
///
/// The summary is stale whenever the driving record or any property
/// document for its key changed after the last build.
pub struct SummaryBuilder {
    name: String,
    source: Arc<dyn Store>,
    target: Arc<dyn Store>,
    properties: Arc<PropertyMap>,
    settings: Arc<BuildSettings>,
    /// Base fields copied into the summary; all when empty.
    fields: Vec<String>,
    query: Criteria,
    staleness: StalenessIndex,
    batch_size: usize,
    loader: Loader,
}

impl SummaryBuilder {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn Store>,
        target: Arc<dyn Store>,
        properties: PropertyMap,
        settings: Arc<BuildSettings>,
    ) -> Self {
        let loader = Loader::new(target.clone(), LoadMode::Upsert);
        Self {
            name: name.into(),
            source,
            target,
            properties: Arc::new(properties),
            settings,
            fields: Vec::new(),
            query: Criteria::All,
            staleness: StalenessIndex::per_key(true),
            batch_size: DEFAULT_BATCH_SIZE,
            loader,
        }
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_query(mut self, query: Criteria) -> Self {
        self.query = query;
        self
    }

    pub fn with_staleness(mut self, staleness: StalenessIndex) -> Self {
        self.staleness = staleness;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    fn sources(&self) -> Vec<Arc<dyn Store>> {
        let mut all = vec![self.source.clone()];
        all.extend(self.properties.values().map(|spec| spec.store.clone()));
        all
    }

    /// Filters of the property stores, aligned with `sources()[1..]`.
    fn source_filters(&self) -> Vec<Criteria> {
        self.properties.values().map(|spec| spec.filter.clone()).collect()
    }
}

#[async_trait]
impl Builder for SummaryBuilder {
    type Item = SummaryItem;

    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_indexes(&self) -> Result<()> {
        self.source.ensure_index(self.source.key(), false).await?;
        for spec in self.properties.values() {
            spec.store.ensure_index(self.source.key(), false).await?;
        }
        self.target.ensure_index(self.target.key(), true).await?;
        Ok(())
    }

    async fn stale_keys(&self) -> Result<Vec<Key>> {
        self.staleness
            .compute_filtered(
                &self.sources(),
                &self.source_filters(),
                self.target.as_ref(),
                &self.query,
            )
            .await
    }

    async fn prechunk(&self, n: usize) -> Result<ChunkPlan> {
        let keys = self.stale_keys().await?;
        ChunkPlanner::plan(&keys, n, self.source.key())
    }

    async fn get_items(&self) -> Result<Extract<SummaryItem>> {
        let keys = self.stale_keys().await?;
        if keys.is_empty() {
            return Ok(Extract::empty());
        }
        Ok(Extract::new(
            keys,
            self.batch_size,
            SummaryFetcher {
                source: self.source.clone(),
                base: self.query.clone(),
                properties: self.properties.clone(),
            },
        ))
    }

    fn item_id(&self, item: &SummaryItem) -> String {
        item.key.to_string()
    }

    fn process_item(&self, item: &SummaryItem) -> Result<Option<ItemOutput>> {
        let mut record = item.base.project(&self.fields);
        record.remove(self.source.last_updated_field());
        record.remove(matbuild_shared::BUILD_TIME_FIELD);
        record.set(self.target.key(), item.key.to_value());

        let mut present = Vec::new();
        for (kind, spec) in self.properties.iter() {
            let Some(docs) = item.properties.get(kind) else {
                continue;
            };
            let value = match spec.mode {
                PropertyMode::Single => docs[0].clone().into_value(),
                PropertyMode::List => {
                    Value::Array(docs.iter().cloned().map(Record::into_value).collect())
                }
            };
            record.set(kind, value);
            present.push(Value::String(kind.clone()));
        }
        record.set("has_props", Value::Array(present));

        Ok(Some(ItemOutput::single(record, item.last_updated)))
    }

    async fn update_targets(&self, outputs: Vec<Option<ItemOutput>>) -> Result<usize> {
        self.loader.load(outputs).await
    }

    fn restrict(&self, chunk: &Chunk) -> Self {
        Self {
            name: format!("{}[{}/{}]", self.name, chunk.index + 1, chunk.total),
            source: self.source.clone(),
            target: self.target.clone(),
            properties: self.properties.clone(),
            settings: self.settings.clone(),
            fields: self.fields.clone(),
            query: self.query.clone().and(chunk.criteria.clone()),
            staleness: self.staleness.clone(),
            batch_size: self.batch_size,
            loader: self.loader.clone(),
        }
    }
}

//! One-to-one builder: each source record becomes one target record.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use matbuild_shared::{BuildSettings, Criteria, Key, MatbuildError, Record, Result};
use matbuild_storage::Store;

use crate::builder::{Builder, Extract, ItemOutput};
use crate::builders::{DEFAULT_BATCH_SIZE, SourceFetcher, SourceItem, record_label};
use crate::chunking::{Chunk, ChunkPlan, ChunkPlanner};
use crate::load::{LoadMode, Loader};
use crate::staleness::StalenessIndex;

/// Per-record transformation. Must be pure: no store access.
pub trait MapTransform: Send + Sync + 'static {
    fn transform(&self, source: &Record, settings: &BuildSettings) -> Result<Option<Record>>;
}

/// Copy the listed fields; the whole record when empty.
#[derive(Debug, Clone, Default)]
pub struct Projection {
    pub fields: Vec<String>,
}

impl Projection {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }
}

impl MapTransform for Projection {
    fn transform(&self, source: &Record, _settings: &BuildSettings) -> Result<Option<Record>> {
        Ok(Some(source.project(&self.fields)))
    }
}

/// Builds one target record per stale source key. The target record's key
/// field holds the source key.
pub struct MapBuilder<T: MapTransform> {
    name: String,
    source: Arc<dyn Store>,
    extra_sources: Vec<Arc<dyn Store>>,
    target: Arc<dyn Store>,
    transform: Arc<T>,
    settings: Arc<BuildSettings>,
    query: Criteria,
    staleness: StalenessIndex,
    batch_size: usize,
    delete_orphans: bool,
    loader: Loader,
}

impl<T: MapTransform> MapBuilder<T> {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn Store>,
        target: Arc<dyn Store>,
        transform: T,
        settings: Arc<BuildSettings>,
    ) -> Self {
        let loader = Loader::new(target.clone(), LoadMode::Upsert);
        Self {
            name: name.into(),
            source,
            extra_sources: Vec::new(),
            target,
            transform: Arc::new(transform),
            settings,
            query: Criteria::All,
            staleness: StalenessIndex::per_key(true),
            batch_size: DEFAULT_BATCH_SIZE,
            delete_orphans: false,
            loader,
        }
    }

    pub fn with_query(mut self, query: Criteria) -> Self {
        self.query = query;
        self
    }

    /// Stores whose timestamps also count toward staleness.
    pub fn with_extra_sources(mut self, extra: Vec<Arc<dyn Store>>) -> Self {
        self.extra_sources = extra;
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

    /// Remove target records whose key no longer exists in the source.
    pub fn with_delete_orphans(mut self, delete_orphans: bool) -> Self {
        self.delete_orphans = delete_orphans;
        self
    }

    fn sources(&self) -> Vec<Arc<dyn Store>> {
        let mut all = Vec::with_capacity(1 + self.extra_sources.len());
        all.push(self.source.clone());
        all.extend(self.extra_sources.iter().cloned());
        all
    }

    #[instrument(skip_all, fields(builder = %self.name))]
    async fn remove_orphans(&self) -> Result<usize> {
        let live: HashSet<Key> = self
            .source
            .distinct(self.source.key(), &self.query)
            .await?
            .iter()
            .filter_map(|v| Key::from_value(v).ok())
            .collect();
        let orphans: Vec<serde_json::Value> = self
            .target
            .distinct(self.target.key(), &Criteria::All)
            .await?
            .into_iter()
            .filter(|v| Key::from_value(v).is_ok_and(|k| !live.contains(&k)))
            .collect();
        if orphans.is_empty() {
            return Ok(0);
        }
        let removed = self
            .target
            .remove_docs(&Criteria::is_in(self.target.key(), orphans))
            .await?;
        info!(removed, "orphaned target records removed");
        Ok(removed)
    }
}

#[async_trait]
impl<T: MapTransform> Builder for MapBuilder<T> {
    type Item = SourceItem;

    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_indexes(&self) -> Result<()> {
        self.source.ensure_index(self.source.key(), false).await?;
        self.source
            .ensure_index(self.source.last_updated_field(), false)
            .await?;
        self.target.ensure_index(self.target.key(), true).await?;
        self.target
            .ensure_index(self.target.last_updated_field(), false)
            .await?;
        Ok(())
    }

    async fn stale_keys(&self) -> Result<Vec<Key>> {
        self.staleness
            .compute(&self.sources(), self.target.as_ref(), &self.query)
            .await
    }

    async fn prechunk(&self, n: usize) -> Result<ChunkPlan> {
        let keys = self.stale_keys().await?;
        ChunkPlanner::plan(&keys, n, self.source.key())
    }

    async fn get_items(&self) -> Result<Extract<SourceItem>> {
        let keys = self.stale_keys().await?;
        if keys.is_empty() {
            return Ok(Extract::empty());
        }
        Ok(Extract::new(
            keys,
            self.batch_size,
            SourceFetcher {
                store: self.source.clone(),
                extra: self.extra_sources.clone(),
                field: self.source.key().to_string(),
                base: self.query.clone(),
            },
        ))
    }

    fn item_id(&self, item: &SourceItem) -> String {
        record_label(&item.record, self.source.key())
    }

    fn process_item(&self, item: &SourceItem) -> Result<Option<ItemOutput>> {
        let key = item.record.get(self.source.key()).cloned().ok_or_else(|| {
            MatbuildError::validation(format!("source record lacks '{}'", self.source.key()))
        })?;
        let Some(mut record) = self.transform.transform(&item.record, &self.settings)? else {
            return Ok(None);
        };
        record.set(self.target.key(), key);
        // A timestamp copied from the source would hide extra-source changes.
        let lu_field = self.target.last_updated_field();
        if record.contains(lu_field)
            && record.get(lu_field) == item.record.get(self.source.last_updated_field())
        {
            record.remove(lu_field);
        }
        Ok(Some(ItemOutput::single(record, item.last_updated)))
    }

    async fn update_targets(&self, outputs: Vec<Option<ItemOutput>>) -> Result<usize> {
        self.loader.load(outputs).await
    }

    async fn finalize(&self) -> Result<()> {
        if self.delete_orphans {
            self.remove_orphans().await?;
        }
        Ok(())
    }

    fn restrict(&self, chunk: &Chunk) -> Self {
        Self {
            name: format!("{}[{}/{}]", self.name, chunk.index + 1, chunk.total),
            source: self.source.clone(),
            extra_sources: self.extra_sources.clone(),
            target: self.target.clone(),
            transform: self.transform.clone(),
            settings: self.settings.clone(),
            query: self.query.clone().and(chunk.criteria.clone()),
            staleness: self.staleness.clone(),
            batch_size: self.batch_size,
            // Orphans are only known against the whole source.
            delete_orphans: false,
            loader: self.loader.clone(),
        }
    }
}

//! The Extract → Transform → Load contract every builder implements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use matbuild_shared::{Key, Record, Result};

use crate::chunking::{Chunk, ChunkPlan};

/// What a transform produced for one item.
#[derive(Debug, Clone, Default)]
pub struct ItemOutput {
    /// Group the records belong to. Replace-group loads delete the target
    /// records of this parent before inserting `records`.
    pub parent: Option<Key>,
    /// Target records to write.
    pub records: Vec<Record>,
    /// Newest LastUpdated among the item's source records.
    pub source_last_updated: Option<DateTime<Utc>>,
}

impl ItemOutput {
    pub fn single(record: Record, source_last_updated: Option<DateTime<Utc>>) -> Self {
        Self {
            parent: None,
            records: vec![record],
            source_last_updated,
        }
    }
}

/// Fetches the items for one batch of keys.
#[async_trait]
pub trait FetchBatch: Send + Sync {
    type Item: Send;

    async fn fetch(&self, keys: &[Key]) -> Result<Vec<Self::Item>>;
}

/// Lazy, finite, non-restartable sequence of item batches.
///
/// The keys to process are known up front; the documents behind them are
/// fetched one batch at a time so memory stays bounded by `batch_size`.
pub struct Extract<I> {
    keys: Vec<Key>,
    batch_size: usize,
    cursor: usize,
    fetcher: Option<Box<dyn FetchBatch<Item = I>>>,
}

impl<I: Send> Extract<I> {
    pub fn new(
        keys: Vec<Key>,
        batch_size: usize,
        fetcher: impl FetchBatch<Item = I> + 'static,
    ) -> Self {
        Self {
            keys,
            batch_size: batch_size.max(1),
            cursor: 0,
            fetcher: Some(Box::new(fetcher)),
        }
    }

    /// An extraction with nothing to do.
    pub fn empty() -> Self {
        Self {
            keys: Vec::new(),
            batch_size: 1,
            cursor: 0,
            fetcher: None,
        }
    }

    /// Number of keys discovered for this run.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// Fetch the next batch, or `None` once every key has been handed out.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<I>>> {
        let Some(fetcher) = self.fetcher.as_ref() else {
            return Ok(None);
        };
        if self.cursor >= self.keys.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.keys.len());
        let batch = fetcher.fetch(&self.keys[self.cursor..end]).await?;
        self.cursor = end;
        Ok(Some(batch))
    }
}

/// A builder turns stale source records into target records.
///
/// Per invocation the pipeline calls `ensure_indexes`, `get_items`, then
/// `process_item` for each item and `update_targets` once per batch, and
/// finally `finalize`. `process_item` must not touch any store.
#[async_trait]
pub trait Builder: Send + Sync {
    type Item: Send + Sync;

    fn name(&self) -> &str;

    /// Create the indexes the builder's queries rely on.
    async fn ensure_indexes(&self) -> Result<()> {
        Ok(())
    }

    /// Driving-source keys that need a rebuild.
    async fn stale_keys(&self) -> Result<Vec<Key>>;

    /// Partition outstanding work into `n` chunks.
    async fn prechunk(&self, n: usize) -> Result<ChunkPlan>;

    /// Extract: discover work and return the lazy item sequence.
    async fn get_items(&self) -> Result<Extract<Self::Item>>;

    /// Short label for logs and transform errors.
    fn item_id(&self, item: &Self::Item) -> String;

    /// Transform one item. `Ok(None)` means nothing to write.
    fn process_item(&self, item: &Self::Item) -> Result<Option<ItemOutput>>;

    /// Load one batch of outputs; returns the number of records written.
    async fn update_targets(&self, outputs: Vec<Option<ItemOutput>>) -> Result<usize>;

    /// Post-run cleanup (orphan removal and the like).
    async fn finalize(&self) -> Result<()> {
        Ok(())
    }

    /// A copy of this builder that only sees `chunk`'s keys.
    fn restrict(&self, chunk: &Chunk) -> Self
    where
        Self: Sized;
}

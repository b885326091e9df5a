//! Stock builders.
//!
//! - [`MapBuilder`]: one target record per source record
//! - [`GroupBuilder`]: source records grouped by a field, transformed together
//! - [`SummaryBuilder`]: one record per key assembled from property stores

pub mod group;
pub mod map;
pub mod summary;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use matbuild_shared::{Criteria, Key, Record, Result};
use matbuild_storage::{Store, key_timestamps, latest_by_key};

use crate::builder::FetchBatch;

pub use group::{EquivalenceClassTransform, Group, GroupBuilder, GroupTransform};
pub use map::{MapBuilder, MapTransform, Projection};
pub use summary::{PropertyMap, PropertySpec, SummaryBuilder, SummaryItem};

/// Keys handed to one Load when nothing else is configured.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// A driving-source record plus the newest LastUpdated any source holds for
/// its key.
#[derive(Debug, Clone)]
pub struct SourceItem {
    pub record: Record,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Fetches the source records whose `field` is one of the batch keys.
///
/// Extra sources are only read for their timestamps, so the loaded target
/// record carries the same LastUpdated the staleness check compares with.
pub(crate) struct SourceFetcher {
    pub store: Arc<dyn Store>,
    pub extra: Vec<Arc<dyn Store>>,
    pub field: String,
    pub base: Criteria,
}

#[async_trait]
impl FetchBatch for SourceFetcher {
    type Item = SourceItem;

    async fn fetch(&self, keys: &[Key]) -> Result<Vec<SourceItem>> {
        let records = self
            .store
            .query(&batch_criteria(&self.base, &self.field, keys), &[])
            .await?;

        let mut newest: HashMap<Key, DateTime<Utc>> = HashMap::new();
        let only_batch = batch_criteria(&Criteria::All, &self.field, keys);
        for extra in &self.extra {
            let pairs = key_timestamps(extra.as_ref(), &only_batch, &self.field, true).await?;
            for (key, at) in latest_by_key(pairs, true) {
                newest
                    .entry(key)
                    .and_modify(|cur| *cur = (*cur).max(at))
                    .or_insert(at);
            }
        }

        let lu_field = self.store.last_updated_field();
        Ok(records
            .into_iter()
            .map(|record| {
                let own = record.last_updated(lu_field);
                let extra = record
                    .key(std::slice::from_ref(&self.field))
                    .ok()
                    .and_then(|k| newest.get(&k).copied());
                SourceItem {
                    last_updated: own.max(extra),
                    record,
                }
            })
            .collect())
    }
}

/// `base AND field ∈ keys`.
pub(crate) fn batch_criteria(base: &Criteria, field: &str, keys: &[Key]) -> Criteria {
    base.clone()
        .and(Criteria::is_in(field, keys.iter().map(Key::to_value).collect()))
}

/// Label a record by its key field for logs.
pub(crate) fn record_label(record: &Record, field: &str) -> String {
    record
        .key(&[field.to_string()])
        .map(|k| k.to_string())
        .unwrap_or_else(|_| "<no key>".to_string())
}

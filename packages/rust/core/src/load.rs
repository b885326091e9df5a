//! Writing transform outputs into a target store.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use matbuild_shared::{BUILD_TIME_FIELD, Criteria, Key, Record, Result, timestamp_value};
use matbuild_storage::Store;

use crate::builder::ItemOutput;

/// How a batch lands in the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadMode {
    /// Upsert each record by the target key fields.
    Upsert,
    /// Delete every target record of each parent in the batch and insert
    /// the new set in one atomic store call. Used when a group's record
    /// count may change between builds.
    ReplaceGroup { parent_field: String },
}

/// Stamps and writes outputs for one target.
#[derive(Clone)]
pub struct Loader {
    target: Arc<dyn Store>,
    key_fields: Vec<String>,
    mode: LoadMode,
}

impl Loader {
    pub fn new(target: Arc<dyn Store>, mode: LoadMode) -> Self {
        let key_fields = vec![target.key().to_string()];
        Self {
            target,
            key_fields,
            mode,
        }
    }

    /// Match on several fields instead of the target key.
    pub fn with_key_fields(mut self, key_fields: Vec<String>) -> Self {
        if !key_fields.is_empty() {
            self.key_fields = key_fields;
        }
        self
    }

    pub fn target(&self) -> &Arc<dyn Store> {
        &self.target
    }

    /// Write one batch. `None` outputs are skipped. Returns records written.
    ///
    /// Every record gets the build time under `_bt`. Its LastUpdated is the
    /// item's newest source timestamp unless the transform already set one,
    /// so a target record compares equal to the sources it was built from.
    pub async fn load(&self, outputs: Vec<Option<ItemOutput>>) -> Result<usize> {
        let built_at = Utc::now();
        let lu_field = self.target.last_updated_field().to_string();

        let mut parents: Vec<Key> = Vec::new();
        let mut records: Vec<Record> = Vec::new();
        for output in outputs.into_iter().flatten() {
            let stamp = output.source_last_updated.unwrap_or(built_at);
            if let Some(parent) = &output.parent {
                if !parents.contains(parent) {
                    parents.push(parent.clone());
                }
            }
            for mut record in output.records {
                record.set(BUILD_TIME_FIELD, timestamp_value(built_at));
                if record.last_updated(&lu_field).is_none() {
                    record.set_last_updated(&lu_field, stamp);
                }
                if let (LoadMode::ReplaceGroup { parent_field }, Some(parent)) =
                    (&self.mode, &output.parent)
                {
                    if !record.contains(parent_field) {
                        record.set(parent_field, parent.to_value());
                    }
                }
                records.push(record);
            }
        }

        if let LoadMode::ReplaceGroup { parent_field } = &self.mode {
            if !parents.is_empty() {
                // One atomic step: a rejected batch must not leave its
                // groups deleted.
                let groups = Criteria::is_in(
                    parent_field.as_str(),
                    parents.iter().map(Key::to_value).collect(),
                );
                let written = self.target.replace(&groups, records, &self.key_fields).await?;
                debug!(target = self.target.name(), parents = parents.len(), written, "groups replaced");
                return Ok(written);
            }
        }

        if records.is_empty() {
            return Ok(0);
        }
        let written = self.target.update(records, &self.key_fields).await?;
        debug!(target = self.target.name(), written, "batch loaded");
        Ok(written)
    }
}

//! Stale-key discovery between source stores and a target store.
//!
//! A key is stale when the target has no record for it (exhaustive mode
//! only) or when the target's LastUpdated for that key is older than the
//! newest LastUpdated any source holds for it. Timestamps are compared key
//! by key; a target-wide maximum would hide keys built before an unrelated
//! later build.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument};

use matbuild_shared::{Criteria, Key, Result, StalenessConfig};
use matbuild_storage::{Store, key_timestamps, latest_by_key, ordered_latest};

/// How staleness is decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StalenessMode {
    /// Compare each driving key with the target records that reference it.
    PerKey {
        /// Target field holding the source key; the target key when `None`.
        target_field: Option<String>,
    },
    /// Rebuild a whole group when any member changed after the group's
    /// oldest target record.
    WholeGroup {
        source_field: String,
        target_field: String,
    },
}

impl Default for StalenessMode {
    fn default() -> Self {
        Self::PerKey { target_field: None }
    }
}

impl From<&StalenessConfig> for StalenessMode {
    fn from(config: &StalenessConfig) -> Self {
        match config {
            StalenessConfig::PerKey { target_field } => Self::PerKey {
                target_field: target_field.clone(),
            },
            StalenessConfig::WholeGroup {
                source_field,
                target_field,
            } => Self::WholeGroup {
                source_field: source_field.clone(),
                target_field: target_field.clone(),
            },
        }
    }
}

/// Computes the StaleKeySet for a source set and a target.
#[derive(Debug, Clone)]
pub struct StalenessIndex {
    pub mode: StalenessMode,
    /// Treat keys missing from the target as stale.
    pub exhaustive: bool,
}

impl StalenessIndex {
    pub fn new(mode: StalenessMode, exhaustive: bool) -> Self {
        Self { mode, exhaustive }
    }

    pub fn per_key(exhaustive: bool) -> Self {
        Self::new(StalenessMode::default(), exhaustive)
    }

    /// Driving-source keys (in natural order, deduplicated) that need a
    /// rebuild. `criteria` restricts the driving source (`sources[0]`);
    /// further sources only contribute timestamps for the keys it holds.
    pub async fn compute(
        &self,
        sources: &[Arc<dyn Store>],
        target: &dyn Store,
        criteria: &Criteria,
    ) -> Result<Vec<Key>> {
        self.compute_filtered(sources, &[], target, criteria).await
    }

    /// [`compute`](Self::compute) where `filters[i]` restricts the records
    /// of `sources[i + 1]` that count. A secondary source must be read here
    /// with the same filter its builder fetches with; a record the build
    /// never sees would otherwise keep its key stale forever.
    #[instrument(skip_all, fields(target = target.name()))]
    pub async fn compute_filtered(
        &self,
        sources: &[Arc<dyn Store>],
        filters: &[Criteria],
        target: &dyn Store,
        criteria: &Criteria,
    ) -> Result<Vec<Key>> {
        let Some(driving) = sources.first() else {
            return Ok(Vec::new());
        };
        let start = std::time::Instant::now();

        let stale = match &self.mode {
            StalenessMode::PerKey { target_field: None } if sources.len() == 1 => {
                driving.newer_in(target, criteria, self.exhaustive).await?
            }
            StalenessMode::PerKey { target_field } => {
                let field = target_field.as_deref().unwrap_or(target.key());
                self.compare_per_key(sources, filters, target, criteria, field)
                    .await?
            }
            StalenessMode::WholeGroup {
                source_field,
                target_field,
            } => {
                self.compare_whole_group(
                    sources,
                    filters,
                    target,
                    criteria,
                    source_field,
                    target_field,
                )
                .await?
            }
        };

        info!(
            source = driving.name(),
            stale = stale.len(),
            exhaustive = self.exhaustive,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "staleness computed"
        );
        Ok(stale)
    }

    async fn compare_per_key(
        &self,
        sources: &[Arc<dyn Store>],
        filters: &[Criteria],
        target: &dyn Store,
        criteria: &Criteria,
        target_field: &str,
    ) -> Result<Vec<Key>> {
        let (order, source) = source_timestamps(sources, filters, criteria).await?;
        if order.is_empty() {
            return Ok(Vec::new());
        }
        let built = latest_by_key(
            key_timestamps(target, &Criteria::All, target_field, true).await?,
            false,
        );

        Ok(order
            .into_iter()
            .filter(|key| match built.get(key) {
                None => self.exhaustive,
                Some(at) => source[key] > *at,
            })
            .collect())
    }

    async fn compare_whole_group(
        &self,
        sources: &[Arc<dyn Store>],
        filters: &[Criteria],
        target: &dyn Store,
        criteria: &Criteria,
        source_field: &str,
        target_field: &str,
    ) -> Result<Vec<Key>> {
        let (order, source) = source_timestamps(sources, filters, criteria).await?;
        if order.is_empty() {
            return Ok(Vec::new());
        }

        // key -> group, then group -> newest source change.
        let driving = &sources[0];
        let docs = driving
            .query(criteria, &[driving.key().to_string(), source_field.to_string()])
            .await?;
        let mut group_of: HashMap<Key, Key> = HashMap::with_capacity(docs.len());
        for doc in &docs {
            let (Some(k), Some(g)) = (doc.get(driving.key()), doc.get(source_field)) else {
                continue;
            };
            if let (Ok(k), Some(g)) = (Key::from_value(k), group_value(g)) {
                group_of.entry(k).or_insert(g);
            }
        }

        let mut changed: HashMap<&Key, DateTime<Utc>> = HashMap::new();
        for key in &order {
            if let Some(group) = group_of.get(key) {
                let at = source[key];
                changed
                    .entry(group)
                    .and_modify(|cur| *cur = (*cur).max(at))
                    .or_insert(at);
            }
        }

        let built = latest_by_key(
            key_timestamps(target, &Criteria::All, target_field, false).await?,
            false,
        );

        let groups = changed.len();
        let stale_groups: HashSet<&Key> = changed
            .into_iter()
            .filter(|(group, at)| match built.get(*group) {
                None => self.exhaustive,
                Some(oldest) => at > oldest,
            })
            .map(|(group, _)| group)
            .collect();
        debug!(groups, stale_groups = stale_groups.len(), "group staleness");

        Ok(order
            .into_iter()
            .filter(|key| {
                group_of
                    .get(key)
                    .is_some_and(|g| stale_groups.contains(g))
            })
            .collect())
    }
}

/// Driving keys in natural order plus, per key, the newest LastUpdated over
/// every source.
async fn source_timestamps(
    sources: &[Arc<dyn Store>],
    filters: &[Criteria],
    criteria: &Criteria,
) -> Result<(Vec<Key>, HashMap<Key, DateTime<Utc>>)> {
    let driving = &sources[0];
    let (order, mut source) =
        ordered_latest(key_timestamps(driving.as_ref(), criteria, driving.key(), false).await?);

    for (i, extra) in sources[1..].iter().enumerate() {
        let filter = filters.get(i).unwrap_or(&Criteria::All);
        for (key, at) in key_timestamps(extra.as_ref(), filter, driving.key(), true).await? {
            if let Some(cur) = source.get_mut(&key) {
                if at > *cur {
                    *cur = at;
                }
            }
        }
    }
    Ok((order, source))
}

fn group_value(value: &Value) -> Option<Key> {
    Key::from_value(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use matbuild_shared::{MatbuildError, Record};
    use matbuild_storage::MemoryStore;
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn doc(v: serde_json::Value, secs: i64) -> Record {
        let mut rec = Record::from_value(v).unwrap();
        rec.set_last_updated("last_updated", ts(secs));
        rec
    }

    fn store(name: &str, key: &str) -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(name, key))
    }

    #[tokio::test]
    async fn per_key_single_source() {
        let tasks = store("tasks", "task_id");
        let materials = store("materials", "task_id");
        tasks
            .update(
                vec![
                    doc(json!({"task_id": "a"}), 10),
                    doc(json!({"task_id": "b"}), 20),
                    doc(json!({"task_id": "c"}), 30),
                ],
                &[],
            )
            .await
            .unwrap();
        materials
            .update(vec![doc(json!({"task_id": "a"}), 10), doc(json!({"task_id": "b"}), 5)], &[])
            .await
            .unwrap();

        let sources: Vec<Arc<dyn Store>> = vec![tasks.clone()];
        let exhaustive = StalenessIndex::per_key(true);
        let stale = exhaustive
            .compute(&sources, materials.as_ref(), &Criteria::All)
            .await
            .unwrap();
        assert_eq!(stale, vec![Key::from("b"), Key::from("c")]);

        let partial = StalenessIndex::per_key(false);
        let stale = partial
            .compute(&sources, materials.as_ref(), &Criteria::All)
            .await
            .unwrap();
        assert_eq!(stale, vec![Key::from("b")]);
    }

    #[tokio::test]
    async fn criteria_restricts_driving_source() {
        let tasks = store("tasks", "task_id");
        let materials = store("materials", "task_id");
        tasks
            .update(
                vec![
                    doc(json!({"task_id": "a", "state": "successful"}), 1),
                    doc(json!({"task_id": "b", "state": "failed"}), 1),
                ],
                &[],
            )
            .await
            .unwrap();
        let sources: Vec<Arc<dyn Store>> = vec![tasks];
        let stale = StalenessIndex::per_key(true)
            .compute(&sources, materials.as_ref(), &Criteria::equals("state", "successful"))
            .await
            .unwrap();
        assert_eq!(stale, vec![Key::from("a")]);
    }

    #[tokio::test]
    async fn secondary_source_and_array_target_field() {
        let tasks = store("tasks", "task_id");
        let extra = store("calcs", "task_id");
        let materials = store("materials", "material_id");

        tasks
            .update(
                vec![
                    doc(json!({"task_id": "t1"}), 10),
                    doc(json!({"task_id": "t2"}), 10),
                    doc(json!({"task_id": "t3"}), 10),
                ],
                &[],
            )
            .await
            .unwrap();
        // t2 changed later in a secondary source; t9 is not a driving key.
        extra
            .update(vec![doc(json!({"task_id": "t2"}), 50), doc(json!({"task_id": "t9"}), 99)], &[])
            .await
            .unwrap();
        // One material built from t1 and t2; t3 built on its own.
        materials
            .update(
                vec![
                    doc(json!({"material_id": "m1", "task_ids": ["t1", "t2"]}), 20),
                    doc(json!({"material_id": "m2", "task_ids": ["t3"]}), 20),
                ],
                &[],
            )
            .await
            .unwrap();

        let sources: Vec<Arc<dyn Store>> = vec![tasks, extra];
        let index = StalenessIndex::new(
            StalenessMode::PerKey {
                target_field: Some("task_ids".into()),
            },
            true,
        );
        let stale = index
            .compute(&sources, materials.as_ref(), &Criteria::All)
            .await
            .unwrap();
        assert_eq!(stale, vec![Key::from("t2")]);
    }

    #[tokio::test]
    async fn oldest_target_record_wins() {
        let tasks = store("tasks", "task_id");
        let classes = store("classes", "class_id");
        tasks.update(vec![doc(json!({"task_id": "t1"}), 30)], &[]).await.unwrap();
        classes
            .update(
                vec![
                    doc(json!({"class_id": 1, "task_ids": ["t1"]}), 40),
                    doc(json!({"class_id": 2, "task_ids": ["t1"]}), 20),
                ],
                &[],
            )
            .await
            .unwrap();
        let sources: Vec<Arc<dyn Store>> = vec![tasks];
        let index = StalenessIndex::new(
            StalenessMode::PerKey {
                target_field: Some("task_ids".into()),
            },
            false,
        );
        let stale = index.compute(&sources, classes.as_ref(), &Criteria::All).await.unwrap();
        assert_eq!(stale, vec![Key::from("t1")]);
    }

    #[tokio::test]
    async fn whole_group_invalidation() {
        let tasks = store("tasks", "task_id");
        let materials = store("materials", "material_id");
        tasks
            .update(
                vec![
                    doc(json!({"task_id": "a1", "chemsys": "Fe-O"}), 10),
                    doc(json!({"task_id": "a2", "chemsys": "Fe-O"}), 60),
                    doc(json!({"task_id": "b1", "chemsys": "Na-Cl"}), 10),
                    doc(json!({"task_id": "c1", "chemsys": "Li"}), 10),
                ],
                &[],
            )
            .await
            .unwrap();
        materials
            .update(
                vec![
                    doc(json!({"material_id": "m1", "chemsys": "Fe-O"}), 50),
                    doc(json!({"material_id": "m2", "chemsys": "Na-Cl"}), 50),
                ],
                &[],
            )
            .await
            .unwrap();

        let sources: Vec<Arc<dyn Store>> = vec![tasks];
        let mode = StalenessMode::WholeGroup {
            source_field: "chemsys".into(),
            target_field: "chemsys".into(),
        };

        // a1 itself is older than the build, but its group changed.
        let stale = StalenessIndex::new(mode.clone(), true)
            .compute(&sources, materials.as_ref(), &Criteria::All)
            .await
            .unwrap();
        assert_eq!(stale, vec![Key::from("a1"), Key::from("a2"), Key::from("c1")]);

        let stale = StalenessIndex::new(mode, false)
            .compute(&sources, materials.as_ref(), &Criteria::All)
            .await
            .unwrap();
        assert_eq!(stale, vec![Key::from("a1"), Key::from("a2")]);
    }

    #[tokio::test]
    async fn empty_source_is_never_stale() {
        let sources: Vec<Arc<dyn Store>> = vec![store("tasks", "task_id")];
        let target = store("materials", "task_id");
        let stale = StalenessIndex::per_key(true)
            .compute(&sources, target.as_ref(), &Criteria::All)
            .await
            .unwrap();
        assert!(stale.is_empty());
        assert!(StalenessIndex::per_key(true)
            .compute(&[], target.as_ref(), &Criteria::All)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn touching_a_source_record_makes_it_stale() {
        let tasks = store("tasks", "task_id");
        let materials = store("materials", "task_id");
        tasks.update(vec![doc(json!({"task_id": "a"}), 10)], &[]).await.unwrap();
        materials.update(vec![doc(json!({"task_id": "a"}), 10)], &[]).await.unwrap();
        let sources: Vec<Arc<dyn Store>> = vec![tasks.clone()];
        let index = StalenessIndex::per_key(true);
        assert!(index.compute(&sources, materials.as_ref(), &Criteria::All).await.unwrap().is_empty());

        tasks.update(vec![doc(json!({"task_id": "a"}), 11)], &[]).await.unwrap();
        let stale = index.compute(&sources, materials.as_ref(), &Criteria::All).await.unwrap();
        assert_eq!(stale, vec![Key::from("a")]);
    }

    #[tokio::test]
    async fn secondary_filter_ignores_excluded_records() {
        let materials = store("materials", "material_id");
        let elasticity = store("elasticity", "material_id");
        let summaries = store("summary", "material_id");
        materials
            .update(vec![doc(json!({"material_id": "m1"}), 10)], &[])
            .await
            .unwrap();
        elasticity
            .update(
                vec![
                    doc(json!({"material_id": "m1", "doc": 1, "deprecated": false}), 20),
                    doc(json!({"material_id": "m1", "doc": 2, "deprecated": true}), 50),
                ],
                &["doc".to_string()],
            )
            .await
            .unwrap();
        summaries
            .update(vec![doc(json!({"material_id": "m1"}), 20)], &[])
            .await
            .unwrap();

        let sources: Vec<Arc<dyn Store>> = vec![materials, elasticity];
        let index = StalenessIndex::per_key(true);

        let unfiltered = index
            .compute(&sources, summaries.as_ref(), &Criteria::All)
            .await
            .unwrap();
        assert_eq!(unfiltered, vec![Key::from("m1")]);

        let filtered = index
            .compute_filtered(
                &sources,
                &[Criteria::equals("deprecated", false)],
                summaries.as_ref(),
                &Criteria::All,
            )
            .await
            .unwrap();
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn store_outage_propagates() {
        let tasks = store("tasks", "task_id");
        let materials = store("materials", "task_id");
        tasks.set_offline(true);
        let sources: Vec<Arc<dyn Store>> = vec![tasks];
        let err = StalenessIndex::per_key(true)
            .compute(&sources, materials.as_ref(), &Criteria::All)
            .await
            .unwrap_err();
        assert!(matches!(err, MatbuildError::StoreUnavailable { .. }));
    }
}

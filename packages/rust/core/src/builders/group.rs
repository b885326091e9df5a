//! Group builder: source records sharing a field value are transformed
//! together, and the group's target records are replaced as a whole.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::debug;

use matbuild_shared::{BuildSettings, Criteria, Key, Record, Result};
use matbuild_storage::Store;

use crate::builder::{Builder, Extract, FetchBatch, ItemOutput};
use crate::builders::{DEFAULT_BATCH_SIZE, batch_criteria};
use crate::chunking::{Chunk, ChunkPlan, ChunkPlanner};
use crate::grouping::group_into_classes;
use crate::load::{LoadMode, Loader};
use crate::staleness::{StalenessIndex, StalenessMode};

/// All source records sharing one group value.
#[derive(Debug, Clone)]
pub struct Group {
    pub value: Key,
    /// Members in the source's natural order.
    pub members: Vec<Record>,
    /// Newest member LastUpdated.
    pub last_updated: Option<DateTime<Utc>>,
}

/// Turns one group into its target records. Must be pure.
pub trait GroupTransform: Send + Sync + 'static {
    fn transform(&self, group: &Group, settings: &BuildSettings) -> Result<Vec<Record>>;
}

// ---------------------------------------------------------------------------
// Equivalence classes
// ---------------------------------------------------------------------------

/// Clusters a group's members into equivalence classes and emits one record
/// per class.
///
/// Two members are equivalent when every compare field differs by no more
/// than its tolerance in [`BuildSettings`]. The relation is not transitive;
/// classes are its connected components. Members missing a compare field
/// form classes of their own. Each class is represented by the member with
/// the highest quality score (first member on ties).
#[derive(Debug, Clone)]
pub struct EquivalenceClassTransform {
    /// Source key field; member keys are listed under `source_keys`.
    pub source_key: String,
    /// Target key field; filled with `<group>-<class index>`.
    pub target_key: String,
    pub compare_fields: Vec<String>,
    /// Field whose value is looked up in `settings.quality_scores`.
    pub quality_field: Option<String>,
}

impl EquivalenceClassTransform {
    fn coordinates(&self, record: &Record) -> Option<Vec<f64>> {
        self.compare_fields
            .iter()
            .map(|f| record.get(f).and_then(Value::as_f64))
            .collect()
    }

    fn quality(&self, record: &Record, settings: &BuildSettings) -> i64 {
        self.quality_field
            .as_deref()
            .and_then(|f| record.get(f))
            .and_then(Value::as_str)
            .map_or(i64::MIN, |kind| settings.quality_score(kind))
    }
}

impl GroupTransform for EquivalenceClassTransform {
    fn transform(&self, group: &Group, settings: &BuildSettings) -> Result<Vec<Record>> {
        let coords: Vec<Option<Vec<f64>>> =
            group.members.iter().map(|m| self.coordinates(m)).collect();
        let tolerances: Vec<f64> = self
            .compare_fields
            .iter()
            .map(|f| settings.tolerance(f))
            .collect();

        let indices: Vec<usize> = (0..group.members.len()).collect();
        let classes = group_into_classes(indices, |a, b| match (&coords[*a], &coords[*b]) {
            (Some(x), Some(y)) => x
                .iter()
                .zip(y)
                .zip(&tolerances)
                .all(|((p, q), tol)| (p - q).abs() <= *tol),
            _ => false,
        });

        let mut out = Vec::with_capacity(classes.len());
        for (index, class) in classes.iter().enumerate() {
            let mut best = class[0];
            let mut best_score = self.quality(&group.members[best], settings);
            for &member in &class[1..] {
                let score = self.quality(&group.members[member], settings);
                if score > best_score {
                    best = member;
                    best_score = score;
                }
            }
            let rep = &group.members[best];

            let mut record = Record::new();
            record.set(&self.target_key, json!(format!("{}-{index}", group.value)));
            let keys: Vec<Value> = class
                .iter()
                .filter_map(|&m| group.members[m].get(&self.source_key).cloned())
                .collect();
            record.set("source_keys", Value::Array(keys));
            record.set("n_members", json!(class.len()));
            if let Some(key) = rep.get(&self.source_key) {
                record.set("representative", key.clone());
            }
            for field in self.compare_fields.iter().chain(self.quality_field.iter()) {
                if let Some(v) = rep.get(field) {
                    record.set(field, v.clone());
                }
            }
            out.push(record);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Fetches whole groups for a batch of group values.
struct GroupFetcher {
    store: Arc<dyn Store>,
    group_field: String,
    base: Criteria,
}

#[async_trait]
impl FetchBatch for GroupFetcher {
    type Item = Group;

    async fn fetch(&self, values: &[Key]) -> Result<Vec<Group>> {
        let docs = self
            .store
            .query(&batch_criteria(&self.base, &self.group_field, values), &[])
            .await?;
        let lu_field = self.store.last_updated_field();

        let mut buckets: HashMap<Key, Vec<Record>> = HashMap::new();
        for doc in docs {
            if let Some(Ok(value)) = doc.get(&self.group_field).map(Key::from_value) {
                buckets.entry(value).or_default().push(doc);
            }
        }

        Ok(values
            .iter()
            .filter_map(|value| {
                let members = buckets.remove(value)?;
                let last_updated = members.iter().filter_map(|m| m.last_updated(lu_field)).max();
                Some(Group {
                    value: value.clone(),
                    members,
                    last_updated,
                })
            })
            .collect())
    }
}

/// Builds target records per group of source records.
///
/// Stale keys are widened to whole groups: every member of a group with a
/// stale key is re-fetched, and chunks are planned over group values so a
/// group never straddles two workers.
pub struct GroupBuilder<T: GroupTransform> {
    name: String,
    source: Arc<dyn Store>,
    target: Arc<dyn Store>,
    group_field: String,
    transform: Arc<T>,
    settings: Arc<BuildSettings>,
    query: Criteria,
    staleness: StalenessIndex,
    batch_size: usize,
    loader: Loader,
}

impl<T: GroupTransform> GroupBuilder<T> {
    /// Staleness defaults to whole-group invalidation on `group_field`.
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn Store>,
        target: Arc<dyn Store>,
        group_field: impl Into<String>,
        transform: T,
        settings: Arc<BuildSettings>,
    ) -> Self {
        let group_field = group_field.into();
        let loader = Loader::new(
            target.clone(),
            LoadMode::ReplaceGroup {
                parent_field: group_field.clone(),
            },
        );
        Self {
            name: name.into(),
            source,
            target,
            staleness: StalenessIndex::new(
                StalenessMode::WholeGroup {
                    source_field: group_field.clone(),
                    target_field: group_field.clone(),
                },
                true,
            ),
            group_field,
            transform: Arc::new(transform),
            settings,
            query: Criteria::All,
            batch_size: DEFAULT_BATCH_SIZE,
            loader,
        }
    }

    pub fn with_query(mut self, query: Criteria) -> Self {
        self.query = query;
        self
    }

    pub fn with_staleness(mut self, staleness: StalenessIndex) -> Self {
        self.staleness = staleness;
        self
    }

    /// Number of groups per Load.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Group values holding at least one stale key, in first-seen order.
    pub async fn stale_groups(&self) -> Result<Vec<Key>> {
        let keys = self.stale_keys().await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let docs = self
            .source
            .query(
                &batch_criteria(&self.query, self.source.key(), &keys),
                &[self.group_field.clone()],
            )
            .await?;

        let mut groups: Vec<Key> = Vec::new();
        for doc in &docs {
            if let Some(Ok(value)) = doc.get(&self.group_field).map(Key::from_value) {
                if !groups.contains(&value) {
                    groups.push(value);
                }
            }
        }
        debug!(keys = keys.len(), groups = groups.len(), "stale keys widened to groups");
        Ok(groups)
    }
}

#[async_trait]
impl<T: GroupTransform> Builder for GroupBuilder<T> {
    type Item = Group;

    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_indexes(&self) -> Result<()> {
        self.source.ensure_index(self.source.key(), false).await?;
        self.source.ensure_index(&self.group_field, false).await?;
        self.source
            .ensure_index(self.source.last_updated_field(), false)
            .await?;
        self.target.ensure_index(self.target.key(), true).await?;
        self.target.ensure_index(&self.group_field, false).await?;
        Ok(())
    }

    async fn stale_keys(&self) -> Result<Vec<Key>> {
        self.staleness
            .compute(&[self.source.clone()], self.target.as_ref(), &self.query)
            .await
    }

    async fn prechunk(&self, n: usize) -> Result<ChunkPlan> {
        let groups = self.stale_groups().await?;
        ChunkPlanner::plan(&groups, n, &self.group_field)
    }

    async fn get_items(&self) -> Result<Extract<Group>> {
        let groups = self.stale_groups().await?;
        if groups.is_empty() {
            return Ok(Extract::empty());
        }
        Ok(Extract::new(
            groups,
            self.batch_size,
            GroupFetcher {
                store: self.source.clone(),
                group_field: self.group_field.clone(),
                base: self.query.clone(),
            },
        ))
    }

    fn item_id(&self, item: &Group) -> String {
        format!("{}={}", self.group_field, item.value)
    }

    /// An empty result still replaces the group, clearing its old records.
    fn process_item(&self, item: &Group) -> Result<Option<ItemOutput>> {
        let records = self.transform.transform(item, &self.settings)?;
        Ok(Some(ItemOutput {
            parent: Some(item.value.clone()),
            records,
            source_last_updated: item.last_updated,
        }))
    }

    async fn update_targets(&self, outputs: Vec<Option<ItemOutput>>) -> Result<usize> {
        self.loader.load(outputs).await
    }

    fn restrict(&self, chunk: &Chunk) -> Self {
        Self {
            name: format!("{}[{}/{}]", self.name, chunk.index + 1, chunk.total),
            source: self.source.clone(),
            target: self.target.clone(),
            group_field: self.group_field.clone(),
            transform: self.transform.clone(),
            settings: self.settings.clone(),
            query: self.query.clone().and(chunk.criteria.clone()),
            staleness: self.staleness.clone(),
            batch_size: self.batch_size,
            loader: self.loader.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use matbuild_storage::MemoryStore;

    use crate::pipeline::{RunOptions, SilentProgress, run, run_chunked};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn task(id: &str, formula: &str, volume: f64, functional: &str, secs: i64) -> Record {
        let mut rec = Record::from_value(json!({
            "task_id": id,
            "formula": formula,
            "volume": volume,
            "functional": functional,
        }))
        .unwrap();
        rec.set_last_updated("last_updated", ts(secs));
        rec
    }

    fn settings() -> Arc<BuildSettings> {
        Arc::new(BuildSettings {
            tolerances: [("volume".to_string(), 0.1)].into(),
            quality_scores: [("r2SCAN".to_string(), 3), ("GGA".to_string(), 1)].into(),
            ..BuildSettings::default()
        })
    }

    fn classes() -> EquivalenceClassTransform {
        EquivalenceClassTransform {
            source_key: "task_id".into(),
            target_key: "material_id".into(),
            compare_fields: vec!["volume".into()],
            quality_field: Some("functional".into()),
        }
    }

    fn group_of(members: Vec<Record>) -> Group {
        Group {
            value: Key::from("Fe2O3"),
            members,
            last_updated: None,
        }
    }

    #[test]
    fn classes_pick_best_representative() {
        let group = group_of(vec![
            task("t1", "Fe2O3", 10.0, "GGA", 1),
            task("t2", "Fe2O3", 10.05, "r2SCAN", 1),
            task("t3", "Fe2O3", 12.0, "GGA", 1),
        ]);
        let out = classes().transform(&group, &settings()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get("material_id"), Some(&json!("Fe2O3-0")));
        assert_eq!(out[0].get("source_keys"), Some(&json!(["t1", "t2"])));
        assert_eq!(out[0].get("representative"), Some(&json!("t2")));
        assert_eq!(out[0].get("volume"), Some(&json!(10.05)));
        assert_eq!(out[1].get("source_keys"), Some(&json!(["t3"])));
    }

    #[test]
    fn chained_members_share_a_class() {
        let group = group_of(vec![
            task("a", "Fe2O3", 10.0, "GGA", 1),
            task("b", "Fe2O3", 10.16, "GGA", 1),
            task("c", "Fe2O3", 10.08, "GGA", 1),
        ]);
        let out = classes().transform(&group, &settings()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("n_members"), Some(&json!(3)));
    }

    #[test]
    fn members_without_coordinates_stand_alone() {
        let mut odd = task("x", "Fe2O3", 0.0, "GGA", 1);
        odd.remove("volume");
        let group = group_of(vec![task("a", "Fe2O3", 10.0, "GGA", 1), odd]);
        let out = classes().transform(&group, &settings()).unwrap();
        assert_eq!(out.len(), 2);
    }

    fn builder(
        tasks: &Arc<MemoryStore>,
        materials: &Arc<MemoryStore>,
    ) -> GroupBuilder<EquivalenceClassTransform> {
        GroupBuilder::new(
            "materials",
            tasks.clone(),
            materials.clone(),
            "formula",
            classes(),
            settings(),
        )
    }

    #[tokio::test]
    async fn rebuild_replaces_whole_group() {
        let tasks = Arc::new(MemoryStore::new("tasks", "task_id"));
        let materials = Arc::new(MemoryStore::new("materials", "material_id"));
        tasks
            .update(
                vec![
                    task("t1", "Fe2O3", 10.0, "GGA", 1),
                    task("t2", "Fe2O3", 12.0, "GGA", 2),
                    task("t3", "NaCl", 5.0, "GGA", 3),
                ],
                &[],
            )
            .await
            .unwrap();
        let builder = builder(&tasks, &materials);

        let report = run(&builder, &RunOptions::default(), &SilentProgress).await.unwrap();
        assert_eq!(report.discovered, 2);
        assert_eq!(report.loaded, 3);
        assert!(builder.stale_keys().await.unwrap().is_empty());

        // t2 relaxes onto t1: Fe2O3 collapses to one class.
        tasks
            .update(vec![task("t2", "Fe2O3", 10.02, "GGA", 9)], &[])
            .await
            .unwrap();
        assert_eq!(builder.stale_groups().await.unwrap(), vec![Key::from("Fe2O3")]);
        run(&builder, &RunOptions::default(), &SilentProgress).await.unwrap();

        let fe = materials
            .query(&Criteria::equals("formula", "Fe2O3"), &[])
            .await
            .unwrap();
        assert_eq!(fe.len(), 1);
        assert_eq!(fe[0].last_updated("last_updated"), Some(ts(9)));
        assert_eq!(materials.count(&Criteria::All).await.unwrap(), 2);
        assert!(builder.stale_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chunks_never_split_a_group() {
        let tasks = Arc::new(MemoryStore::new("tasks", "task_id"));
        let materials = Arc::new(MemoryStore::new("materials", "material_id"));
        tasks
            .update(
                vec![
                    task("a1", "A", 1.0, "GGA", 1),
                    task("b1", "B", 1.0, "GGA", 1),
                    task("a2", "A", 5.0, "GGA", 1),
                    task("c1", "C", 1.0, "GGA", 1),
                    task("b2", "B", 9.0, "GGA", 1),
                ],
                &[],
            )
            .await
            .unwrap();
        let builder = builder(&tasks, &materials);

        let plan = builder.prechunk(2).await.unwrap();
        assert_eq!(plan.sizes(), vec![2, 1]);
        assert_eq!(plan.chunks[0].keys, vec![Key::from("A"), Key::from("B")]);

        let report = run_chunked(&builder, 2, 2, &RunOptions::default()).await.unwrap();
        assert!(report.failed.is_empty());
        assert_eq!(report.loaded(), 5);
        assert!(builder.stale_groups().await.unwrap().is_empty());
    }
}

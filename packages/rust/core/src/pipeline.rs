//! Execution pipeline: drives a [`Builder`] through Extract → Transform → Load.
//!
//! One invocation is sequential. Parallelism comes from [`run_chunked`],
//! which plans chunks and runs an independent invocation per chunk.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use matbuild_shared::{MatbuildError, Result};

use crate::builder::Builder;

/// Shared cancellation switch, checked between items.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cancel: CancelFlag,
}

/// Outcome of one pipeline invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Run identifier (UUID v7, time-ordered).
    pub run_id: String,
    pub builder: String,
    /// Items the extraction discovered.
    pub discovered: usize,
    /// Items whose transform produced output.
    pub transformed: usize,
    /// Items whose transform produced nothing to write.
    pub skipped: usize,
    /// Items whose transform failed.
    pub dropped: usize,
    /// Labels of the dropped items.
    pub failed_items: Vec<String>,
    /// Records written to the target.
    pub loaded: usize,
    /// Batches loaded.
    pub batches: usize,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl RunReport {
    fn new(builder: &str) -> Self {
        Self {
            run_id: Uuid::now_v7().to_string(),
            builder: builder.to_string(),
            discovered: 0,
            transformed: 0,
            skipped: 0,
            dropped: 0,
            failed_items: Vec::new(),
            loaded: 0,
            batches: 0,
            cancelled: false,
            elapsed_ms: 0,
        }
    }
}

/// Outcome of a chunked run.
#[derive(Debug, Clone, Serialize)]
pub struct DistributedReport {
    pub builder: String,
    /// One report per chunk that completed.
    pub chunks: Vec<RunReport>,
    /// `(chunk index, error)` for chunks that failed.
    pub failed: Vec<(usize, String)>,
}

impl DistributedReport {
    pub fn loaded(&self) -> usize {
        self.chunks.iter().map(|r| r.loaded).sum()
    }

    pub fn discovered(&self) -> usize {
        self.chunks.iter().map(|r| r.discovered).sum()
    }
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called after each transformed item.
    fn item_processed(&self, current: usize, total: usize);
    /// Called when the run completes.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn item_processed(&self, _current: usize, _total: usize) {}
    fn done(&self, _report: &RunReport) {}
}

/// Run one builder invocation.
///
/// 1. Prepare indexes
/// 2. Extract: discover stale work
/// 3. Transform each item; failures are logged and dropped
/// 4. Load once per batch
/// 5. Finalize
///
/// Store failures abort the run; batches loaded before the failure stay
/// committed. Nothing to do is not an error.
#[instrument(skip_all, fields(builder = builder.name()))]
pub async fn run<B: Builder>(
    builder: &B,
    options: &RunOptions,
    progress: &dyn ProgressReporter,
) -> Result<RunReport> {
    let start = Instant::now();
    let mut report = RunReport::new(builder.name());
    info!(run_id = %report.run_id, "starting build");

    // --- Phase 1: Indexes ---
    progress.phase("Preparing indexes");
    builder.ensure_indexes().await?;

    // --- Phase 2: Extract ---
    progress.phase("Finding stale items");
    let mut items = builder.get_items().await?;
    report.discovered = items.len();
    if items.is_empty() {
        info!("nothing to build");
    }

    // --- Phase 3/4: Transform + Load per batch ---
    progress.phase("Building");
    let mut seen = 0;
    'batches: while let Some(batch) = items.next_batch().await? {
        let mut outputs = Vec::with_capacity(batch.len());
        for item in &batch {
            if options.cancel.is_cancelled() {
                report.cancelled = true;
                break 'batches;
            }
            seen += 1;
            match builder.process_item(item) {
                Ok(Some(output)) => {
                    report.transformed += 1;
                    outputs.push(Some(output));
                }
                Ok(None) => {
                    report.skipped += 1;
                    outputs.push(None);
                }
                Err(e) => {
                    let id = builder.item_id(item);
                    let err = match e {
                        e @ MatbuildError::ItemTransform { .. } => e,
                        other => MatbuildError::transform(&id, other.to_string()),
                    };
                    warn!(item = %id, error = %err, "transform failed, item dropped");
                    report.dropped += 1;
                    report.failed_items.push(id);
                }
            }
            progress.item_processed(seen, report.discovered);
        }

        let loaded = builder.update_targets(outputs).await?;
        report.loaded += loaded;
        report.batches += 1;
        debug!(batch = report.batches, loaded, "batch committed");
    }

    // --- Phase 5: Finalize ---
    if report.cancelled {
        warn!(processed = seen, "build cancelled, in-flight batch discarded");
    } else {
        progress.phase("Finalizing");
        builder.finalize().await?;
    }

    report.elapsed_ms = start.elapsed().as_millis() as u64;
    info!(
        run_id = %report.run_id,
        discovered = report.discovered,
        transformed = report.transformed,
        dropped = report.dropped,
        loaded = report.loaded,
        batches = report.batches,
        elapsed_ms = report.elapsed_ms,
        "build complete"
    );
    progress.done(&report);
    Ok(report)
}

/// Plan `chunks` chunks and run one invocation per chunk, at most `workers`
/// at a time. Chunks share nothing but the stores.
///
/// A failing chunk does not stop the others; its error is recorded in the
/// report. The builder's `finalize` runs once, after every chunk succeeded.
#[instrument(skip_all, fields(builder = builder.name(), chunks, workers))]
pub async fn run_chunked<B>(
    builder: &B,
    chunks: usize,
    workers: usize,
    options: &RunOptions,
) -> Result<DistributedReport>
where
    B: Builder + 'static,
{
    builder.ensure_indexes().await?;
    let plan = builder.prechunk(chunks).await?;
    info!(planned = plan.len(), sizes = ?plan.sizes(), "running chunked build");

    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut handles = Vec::with_capacity(plan.len());
    for chunk in plan.chunks {
        let worker = builder.restrict(&chunk);
        let sem = semaphore.clone();
        let opts = options.clone();
        let index = chunk.index;

        handles.push((
            index,
            tokio::spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|e| MatbuildError::chunk_worker(index, e.to_string()))?;
                run(&worker, &opts, &SilentProgress).await
            }),
        ));
    }

    let mut report = DistributedReport {
        builder: builder.name().to_string(),
        chunks: Vec::new(),
        failed: Vec::new(),
    };
    for (index, handle) in handles {
        match handle.await {
            Ok(Ok(chunk_report)) => report.chunks.push(chunk_report),
            Ok(Err(e)) => {
                warn!(chunk = index, error = %e, "chunk failed");
                report.failed.push((index, e.to_string()));
            }
            Err(e) => {
                warn!(chunk = index, error = %e, "chunk task panicked");
                report.failed.push((index, e.to_string()));
            }
        }
    }

    let cancelled = report.chunks.iter().any(|r| r.cancelled);
    if report.failed.is_empty() && !cancelled {
        builder.finalize().await?;
    }
    info!(
        completed = report.chunks.len(),
        failed = report.failed.len(),
        loaded = report.loaded(),
        "chunked build complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::{DateTime, TimeZone, Utc};
    use matbuild_shared::{BuildSettings, Criteria, Key, Record};
    use matbuild_storage::{MemoryStore, Store};
    use serde_json::json;

    use crate::builders::map::{MapBuilder, MapTransform, Projection};
    use crate::staleness::StalenessIndex;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn task(id: &str, secs: i64) -> Record {
        let mut rec = Record::from_value(json!({"task_id": id, "energy": -1.0})).unwrap();
        rec.set_last_updated("last_updated", ts(secs));
        rec
    }

    fn stores() -> (Arc<MemoryStore>, Arc<MemoryStore>) {
        (
            Arc::new(MemoryStore::new("tasks", "task_id")),
            Arc::new(MemoryStore::new("materials", "task_id")),
        )
    }

    fn map_builder<T: MapTransform>(
        source: &Arc<MemoryStore>,
        target: &Arc<MemoryStore>,
        transform: T,
    ) -> MapBuilder<T> {
        MapBuilder::new(
            "materials",
            source.clone(),
            target.clone(),
            transform,
            Arc::new(BuildSettings::default()),
        )
        .with_batch_size(2)
    }

    /// Fails for one key, passes everything else through.
    struct FailOn(&'static str);

    impl MapTransform for FailOn {
        fn transform(&self, source: &Record, _settings: &BuildSettings) -> Result<Option<Record>> {
            if source.get("task_id") == Some(&json!(self.0)) {
                return Err(MatbuildError::validation("energy out of range"));
            }
            Ok(Some(source.clone()))
        }
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    impl ProgressReporter for Recording {
        fn phase(&self, name: &str) {
            self.0.lock().unwrap().push(name.to_string());
        }
        fn item_processed(&self, _current: usize, _total: usize) {}
        fn done(&self, _report: &RunReport) {
            self.0.lock().unwrap().push("done".into());
        }
    }

    #[tokio::test]
    async fn three_run_scenario() {
        let (source, target) = stores();
        source.update(vec![task("k1", 1), task("k2", 2)], &[]).await.unwrap();
        let builder = map_builder(&source, &target, Projection::default());
        let opts = RunOptions::default();

        // Run 1: both keys are new.
        assert_eq!(builder.stale_keys().await.unwrap(), vec![Key::from("k1"), Key::from("k2")]);
        let before = Utc::now();
        let first = run(&builder, &opts, &SilentProgress).await.unwrap();
        assert_eq!(first.loaded, 2);
        let built = target.query(&Criteria::All, &[]).await.unwrap();
        assert_eq!(built.len(), 2);
        for doc in &built {
            let bt = doc.last_updated(matbuild_shared::BUILD_TIME_FIELD).unwrap();
            assert!(bt >= before);
        }

        // Run 2: nothing changed.
        assert!(builder.stale_keys().await.unwrap().is_empty());
        let second = run(&builder, &opts, &SilentProgress).await.unwrap();
        assert_eq!(second.discovered, 0);
        assert_eq!(second.loaded, 0);

        // Run 3: only k1 moved forward.
        source.update(vec![task("k1", 3)], &[]).await.unwrap();
        assert_eq!(builder.stale_keys().await.unwrap(), vec![Key::from("k1")]);
        let third = run(&builder, &opts, &SilentProgress).await.unwrap();
        assert_eq!(third.loaded, 1);
    }

    #[tokio::test]
    async fn rerun_leaves_target_unchanged() {
        let (source, target) = stores();
        source
            .update(vec![task("a", 1), task("b", 1), task("c", 1)], &[])
            .await
            .unwrap();
        let builder = map_builder(&source, &target, Projection::default());
        run(&builder, &RunOptions::default(), &SilentProgress).await.unwrap();
        let snapshot = target.query(&Criteria::All, &[]).await.unwrap();

        run(&builder, &RunOptions::default(), &SilentProgress).await.unwrap();
        assert_eq!(target.query(&Criteria::All, &[]).await.unwrap(), snapshot);
    }

    #[tokio::test]
    async fn failing_item_is_isolated() {
        let (source, target) = stores();
        source
            .update(vec![task("a", 1), task("b", 1), task("c", 1)], &[])
            .await
            .unwrap();
        let builder = map_builder(&source, &target, FailOn("b")).with_batch_size(10);

        let report = run(&builder, &RunOptions::default(), &SilentProgress).await.unwrap();
        assert_eq!(report.discovered, 3);
        assert_eq!(report.transformed, 2);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.failed_items, vec!["b".to_string()]);
        assert_eq!(report.loaded, 2);
        assert_eq!(report.batches, 1);

        // The dropped key is still stale next time.
        assert_eq!(builder.stale_keys().await.unwrap(), vec![Key::from("b")]);
    }

    #[tokio::test]
    async fn cancelled_run_loads_nothing_in_flight() {
        let (source, target) = stores();
        source.update(vec![task("a", 1), task("b", 1)], &[]).await.unwrap();
        let builder = map_builder(&source, &target, Projection::default());
        let opts = RunOptions::default();
        opts.cancel.cancel();

        let report = run(&builder, &opts, &SilentProgress).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.loaded, 0);
        assert_eq!(target.count(&Criteria::All).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn load_failure_keeps_earlier_batches() {
        let (source, target) = stores();
        source
            .update(
                vec![
                    task("a", 1),
                    task("b", 1),
                    Record::from_value(json!({"task_id": "c", "formula": "X", "last_updated": 1})).unwrap(),
                    Record::from_value(json!({"task_id": "d", "formula": "X", "last_updated": 1})).unwrap(),
                ],
                &[],
            )
            .await
            .unwrap();
        target.ensure_index("formula", true).await.unwrap();
        let builder = map_builder(&source, &target, Projection::default());

        let err = run(&builder, &RunOptions::default(), &SilentProgress).await.unwrap_err();
        assert!(matches!(err, MatbuildError::LoadConflict { .. }));
        // First batch (a, b) committed; second batch rejected whole.
        assert_eq!(target.count(&Criteria::All).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn store_outage_aborts_run() {
        let (source, target) = stores();
        source.update(vec![task("a", 1)], &[]).await.unwrap();
        source.set_offline(true);
        let builder = map_builder(&source, &target, Projection::default());
        let err = run(&builder, &RunOptions::default(), &SilentProgress).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn progress_sees_every_phase() {
        let (source, target) = stores();
        source.update(vec![task("a", 1)], &[]).await.unwrap();
        let builder = map_builder(&source, &target, Projection::default());
        let progress = Recording::default();
        run(&builder, &RunOptions::default(), &progress).await.unwrap();
        let phases = progress.0.lock().unwrap().clone();
        assert_eq!(phases.first().map(String::as_str), Some("Preparing indexes"));
        assert_eq!(phases.last().map(String::as_str), Some("done"));
    }

    #[tokio::test]
    async fn chunked_run_covers_every_key_once() {
        let (source, target) = stores();
        let docs: Vec<Record> = (1..=10).map(|i| task(&format!("k{i}"), i)).collect();
        source.update(docs, &[]).await.unwrap();
        let builder = map_builder(&source, &target, Projection::default());

        let report = run_chunked(&builder, 3, 2, &RunOptions::default()).await.unwrap();
        assert!(report.failed.is_empty());
        let mut sizes: Vec<usize> = report.chunks.iter().map(|r| r.discovered).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![2, 4, 4]);
        assert_eq!(report.loaded(), 10);
        assert_eq!(target.count(&Criteria::All).await.unwrap(), 10);
        assert!(builder.stale_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_exhaustive_builder_skips_missing_targets() {
        let (source, target) = stores();
        source.update(vec![task("a", 5), task("b", 5)], &[]).await.unwrap();
        target.update(vec![task("a", 1)], &[]).await.unwrap();
        let builder = map_builder(&source, &target, Projection::default())
            .with_staleness(StalenessIndex::per_key(false));

        let report = run(&builder, &RunOptions::default(), &SilentProgress).await.unwrap();
        assert_eq!(report.discovered, 1);
        let store: &dyn Store = target.as_ref();
        assert!(store.query_one(&Criteria::equals("task_id", "b"), &[]).await.unwrap().is_none());
    }
}

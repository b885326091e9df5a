//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Value, json};
use tracing::{info, warn};

use matbuild_core::{
    Builder, CancelFlag, ChunkPlan, ProgressReporter, RunOptions, RunReport, run, run_chunked,
};
use matbuild_shared::{
    AppConfig, BuilderKind, Record, init_config, load_config, load_config_from,
};

use crate::registry::Registry;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// matbuild: incremental builds of derived document collections.
#[derive(Parser)]
#[command(
    name = "matbuild",
    version,
    about = "Rebuild derived collections from the source records that changed.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.matbuild/matbuild.toml).
    #[arg(long, env = "MATBUILD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Build everything that is stale for one builder.
    Run {
        /// Builder name from the config.
        #[arg(long, short)]
        builder: String,

        /// Split the work into this many chunks (defaults to `defaults.chunks`).
        #[arg(long)]
        chunks: Option<usize>,

        /// Only process this chunk (0-based); for external schedulers.
        #[arg(long, requires = "chunks")]
        chunk_index: Option<usize>,

        /// Chunks processed at the same time (defaults to `defaults.workers`).
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Print the keys a builder would rebuild.
    Stale {
        #[arg(long, short)]
        builder: String,
    },

    /// Print the chunk plan for a builder as JSON.
    Plan {
        #[arg(long, short)]
        builder: String,

        #[arg(long)]
        chunks: usize,
    },

    /// Load records into a store from a JSON array or JSON-lines file.
    Import {
        /// Store name from the config.
        #[arg(long, short)]
        store: String,

        /// Input file.
        file: PathBuf,
    },

    /// List configured stores and builders.
    List,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

/// What to do with an assembled builder.
enum Action {
    Run {
        chunks: usize,
        chunk_index: Option<usize>,
        workers: usize,
    },
    Stale,
    Plan {
        chunks: usize,
    },
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "matbuild=info",
        1 => "matbuild=debug",
        _ => "matbuild=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone();
    match cli.command {
        Command::Run {
            builder,
            chunks,
            chunk_index,
            workers,
        } => {
            let config = resolve_config(config_path.as_deref())?;
            let action = Action::Run {
                chunks: chunks.unwrap_or(config.defaults.chunks),
                chunk_index,
                workers: workers.unwrap_or(config.defaults.workers),
            };
            cmd_builder(&config, &builder, action).await
        }
        Command::Stale { builder } => {
            let config = resolve_config(config_path.as_deref())?;
            cmd_builder(&config, &builder, Action::Stale).await
        }
        Command::Plan { builder, chunks } => {
            let config = resolve_config(config_path.as_deref())?;
            cmd_builder(&config, &builder, Action::Plan { chunks }).await
        }
        Command::Import { store, file } => {
            let config = resolve_config(config_path.as_deref())?;
            cmd_import(&config, &store, &file).await
        }
        Command::List => {
            let config = resolve_config(config_path.as_deref())?;
            cmd_list(&config).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path.as_deref()).await,
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    })
}

/// Assemble the named builder and hand it to `dispatch`.
async fn cmd_builder(config: &AppConfig, name: &str, action: Action) -> Result<()> {
    let spec = config.builder(name)?;
    let registry = Registry::open(config).await?;
    let target = spec.target.as_str();

    match spec.kind {
        BuilderKind::Map => dispatch(registry.map_builder(spec)?, action, &registry, target).await,
        BuilderKind::Group => {
            dispatch(registry.group_builder(spec)?, action, &registry, target).await
        }
        BuilderKind::Summary => {
            dispatch(registry.summary_builder(spec)?, action, &registry, target).await
        }
    }
}

async fn dispatch<B>(builder: B, action: Action, registry: &Registry, target: &str) -> Result<()>
where
    B: Builder + 'static,
{
    match action {
        Action::Stale => {
            let keys = builder.stale_keys().await?;
            info!(builder = builder.name(), stale = keys.len(), "stale keys computed");
            for key in &keys {
                println!("{key}");
            }
            eprintln!("{} stale", keys.len());
            Ok(())
        }
        Action::Plan { chunks } => {
            let plan = builder.prechunk(chunks).await?;
            println!("{}", serde_json::to_string_pretty(&plan_summary(&plan))?);
            Ok(())
        }
        Action::Run {
            chunks,
            chunk_index,
            workers,
        } => {
            let options = RunOptions {
                cancel: cancel_on_ctrl_c(),
            };

            let reports = match chunk_index {
                Some(index) => {
                    let plan = builder.prechunk(chunks).await?;
                    let worker = builder.restrict(plan.select(index)?);
                    let reporter = CliProgress::new();
                    vec![run(&worker, &options, &reporter).await?]
                }
                None if chunks > 1 => {
                    let report = run_chunked(&builder, chunks, workers, &options).await?;
                    for (index, error) in &report.failed {
                        eprintln!("  chunk {index} failed: {error}");
                    }
                    if !report.failed.is_empty() {
                        return Err(eyre!(
                            "{} of {} chunks failed",
                            report.failed.len(),
                            report.failed.len() + report.chunks.len()
                        ));
                    }
                    report.chunks
                }
                None => {
                    let reporter = CliProgress::new();
                    vec![run(&builder, &options, &reporter).await?]
                }
            };

            for report in &reports {
                print_report(report);
                if let Some(log) = registry.run_log(target) {
                    let stats = serde_json::to_string(report)?;
                    if let Err(e) = log.record_run(&report.run_id, builder.name(), &stats).await {
                        warn!(error = %e, "failed to record run");
                    }
                }
            }
            Ok(())
        }
    }
}

/// Cancel the build on the first Ctrl-C; the in-flight batch is discarded.
fn cancel_on_ctrl_c() -> CancelFlag {
    let flag = CancelFlag::new();
    let handle = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling after the current item");
            handle.cancel();
        }
    });
    flag
}

fn plan_summary(plan: &ChunkPlan) -> Value {
    let chunks: Vec<Value> = plan
        .chunks
        .iter()
        .map(|c| {
            json!({
                "index": c.index,
                "total": c.total,
                "size": c.len(),
                "first": c.keys.first().map(|k| k.to_value()),
                "last": c.keys.last().map(|k| k.to_value()),
                "fingerprint": c.fingerprint,
            })
        })
        .collect();
    json!({ "chunks": chunks, "sizes": plan.sizes() })
}

fn print_report(report: &RunReport) {
    println!();
    println!("  Build {}", if report.cancelled { "cancelled" } else { "complete" });
    println!("  Builder:     {}", report.builder);
    println!("  Run:         {}", report.run_id);
    println!("  Discovered:  {}", report.discovered);
    println!("  Transformed: {}", report.transformed);
    println!("  Skipped:     {}", report.skipped);
    println!("  Dropped:     {}", report.dropped);
    println!("  Loaded:      {}", report.loaded);
    println!("  Batches:     {}", report.batches);
    println!("  Time:        {:.1}s", report.elapsed_ms as f64 / 1000.0);
    for item in &report.failed_items {
        println!("    dropped: {item}");
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn item_processed(&self, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Building [{current}/{total}]"));
    }

    fn done(&self, _report: &RunReport) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// Store commands
// ---------------------------------------------------------------------------

async fn cmd_import(config: &AppConfig, store_name: &str, file: &Path) -> Result<()> {
    let registry = Registry::open(config).await?;
    let store = registry.store(store_name)?;
    let content = std::fs::read_to_string(file)
        .map_err(|e| eyre!("cannot read '{}': {e}", file.display()))?;

    let values: Vec<Value> = if content.trim_start().starts_with('[') {
        serde_json::from_str(&content)?
    } else {
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?
    };

    // Records without a timestamp are stamped now so they count as changed.
    let now = Utc::now();
    let lu_field = store.last_updated_field().to_string();
    let mut records = Vec::with_capacity(values.len());
    for value in values {
        let mut record = Record::from_value(value)?;
        if record.last_updated(&lu_field).is_none() {
            record.set_last_updated(&lu_field, now);
        }
        records.push(record);
    }

    let total = records.len();
    let mut written = 0;
    let batch_size = config.defaults.batch_size.max(1);
    while !records.is_empty() {
        let rest = records.split_off(batch_size.min(records.len()));
        written += store.update(records, &[]).await?;
        records = rest;
    }

    info!(store = store_name, total, written, "import complete");
    println!("Imported {written} records into '{store_name}'");
    Ok(())
}

async fn cmd_list(config: &AppConfig) -> Result<()> {
    if config.stores.is_empty() && config.builders.is_empty() {
        println!("No stores or builders configured. Run `matbuild config init` to start.");
        return Ok(());
    }

    println!("Stores:");
    for store in &config.stores {
        println!(
            "  {:<20} {:<8} key={:<16} {}",
            store.name,
            format!("{:?}", store.backend).to_lowercase(),
            store.key,
            store.path.as_deref().unwrap_or("-"),
        );
    }

    let registry = Registry::open(config).await?;
    println!();
    println!("Builders:");
    for builder in &config.builders {
        let last = match registry.run_log(&builder.target) {
            Some(log) => log
                .list_runs(&builder.name, 1)
                .await?
                .into_iter()
                .next()
                .map(|r| r.started_at)
                .unwrap_or_else(|| "never".to_string()),
            None => "-".to_string(),
        };
        println!(
            "  {:<20} {:<8} {} -> {}  last run: {last}",
            builder.name,
            format!("{:?}", builder.kind).to_lowercase(),
            builder.source,
            builder.target,
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Config commands
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_with_chunks() {
        let cli = Cli::try_parse_from([
            "matbuild", "run", "--builder", "materials", "--chunks", "4", "--chunk-index", "2",
        ])
        .unwrap();
        match cli.command {
            Command::Run {
                builder,
                chunks,
                chunk_index,
                workers,
            } => {
                assert_eq!(builder, "materials");
                assert_eq!(chunks, Some(4));
                assert_eq!(chunk_index, Some(2));
                assert_eq!(workers, None);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn chunk_index_requires_chunks() {
        assert!(Cli::try_parse_from(["matbuild", "run", "-b", "m", "--chunk-index", "1"]).is_err());
    }

    #[test]
    fn plan_summary_lists_sizes() {
        let keys: Vec<matbuild_shared::Key> = (1..=10i64).map(matbuild_shared::Key::from).collect();
        let plan = matbuild_core::ChunkPlanner::plan(&keys, 3, "task_id").unwrap();
        let summary = plan_summary(&plan);
        assert_eq!(summary["sizes"], json!([4, 4, 2]));
        assert_eq!(summary["chunks"][2]["first"], json!(9));
    }
}

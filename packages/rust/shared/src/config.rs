//! Application configuration for matbuild.
//!
//! User config lives at `~/.matbuild/matbuild.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::criteria::Criteria;
use crate::error::{MatbuildError, Result};
use crate::settings::BuildSettings;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "matbuild.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".matbuild";

// ---------------------------------------------------------------------------
// Config structs (matching matbuild.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Settings handed to every transform.
    #[serde(default)]
    pub settings: BuildSettings,

    /// Declared document stores.
    #[serde(default)]
    pub stores: Vec<StoreConfig>,

    /// Declared builders.
    #[serde(default)]
    pub builders: Vec<BuilderConfig>,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Keys fetched and loaded per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum chunks executed concurrently by `run --chunks`.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Default chunk count for distributed runs.
    #[serde(default = "default_chunks")]
    pub chunks: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            workers: default_workers(),
            chunks: default_chunks(),
        }
    }
}

fn default_batch_size() -> usize {
    500
}
fn default_workers() -> usize {
    4
}
fn default_chunks() -> usize {
    1
}

/// Storage backend for a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process-local, lost on exit.
    Memory,
    /// Embedded libSQL database file.
    #[default]
    Sqlite,
}

/// `[[stores]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Name referenced by builders.
    pub name: String,

    #[serde(default)]
    pub backend: StoreBackend,

    /// Database path (sqlite backend).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Collection name inside the database (defaults to `name`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,

    /// Identity field.
    pub key: String,

    /// Staleness timestamp field.
    #[serde(default = "default_last_updated_field")]
    pub last_updated_field: String,
}

fn default_last_updated_field() -> String {
    "last_updated".into()
}

impl StoreConfig {
    pub fn collection_name(&self) -> &str {
        self.collection.as_deref().unwrap_or(&self.name)
    }
}

/// Kind of stock builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuilderKind {
    /// One target record per source record.
    Map,
    /// Source records grouped by a field, clustered into equivalence classes.
    Group,
    /// One summary record per key assembled from property stores.
    Summary,
}

/// How staleness is decided for a builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StalenessConfig {
    /// Compare LastUpdated key by key.
    PerKey {
        /// Target field holding the source key (defaults to the target key).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_field: Option<String>,
    },
    /// Invalidate whole groups: `max(source) > min(target)` per group value.
    WholeGroup {
        source_field: String,
        target_field: String,
    },
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self::PerKey { target_field: None }
    }
}

/// Whether a property kind contributes one document or a list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyMode {
    #[default]
    Single,
    List,
}

/// `[[builders.properties]]` entry for summary builders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyConfig {
    /// Property kind; becomes the field name in the summary record.
    pub kind: String,
    /// Store holding documents of this kind.
    pub store: String,
    #[serde(default)]
    pub mode: PropertyMode,
    /// Extra filter applied when fetching this kind.
    #[serde(default, skip_serializing_if = "Criteria::is_all")]
    pub filter: Criteria,
    /// Fields copied from each document (all fields when empty).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

/// `[[builders]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    pub name: String,
    pub kind: BuilderKind,
    /// Driving source store.
    pub source: String,
    /// Target store.
    pub target: String,

    /// Extra stores whose timestamps count toward staleness.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_sources: Vec<String>,

    /// Filter on the driving source.
    #[serde(default, skip_serializing_if = "Criteria::is_all")]
    pub query: Criteria,

    /// Also build keys that are missing from the target entirely.
    #[serde(default = "default_true")]
    pub exhaustive: bool,

    #[serde(default)]
    pub staleness: StalenessConfig,

    /// Map builders: fields copied to the target (all when empty).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,

    /// Group builders: field whose value defines a group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_field: Option<String>,

    /// Group builders: numeric fields compared within tolerance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compare_fields: Vec<String>,

    /// Group builders: field ranked by `settings.quality_scores`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_field: Option<String>,

    /// Summary builders: property kinds to assemble.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<PropertyConfig>,

    /// Map builders: remove target records whose source disappeared.
    #[serde(default)]
    pub delete_orphans: bool,

    /// Overrides `defaults.batch_size`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Look up a store by name.
    pub fn store(&self, name: &str) -> Result<&StoreConfig> {
        self.stores
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| MatbuildError::config(format!("unknown store '{name}'")))
    }

    /// Look up a builder by name.
    pub fn builder(&self, name: &str) -> Result<&BuilderConfig> {
        self.builders
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| MatbuildError::config(format!("unknown builder '{name}'")))
    }

    /// Cross-check names and per-kind requirements.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for store in &self.stores {
            if !seen.insert(store.name.as_str()) {
                return Err(MatbuildError::config(format!("duplicate store '{}'", store.name)));
            }
            if store.backend == StoreBackend::Sqlite && store.path.is_none() {
                return Err(MatbuildError::config(format!(
                    "store '{}' uses the sqlite backend but has no path",
                    store.name
                )));
            }
        }

        let mut seen = HashSet::new();
        for builder in &self.builders {
            if !seen.insert(builder.name.as_str()) {
                return Err(MatbuildError::config(format!(
                    "duplicate builder '{}'",
                    builder.name
                )));
            }
            self.store(&builder.source)?;
            self.store(&builder.target)?;
            for extra in &builder.extra_sources {
                self.store(extra)?;
            }
            builder.query.validate().map_err(|e| {
                MatbuildError::config(format!("builder '{}': {e}", builder.name))
            })?;

            match builder.kind {
                BuilderKind::Map => {}
                BuilderKind::Group if builder.group_field.is_none() => {
                    return Err(MatbuildError::config(format!(
                        "group builder '{}' needs group_field",
                        builder.name
                    )));
                }
                BuilderKind::Group => {}
                BuilderKind::Summary => {
                    if builder.properties.is_empty() {
                        return Err(MatbuildError::config(format!(
                            "summary builder '{}' needs at least one property",
                            builder.name
                        )));
                    }
                    for prop in &builder.properties {
                        self.store(&prop.store)?;
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.matbuild/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| MatbuildError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.matbuild/matbuild.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load and validate the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| MatbuildError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        MatbuildError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| MatbuildError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| MatbuildError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| MatbuildError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[defaults]
batch_size = 100

[settings.tolerances]
energy_per_atom = 0.001

[[stores]]
name = "tasks"
path = "var/matbuild.db"
key = "task_id"

[[stores]]
name = "materials"
path = "var/matbuild.db"
key = "material_id"

[[stores]]
name = "scratch"
backend = "memory"
key = "id"

[[builders]]
name = "materials"
kind = "group"
source = "tasks"
target = "materials"
group_field = "formula"
compare_fields = ["energy_per_atom"]

[builders.staleness]
mode = "whole_group"
source_field = "formula"
target_field = "formula"

[builders.query.eq]
field = "state"
value = "successful"
"#;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("batch_size"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.defaults.batch_size, 500);
        assert_eq!(parsed.defaults.workers, 4);
    }

    #[test]
    fn sample_config_parses_and_validates() {
        let config: AppConfig = toml::from_str(SAMPLE).expect("parse");
        config.validate().expect("valid");

        assert_eq!(config.defaults.batch_size, 100);
        assert_eq!(config.stores.len(), 3);
        assert_eq!(config.store("scratch").unwrap().backend, StoreBackend::Memory);
        assert_eq!(config.store("tasks").unwrap().last_updated_field, "last_updated");

        let builder = config.builder("materials").unwrap();
        assert_eq!(builder.kind, BuilderKind::Group);
        assert!(builder.exhaustive);
        assert_eq!(builder.query, Criteria::equals("state", "successful"));
        assert_eq!(
            builder.staleness,
            StalenessConfig::WholeGroup {
                source_field: "formula".into(),
                target_field: "formula".into()
            }
        );
        assert_eq!(config.settings.tolerance("energy_per_atom"), 0.001);
    }

    #[test]
    fn unknown_store_is_rejected() {
        let mut config: AppConfig = toml::from_str(SAMPLE).expect("parse");
        config.builders[0].target = "nope".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown store 'nope'"));
    }

    #[test]
    fn group_builder_requires_group_field() {
        let mut config: AppConfig = toml::from_str(SAMPLE).expect("parse");
        config.builders[0].group_field = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn sqlite_store_requires_path() {
        let mut config: AppConfig = toml::from_str(SAMPLE).expect("parse");
        config.stores[0].path = None;
        assert!(config.validate().unwrap_err().to_string().contains("no path"));
    }
}

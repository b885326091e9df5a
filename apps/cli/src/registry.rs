//! Opens configured stores and assembles builders from `[[builders]]` entries.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use color_eyre::eyre::{Result, eyre};
use tracing::{debug, warn};

use matbuild_core::builders::{
    EquivalenceClassTransform, GroupBuilder, MapBuilder, Projection, PropertyMap, PropertySpec,
    SummaryBuilder,
};
use matbuild_core::{StalenessIndex, StalenessMode};
use matbuild_shared::{AppConfig, BuildSettings, BuilderConfig, StalenessConfig, StoreBackend};
use matbuild_storage::{MemoryStore, SqliteStore, Store};

/// Every configured store, opened once per command.
pub(crate) struct Registry {
    stores: HashMap<String, Arc<dyn Store>>,
    /// Stores backed by libSQL; these also carry the run log.
    sqlite: HashMap<String, Arc<SqliteStore>>,
    settings: Arc<BuildSettings>,
    batch_size: usize,
}

impl Registry {
    pub(crate) async fn open(config: &AppConfig) -> Result<Self> {
        let mut stores: HashMap<String, Arc<dyn Store>> = HashMap::new();
        let mut sqlite = HashMap::new();

        for spec in &config.stores {
            match spec.backend {
                StoreBackend::Memory => {
                    let store = MemoryStore::new(&spec.name, &spec.key)
                        .with_last_updated_field(&spec.last_updated_field);
                    stores.insert(spec.name.clone(), Arc::new(store));
                }
                StoreBackend::Sqlite => {
                    let path = spec
                        .path
                        .as_deref()
                        .ok_or_else(|| eyre!("store '{}' has no path", spec.name))?;
                    let store = SqliteStore::open(
                        Path::new(path),
                        spec.collection_name(),
                        &spec.key,
                        &spec.last_updated_field,
                    )
                    .await?
                    .with_name(&spec.name);
                    let store = Arc::new(store);
                    stores.insert(spec.name.clone(), store.clone());
                    sqlite.insert(spec.name.clone(), store);
                }
            }
            debug!(store = %spec.name, backend = ?spec.backend, "store opened");
        }

        Ok(Self {
            stores,
            sqlite,
            settings: Arc::new(config.settings.clone()),
            batch_size: config.defaults.batch_size,
        })
    }

    pub(crate) fn store(&self, name: &str) -> Result<Arc<dyn Store>> {
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| eyre!("unknown store '{name}'"))
    }

    /// The libSQL store backing `name`, if any.
    pub(crate) fn run_log(&self, name: &str) -> Option<&Arc<SqliteStore>> {
        self.sqlite.get(name)
    }

    fn batch_size(&self, spec: &BuilderConfig) -> usize {
        spec.batch_size.unwrap_or(self.batch_size)
    }

    fn staleness(spec: &BuilderConfig) -> StalenessIndex {
        StalenessIndex::new(StalenessMode::from(&spec.staleness), spec.exhaustive)
    }

    pub(crate) fn map_builder(&self, spec: &BuilderConfig) -> Result<MapBuilder<Projection>> {
        let extra = spec
            .extra_sources
            .iter()
            .map(|name| self.store(name))
            .collect::<Result<Vec<_>>>()?;

        Ok(MapBuilder::new(
            &spec.name,
            self.store(&spec.source)?,
            self.store(&spec.target)?,
            Projection::new(spec.fields.clone()),
            self.settings.clone(),
        )
        .with_query(spec.query.clone())
        .with_extra_sources(extra)
        .with_staleness(Self::staleness(spec))
        .with_batch_size(self.batch_size(spec))
        .with_delete_orphans(spec.delete_orphans))
    }

    pub(crate) fn group_builder(
        &self,
        spec: &BuilderConfig,
    ) -> Result<GroupBuilder<EquivalenceClassTransform>> {
        let group_field = spec
            .group_field
            .clone()
            .ok_or_else(|| eyre!("group builder '{}' needs group_field", spec.name))?;
        let source = self.store(&spec.source)?;
        let target = self.store(&spec.target)?;
        if !spec.extra_sources.is_empty() {
            warn!(builder = %spec.name, "extra_sources are ignored by group builders");
        }

        let transform = EquivalenceClassTransform {
            source_key: source.key().to_string(),
            target_key: target.key().to_string(),
            compare_fields: spec.compare_fields.clone(),
            quality_field: spec.quality_field.clone(),
        };

        let mut builder = GroupBuilder::new(
            &spec.name,
            source,
            target,
            group_field.clone(),
            transform,
            self.settings.clone(),
        )
        .with_query(spec.query.clone())
        .with_batch_size(self.batch_size(spec));

        // Unqualified per-key mode means "the group's own field" here.
        builder = match &spec.staleness {
            StalenessConfig::PerKey { target_field: None } => builder.with_staleness(
                StalenessIndex::new(
                    StalenessMode::WholeGroup {
                        source_field: group_field.clone(),
                        target_field: group_field,
                    },
                    spec.exhaustive,
                ),
            ),
            _ => builder.with_staleness(Self::staleness(spec)),
        };
        Ok(builder)
    }

    pub(crate) fn summary_builder(&self, spec: &BuilderConfig) -> Result<SummaryBuilder> {
        let mut properties = PropertyMap::new();
        for prop in &spec.properties {
            let entry = PropertySpec {
                store: self.store(&prop.store)?,
                mode: prop.mode,
                filter: prop.filter.clone(),
                fields: prop.fields.clone(),
            };
            if properties.insert(prop.kind.clone(), entry).is_some() {
                return Err(eyre!(
                    "summary builder '{}' lists property '{}' twice",
                    spec.name,
                    prop.kind
                ));
            }
        }

        Ok(SummaryBuilder::new(
            &spec.name,
            self.store(&spec.source)?,
            self.store(&spec.target)?,
            properties,
            self.settings.clone(),
        )
        .with_fields(spec.fields.clone())
        .with_query(spec.query.clone())
        .with_staleness(Self::staleness(spec))
        .with_batch_size(self.batch_size(spec)))
    }
}

//! Shared types, error model, and configuration for matbuild.
//!
//! This crate is the foundation depended on by all other matbuild crates.
//! It provides:
//! - [`MatbuildError`]: the unified error type
//! - Data model ([`Key`], [`Record`], [`Criteria`])
//! - Configuration ([`AppConfig`], [`BuildSettings`], config loading)

pub mod config;
pub mod criteria;
pub mod error;
pub mod settings;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BuilderConfig, BuilderKind, DefaultsConfig, PropertyConfig, PropertyMode,
    StalenessConfig, StoreBackend, StoreConfig, config_dir, config_file_path, init_config,
    load_config, load_config_from,
};
pub use criteria::Criteria;
pub use error::{MatbuildError, Result};
pub use settings::BuildSettings;
pub use types::{
    BUILD_TIME_FIELD, Key, Record, compare_values, parse_timestamp, timestamp_value, values_equal,
};

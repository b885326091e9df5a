//! Error types for matbuild.
//!
//! Library crates use [`MatbuildError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all matbuild operations.
#[derive(Debug, thiserror::Error)]
pub enum MatbuildError {
    /// Transient connectivity or timeout failure during a Store call.
    /// Never retried internally; the caller decides.
    #[error("store unavailable ({store}): {message}")]
    StoreUnavailable { store: String, message: String },

    /// A single item's transform failed. Recovered by the pipeline.
    #[error("transform failed for item {item}: {message}")]
    ItemTransform { item: String, message: String },

    /// The target Store rejected a batch write (constraint violation, etc.).
    #[error("load conflict ({store}): {message}")]
    LoadConflict { store: String, message: String },

    /// Invalid arguments handed to the chunk planner.
    #[error("chunk planning error: {message}")]
    ChunkPlanning { message: String },

    /// A chunk worker could not run (no worker slot, task aborted).
    #[error("chunk {chunk} worker error: {message}")]
    ChunkWorker { chunk: usize, message: String },

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Non-transient storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Data validation error (bad key, malformed record, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, MatbuildError>;

impl MatbuildError {
    /// Create a store-unavailable error for the named store.
    pub fn unavailable(store: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            store: store.into(),
            message: msg.into(),
        }
    }

    /// Create a per-item transform error.
    pub fn transform(item: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ItemTransform {
            item: item.into(),
            message: msg.into(),
        }
    }

    /// Create a load conflict for the named store.
    pub fn conflict(store: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::LoadConflict {
            store: store.into(),
            message: msg.into(),
        }
    }

    /// Create a chunk planning error from any displayable message.
    pub fn chunk_planning(msg: impl Into<String>) -> Self {
        Self::ChunkPlanning {
            message: msg.into(),
        }
    }

    /// Create a worker error for the chunk at `chunk`.
    pub fn chunk_worker(chunk: usize, msg: impl Into<String>) -> Self {
        Self::ChunkWorker {
            chunk,
            message: msg.into(),
        }
    }

    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a caller-level retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }
}

impl From<serde_json::Error> for MatbuildError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

//! Incremental materialization engine for matbuild.
//!
//! This crate ties together staleness detection, chunk planning and the
//! Extract → Transform → Load contract into runnable builds (e.g., [`run`]).

pub mod builder;
pub mod builders;
pub mod chunking;
pub mod grouping;
pub mod load;
pub mod pipeline;
pub mod staleness;

pub use builder::{Builder, Extract, FetchBatch, ItemOutput};
pub use chunking::{Chunk, ChunkPlan, ChunkPlanner};
pub use grouping::{group, group_into_classes};
pub use load::{LoadMode, Loader};
pub use pipeline::{
    CancelFlag, DistributedReport, ProgressReporter, RunOptions, RunReport, SilentProgress, run,
    run_chunked,
};
pub use staleness::{StalenessIndex, StalenessMode};

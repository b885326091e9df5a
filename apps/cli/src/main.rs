//! matbuild CLI: incremental materialization of document collections.
//!
//! Finds source records that changed since the last build, transforms them,
//! and loads the results into target stores, optionally in parallel chunks.

mod commands;
mod registry;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run_cli(cli).await
}

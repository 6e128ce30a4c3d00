//! oerflow CLI — OER material preprocessing pipeline.
//!
//! Pulls raw material descriptors from a queue or file, runs them through
//! the preprocessing topology, and lands them in the local catalogs.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}

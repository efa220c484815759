//! Corral init entry point.

use clap::Parser;
use color_eyre::eyre::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use corral::cli::Cli;

fn main() -> Result<()> {
    color_eyre::install()?;

    // stdout belongs to commands run through `exec`.
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("corral=warn".parse()?))
        .init();

    Cli::parse().execute()
}

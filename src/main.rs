mod cli;
mod execute;

use clap::Parser;
use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use crate::cli::CLI;

/// Log level: `--debug` forces `forma=debug`, otherwise `RUST_LOG`, otherwise `forma=info`.
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("forma=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("forma=info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn main() -> Result<()> {
    let cli = CLI::parse();
    init_tracing(cli.debug);
    tracing::debug!("forma starting with args: {:?}", cli);
    execute::execute(cli)
}

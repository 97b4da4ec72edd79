mod cli;
mod commands;
mod config;
mod logging;

use anyhow::Result;
use clap::Parser;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);

    match cli.command {
        Command::Simulate(args) => commands::simulate::run(args).await,
        Command::Config(args) => commands::config::run(args),
    }
}

use anyhow::{Context, Result};
use tracing::info;

use crate::cli::ConfigArgs;
use crate::config::{default_config_path, load_workflow_config};

pub fn run(args: ConfigArgs) -> Result<()> {
    let source = args.config.clone().unwrap_or_else(default_config_path);
    let config = load_workflow_config(args.config.as_deref())?;
    info!(path = %source.display(), exists = source.exists(), "resolved workflow config");

    let json = serde_json::to_string_pretty(&config).context("failed to encode workflow config")?;
    println!("{json}");
    Ok(())
}

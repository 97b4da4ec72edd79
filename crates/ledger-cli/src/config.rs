use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ledger_connect::sim::SimulationScript;
use ledger_connect::WorkflowConfig;
use tracing::debug;

pub fn default_config_path() -> PathBuf {
    let home = env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".ledger-connect").join("workflow.json")
}

/// Loads the workflow config from `path`, or from the default location when it exists.
pub fn load_workflow_config(path: Option<&Path>) -> Result<WorkflowConfig> {
    let (path, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (default_config_path(), false),
    };
    if !path.exists() {
        if explicit {
            bail!("config file '{}' does not exist", path.display());
        }
        debug!(path = %path.display(), "no workflow config; using defaults");
        return Ok(WorkflowConfig::default());
    }
    read_json(&path).context("invalid workflow config")
}

pub fn load_script(path: &Path) -> Result<SimulationScript> {
    read_json(path).context("invalid simulation script")
}

pub fn apply_overrides(
    config: WorkflowConfig,
    restart_limit: Option<u32>,
    timeout_ms: Option<u64>,
) -> WorkflowConfig {
    let config = match restart_limit {
        Some(limit) => config.with_restart_limit(limit),
        None => config,
    };
    match timeout_ms {
        Some(0) => config.with_command_timeout(None),
        Some(ms) => config.with_command_timeout(Some(Duration::from_millis(ms))),
        None => config,
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse '{}'", path.display()))
}

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

pub const DEFAULT_DEVICE_ID: &str = "sim-ledger-nano-x";
pub const DEFAULT_MESSAGE: &str = "hello from ledger-cli";

#[derive(Parser, Debug)]
#[command(name = "ledger-cli")]
#[command(about = "Ledger Bluetooth connection workflow driver")]
pub struct Cli {
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one signing workflow against a simulated device.
    Simulate(SimulateArgs),
    /// Print the effective workflow configuration.
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[arg(long, default_value = DEFAULT_DEVICE_ID)]
    pub device_id: String,
    /// App running when the workflow starts (BOLOS is the dashboard).
    #[arg(long)]
    pub start_app: Option<String>,
    #[arg(long)]
    pub decline: bool,
    #[arg(long)]
    pub not_installed: bool,
    #[arg(long)]
    pub locked: bool,
    #[arg(long)]
    pub fail_close: bool,
    /// Launched apps immediately fall back to the dashboard.
    #[arg(long)]
    pub app_exits: bool,
    #[arg(long, value_name = "N")]
    pub refuse_connections: Option<u32>,
    #[arg(long, value_name = "N")]
    pub unstable_links: Option<u32>,
    /// JSON simulation script; flags given alongside it take precedence.
    #[arg(long, value_name = "FILE")]
    pub script: Option<PathBuf>,
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub restart_limit: Option<u32>,
    #[arg(long)]
    pub timeout_ms: Option<u64>,
    #[arg(long, default_value = DEFAULT_MESSAGE)]
    pub message: String,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

use std::time::Duration;

use anyhow::{bail, Context, Result};
use ledger_connect::apdu::CLA_APP;
use ledger_connect::commands::{send_apdu, ETHEREUM_APP_NAME};
use ledger_connect::sim::{SimEvent, SimulatedLedger, SimulationScript};
use ledger_connect::{ApduCommand, DashboardCommands, LedgerWorkflow, WorkflowStatus};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

use crate::cli::SimulateArgs;
use crate::config::{apply_overrides, load_script, load_workflow_config};

const INS_SIGN_PERSONAL_MESSAGE: u8 = 0x08;
const MAX_MESSAGE_LEN: usize = 255;
const SETTLE_TIMEOUT: Duration = Duration::from_secs(300);

struct Outcome {
    status: WorkflowStatus,
    signature: Option<Vec<u8>>,
    history: Vec<SimEvent>,
}

pub async fn run(args: SimulateArgs) -> Result<()> {
    println!(
        "Requesting personal-message signature from simulated Ledger '{}'...",
        args.device_id
    );
    let outcome = execute(args, print_status).await?;

    let connections = outcome
        .history
        .iter()
        .filter(|event| matches!(event, SimEvent::Connected))
        .count();
    println!("Connections opened: {connections}");

    match (outcome.status.error, outcome.signature) {
        (Some(kind), _) => {
            println!("Error: {} ({})", kind.message(), kind.code());
            bail!("workflow failed with {}", kind.code());
        }
        (None, Some(signature)) => {
            println!("Signature: 0x{}", hex::encode(signature));
            Ok(())
        }
        (None, None) => bail!("workflow finished without a signature"),
    }
}

async fn execute(
    args: SimulateArgs,
    mut on_status: impl FnMut(&WorkflowStatus),
) -> Result<Outcome> {
    let message = args.message.clone().into_bytes();
    if message.len() > MAX_MESSAGE_LEN {
        bail!(
            "--message is {} bytes; a single APDU carries at most {MAX_MESSAGE_LEN}",
            message.len()
        );
    }
    let config = load_workflow_config(args.config.as_deref())?;
    let config = apply_overrides(config, args.restart_limit, args.timeout_ms);
    let script = build_script(&args)?;
    info!(
        start_app = %script.start_app,
        restart_limit = config.restart_limit,
        "simulate command started"
    );

    let device = SimulatedLedger::new(args.device_id.clone(), script);
    let workflow = LedgerWorkflow::with_config(
        args.device_id,
        device.provider(),
        DashboardCommands::new(),
        config,
    );

    let (signature_tx, signature_rx) = oneshot::channel();
    workflow.run(move |transport| async move {
        let command = ApduCommand::new(CLA_APP, INS_SIGN_PERSONAL_MESSAGE).with_data(message);
        let signature = send_apdu(transport.as_ref(), &command).await?;
        let _ = signature_tx.send(signature);
        Ok(())
    });

    let mut status_rx = workflow.subscribe();
    let status = tokio::time::timeout(SETTLE_TIMEOUT, follow_status(&mut status_rx, &mut on_status))
        .await
        .context("workflow did not settle")??;

    let signature = match status.error {
        None => signature_rx.await.ok(),
        Some(_) => None,
    };
    let history = device.history();
    debug!(?history, "simulated device history");

    Ok(Outcome {
        status,
        signature,
        history,
    })
}

async fn follow_status(
    rx: &mut watch::Receiver<WorkflowStatus>,
    on_status: &mut impl FnMut(&WorkflowStatus),
) -> Result<WorkflowStatus> {
    let mut last = *rx.borrow_and_update();
    on_status(&last);
    while !last.is_idle() {
        rx.changed()
            .await
            .context("workflow status channel closed")?;
        let status = *rx.borrow_and_update();
        if status != last {
            on_status(&status);
        }
        last = status;
    }
    Ok(last)
}

fn build_script(args: &SimulateArgs) -> Result<SimulationScript> {
    let mut script = match &args.script {
        Some(path) => load_script(path)?,
        None => SimulationScript::default(),
    };
    if let Some(app) = &args.start_app {
        script.start_app = app.clone();
    }
    if args.decline {
        script.approve_app_launch = false;
    }
    if args.not_installed {
        script.installed_apps.retain(|app| app != ETHEREUM_APP_NAME);
    }
    if args.locked {
        script.locked = true;
    }
    if args.fail_close {
        script.fail_close = true;
    }
    if args.app_exits {
        script.app_exits_on_launch = true;
    }
    if let Some(count) = args.refuse_connections {
        script.refuse_connections = count;
    }
    if let Some(count) = args.unstable_links {
        script.unstable_links = count;
    }
    Ok(script)
}

fn print_status(status: &WorkflowStatus) {
    let mut line = format!(
        "  [{:?}] sending_commands={}",
        status.phase, status.is_sending_commands
    );
    if status.is_app_launch_confirmation_needed {
        line.push_str(" -> confirm opening the Ethereum app on your Ledger");
    }
    if let Some(kind) = status.error {
        line.push_str(&format!(" error={}", kind.code()));
    }
    println!("{line}");
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use ledger_connect::sim::fake_signature;
    use ledger_connect::{ErrorKind, WorkflowPhase};

    use super::*;
    use crate::cli::{Cli, Command};

    /// Parses `simulate` args with an empty config file so the user's own config stays out.
    fn simulate_args(extra: &[&str]) -> (tempfile::TempDir, SimulateArgs) {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("workflow.json");
        std::fs::write(&config, "{}").unwrap();

        let mut argv = vec!["ledger-cli", "simulate", "--config", config.to_str().unwrap()];
        argv.extend_from_slice(extra);
        let cli = Cli::parse_from(argv);
        let Command::Simulate(args) = cli.command else {
            panic!("expected simulate command");
        };
        (dir, args)
    }

    #[test]
    fn flags_override_defaults() {
        let (_dir, args) = simulate_args(&["--start-app", "Bitcoin", "--not-installed", "--decline"]);
        let script = build_script(&args).unwrap();

        assert_eq!(script.start_app, "Bitcoin");
        assert!(script.installed_apps.is_empty());
        assert!(!script.approve_app_launch);
        assert_eq!(script.refuse_connections, 0);
    }

    #[tokio::test]
    async fn dashboard_run_prompts_and_signs() {
        let (_dir, args) = simulate_args(&["--message", "gm"]);
        let mut seen = Vec::new();

        let outcome = execute(args, |status| seen.push(*status)).await.unwrap();

        assert_eq!(outcome.status.error, None);
        assert_eq!(outcome.signature, Some(fake_signature(b"gm")));
        assert_eq!(seen.first().map(|s| s.phase), Some(WorkflowPhase::Connecting));
        assert!(seen.last().is_some_and(WorkflowStatus::is_idle));
    }

    #[tokio::test]
    async fn locked_device_surfaces_error() {
        let (_dir, args) = simulate_args(&["--locked"]);

        let outcome = execute(args, |_| {}).await.unwrap();

        assert_eq!(outcome.status.error, Some(ErrorKind::LedgerIsLocked));
        assert_eq!(outcome.signature, None);
    }

    #[tokio::test]
    async fn oversized_message_is_rejected_up_front() {
        let long = "x".repeat(MAX_MESSAGE_LEN + 1);
        let (_dir, args) = simulate_args(&["--message", long.as_str()]);

        let err = execute(args, |_| {}).await.err().unwrap();
        assert!(err.to_string().contains("--message"));
    }
}

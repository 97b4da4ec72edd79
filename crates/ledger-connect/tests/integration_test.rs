use std::sync::Arc;
use std::time::Duration;

use ledger_connect::apdu::CLA_APP;
use ledger_connect::commands::send_apdu;
use ledger_connect::sim::{
    fake_signature, SimEvent, SimulatedLedger, SimulatedProvider, SimulationScript,
};
use ledger_connect::{
    ApduCommand, DashboardCommands, ErrorKind, LedgerWorkflow, RestartState, WorkflowStatus,
    RESTART_LIMIT,
};
use parking_lot::Mutex;

const DEVICE_ID: &str = "C4:7E:2B:10:9A:01";
const INS_SIGN: u8 = 0x08;

type SimWorkflow = LedgerWorkflow<SimulatedProvider, DashboardCommands>;

fn workflow_for(script: SimulationScript) -> (SimulatedLedger, SimWorkflow) {
    let device = SimulatedLedger::new(DEVICE_ID, script);
    let workflow = LedgerWorkflow::new(DEVICE_ID, device.provider(), DashboardCommands::new());
    (device, workflow)
}

/// Runs a signing request for `message` and returns the final status plus the signature.
async fn sign(workflow: &SimWorkflow, message: &[u8]) -> (WorkflowStatus, Option<Vec<u8>>) {
    let signature = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&signature);
    let payload = message.to_vec();
    workflow.run(move |transport| async move {
        let command = ApduCommand::new(CLA_APP, INS_SIGN).with_data(payload);
        let response = send_apdu(transport.as_ref(), &command).await?;
        *sink.lock() = Some(response);
        Ok(())
    });
    let status = tokio::time::timeout(Duration::from_secs(5), workflow.wait_idle())
        .await
        .expect("workflow should settle");
    let signature = signature.lock().take();
    (status, signature)
}

fn commands_seen(device: &SimulatedLedger) -> Vec<SimEvent> {
    device
        .history()
        .into_iter()
        .filter(|event| {
            !matches!(
                event,
                SimEvent::Connected | SimEvent::LinkDropped | SimEvent::ConnectionRefused
            )
        })
        .collect()
}

fn count(device: &SimulatedLedger, wanted: &SimEvent) -> usize {
    device.history().iter().filter(|e| *e == wanted).count()
}

#[tokio::test]
async fn signs_directly_when_ethereum_is_open() {
    let (device, workflow) = workflow_for(SimulationScript::running("Ethereum"));

    let (status, signature) = sign(&workflow, b"hello").await;

    assert_eq!(status.error, None);
    assert!(!status.is_sending_commands);
    assert_eq!(signature, Some(fake_signature(b"hello")));
    assert_eq!(
        commands_seen(&device),
        vec![SimEvent::GetAppAndVersion, SimEvent::AppCommand(INS_SIGN)]
    );
    assert!(!device.is_connected());
}

#[tokio::test]
async fn launches_ethereum_from_dashboard() {
    let (device, workflow) = workflow_for(SimulationScript::default());

    let (status, signature) = sign(&workflow, b"tx").await;

    assert_eq!(status.error, None);
    assert_eq!(signature, Some(fake_signature(b"tx")));
    assert_eq!(device.running_app(), "Ethereum");
    assert_eq!(
        commands_seen(&device),
        vec![
            SimEvent::GetAppAndVersion,
            SimEvent::OpenApp("Ethereum".into()),
            SimEvent::GetAppAndVersion,
            SimEvent::AppCommand(INS_SIGN),
        ]
    );
    assert_eq!(count(&device, &SimEvent::Connected), 2);
    assert_eq!(workflow.restart_state(), RestartState::default());
}

#[tokio::test]
async fn closes_third_party_app_then_launches_ethereum() {
    let (device, workflow) = workflow_for(SimulationScript::running("Bitcoin"));

    let (status, signature) = sign(&workflow, b"tx").await;

    assert_eq!(status.error, None);
    assert!(signature.is_some());
    assert_eq!(
        commands_seen(&device),
        vec![
            SimEvent::GetAppAndVersion,
            SimEvent::QuitApp,
            SimEvent::GetAppAndVersion,
            SimEvent::OpenApp("Ethereum".into()),
            SimEvent::GetAppAndVersion,
            SimEvent::AppCommand(INS_SIGN),
        ]
    );
}

#[tokio::test]
async fn missing_app_is_reported() {
    let (device, workflow) = workflow_for(SimulationScript {
        installed_apps: Vec::new(),
        ..SimulationScript::default()
    });

    let (status, signature) = sign(&workflow, b"tx").await;

    assert_eq!(status.error, Some(ErrorKind::AppIsNotInstalled));
    assert!(!status.is_app_launch_confirmation_needed);
    assert_eq!(signature, None);
    assert_eq!(count(&device, &SimEvent::AppCommand(INS_SIGN)), 0);
}

#[tokio::test]
async fn declined_launch_is_reported() {
    let (_device, workflow) = workflow_for(SimulationScript {
        approve_app_launch: false,
        ..SimulationScript::default()
    });

    let (status, signature) = sign(&workflow, b"tx").await;

    assert_eq!(status.error, Some(ErrorKind::UserRefusedConfirmation));
    assert_eq!(signature, None);
}

#[tokio::test]
async fn locked_device_is_reported_and_recovers_once_unlocked() {
    let (device, workflow) = workflow_for(SimulationScript {
        locked: true,
        ..SimulationScript::running("Ethereum")
    });

    let (status, _) = sign(&workflow, b"tx").await;
    assert_eq!(status.error, Some(ErrorKind::LedgerIsLocked));

    device.update_script(|script| script.locked = false);
    let (status, signature) = sign(&workflow, b"tx").await;
    assert_eq!(status.error, None);
    assert!(signature.is_some());
}

#[tokio::test]
async fn failing_quit_is_reported() {
    let (device, workflow) = workflow_for(SimulationScript {
        fail_close: true,
        ..SimulationScript::running("Bitcoin")
    });

    let (status, _) = sign(&workflow, b"tx").await;

    assert_eq!(status.error, Some(ErrorKind::FailedToCloseApp));
    assert_eq!(
        commands_seen(&device),
        vec![SimEvent::GetAppAndVersion, SimEvent::QuitApp]
    );
}

#[tokio::test]
async fn refused_connection_fails_then_next_run_succeeds() {
    let (device, workflow) = workflow_for(SimulationScript {
        refuse_connections: 1,
        ..SimulationScript::running("Ethereum")
    });

    let (status, _) = sign(&workflow, b"tx").await;
    assert_eq!(status.error, Some(ErrorKind::LedgerDisconnected));
    assert!(!status.is_sending_commands);
    assert_eq!(device.history(), vec![SimEvent::ConnectionRefused]);

    let (status, signature) = sign(&workflow, b"tx").await;
    assert_eq!(status.error, None);
    assert!(signature.is_some());
}

#[tokio::test]
async fn unstable_first_link_is_reported_as_disconnect() {
    let (_device, workflow) = workflow_for(SimulationScript {
        unstable_links: 1,
        ..SimulationScript::running("Ethereum")
    });

    let (status, signature) = sign(&workflow, b"tx").await;

    assert_eq!(status.error, Some(ErrorKind::LedgerDisconnected));
    assert_eq!(signature, None);
}

#[tokio::test]
async fn app_that_keeps_exiting_exhausts_restarts() {
    let (device, workflow) = workflow_for(SimulationScript {
        app_exits_on_launch: true,
        ..SimulationScript::default()
    });

    let (status, signature) = sign(&workflow, b"tx").await;

    assert_eq!(status.error, Some(ErrorKind::LedgerDisconnected));
    assert_eq!(signature, None);
    assert_eq!(
        count(&device, &SimEvent::OpenApp("Ethereum".into())),
        RESTART_LIMIT as usize + 1
    );
    assert_eq!(workflow.restart_state(), RestartState::default());
    assert!(workflow.pending_steps().is_empty());
}

#[tokio::test]
async fn link_lost_during_signing_is_reported() {
    let (device, workflow) = workflow_for(SimulationScript::running("Ethereum"));
    let remote = device.clone();

    workflow.run(move |transport| async move {
        remote.drop_link();
        let command = ApduCommand::new(CLA_APP, INS_SIGN).with_data(b"tx".to_vec());
        send_apdu(transport.as_ref(), &command).await?;
        Ok(())
    });
    let status = tokio::time::timeout(Duration::from_secs(5), workflow.wait_idle())
        .await
        .expect("workflow should settle");

    assert_eq!(status.error, Some(ErrorKind::LedgerDisconnected));
    assert_eq!(count(&device, &SimEvent::AppCommand(INS_SIGN)), 0);
}

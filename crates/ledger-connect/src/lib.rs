//! Ledger hardware-wallet connection workflow over Bluetooth.
//!
//! [`LedgerWorkflow`] opens a transport, brings the device to the Ethereum app
//! (closing other apps and launching Ethereum from the dashboard, reconnecting
//! each time the device drops the link) and then runs caller-supplied signing
//! work. Failures surface as an [`ErrorKind`] on the observable status.

pub mod apdu;
pub mod backend;
pub mod commands;
pub mod config;
pub mod error;
pub mod sim;
pub mod state;
pub mod steps;
pub mod workflow;

pub use apdu::{ApduAnswer, ApduCommand, StatusWord};
pub use backend::{
    BackendError, BackendResult, DeviceCommands, DisconnectSignal, LedgerTransport,
    TransportProvider,
};
pub use commands::{AppInfo, DashboardCommands, RunningApp};
pub use config::{WorkflowConfig, RESTART_LIMIT};
pub use error::{classify, CommandStage, ErrorKind};
pub use state::{WorkflowPhase, WorkflowStatus};
pub use steps::RestartState;
pub use workflow::LedgerWorkflow;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::apdu::StatusWord;
use crate::backend::BackendError;

/// User-facing failure categories surfaced through the workflow status.
///
/// Every kind is terminal for the `run` invocation that produced it; the
/// caller decides how to present it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum ErrorKind {
    #[error("Ledger disconnected")]
    LedgerDisconnected,
    #[error("failed to open the Ethereum app")]
    FailedToOpenApp,
    #[error("failed to close the running app")]
    FailedToCloseApp,
    #[error("user refused confirmation on the device")]
    UserRefusedConfirmation,
    #[error("Ethereum app is not installed")]
    AppIsNotInstalled,
    #[error("Ledger is locked")]
    LedgerIsLocked,
    #[error("unknown Ledger error")]
    #[serde(rename = "UnknownError")]
    Unknown,
}

impl ErrorKind {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::LedgerDisconnected => "LedgerDisconnected",
            Self::FailedToOpenApp => "FailedToOpenApp",
            Self::FailedToCloseApp => "FailedToCloseApp",
            Self::UserRefusedConfirmation => "UserRefusedConfirmation",
            Self::AppIsNotInstalled => "AppIsNotInstalled",
            Self::LedgerIsLocked => "LedgerIsLocked",
            Self::Unknown => "UnknownError",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::LedgerDisconnected => {
                "The connection to your Ledger was lost. Make sure it is nearby, unlocked and try again."
            }
            Self::FailedToOpenApp => "Could not open the Ethereum app on your Ledger.",
            Self::FailedToCloseApp => "Could not close the app currently running on your Ledger.",
            Self::UserRefusedConfirmation => {
                "Opening the Ethereum app was rejected on the device."
            }
            Self::AppIsNotInstalled => {
                "The Ethereum app is not installed. Install it with Ledger Live and try again."
            }
            Self::LedgerIsLocked => "Your Ledger is locked. Unlock it and try again.",
            Self::Unknown => "Something went wrong while communicating with your Ledger.",
        }
    }

    /// Whether a user declined on-device; never worth an automatic retry.
    pub fn is_user_decision(&self) -> bool {
        matches!(self, Self::UserRefusedConfirmation)
    }
}

/// The workflow step a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStage {
    OpenTransport,
    DetectApp,
    LaunchApp,
    CloseApp,
    SigningWork,
}

/// Maps a backend failure to the [`ErrorKind`] shown to the user.
pub fn classify(err: &BackendError, stage: CommandStage) -> ErrorKind {
    let status = err.status_code().map(StatusWord);
    match stage {
        CommandStage::OpenTransport => ErrorKind::LedgerDisconnected,
        CommandStage::CloseApp => ErrorKind::FailedToCloseApp,
        CommandStage::LaunchApp => match status {
            Some(sw) if sw.is_app_not_found() => ErrorKind::AppIsNotInstalled,
            Some(sw) if sw.is_user_refusal() => ErrorKind::UserRefusedConfirmation,
            Some(sw) if sw.is_locked() => ErrorKind::LedgerIsLocked,
            _ => ErrorKind::FailedToOpenApp,
        },
        CommandStage::DetectApp | CommandStage::SigningWork => match status {
            Some(sw) if sw.is_locked() => ErrorKind::LedgerIsLocked,
            _ => ErrorKind::Unknown,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_status_codes_map_to_specific_kinds() {
        let cases = [
            (0x6984, ErrorKind::AppIsNotInstalled),
            (0x6807, ErrorKind::AppIsNotInstalled),
            (0x6985, ErrorKind::UserRefusedConfirmation),
            (0x5501, ErrorKind::UserRefusedConfirmation),
            (0x6b0c, ErrorKind::LedgerIsLocked),
            (0x6e00, ErrorKind::FailedToOpenApp),
        ];
        for (code, expected) in cases {
            assert_eq!(
                classify(&BackendError::Status(code), CommandStage::LaunchApp),
                expected,
                "status 0x{code:04x}"
            );
        }
    }

    #[test]
    fn launch_transport_failure_is_failed_to_open() {
        assert_eq!(
            classify(&BackendError::Timeout, CommandStage::LaunchApp),
            ErrorKind::FailedToOpenApp
        );
    }

    #[test]
    fn close_failures_ignore_status() {
        assert_eq!(
            classify(&BackendError::Status(0x6b0c), CommandStage::CloseApp),
            ErrorKind::FailedToCloseApp
        );
    }

    #[test]
    fn locked_device_is_recognised_outside_launch() {
        assert_eq!(
            classify(&BackendError::Status(0x5515), CommandStage::DetectApp),
            ErrorKind::LedgerIsLocked
        );
        assert_eq!(
            classify(&BackendError::Status(0x6b0c), CommandStage::SigningWork),
            ErrorKind::LedgerIsLocked
        );
        assert_eq!(
            classify(&BackendError::Status(0x6985), CommandStage::SigningWork),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn transport_open_failure_is_disconnect() {
        assert_eq!(
            classify(
                &BackendError::Transport("no adapter".into()),
                CommandStage::OpenTransport
            ),
            ErrorKind::LedgerDisconnected
        );
    }

    #[test]
    fn codes_match_serialized_names() {
        for kind in [
            ErrorKind::LedgerDisconnected,
            ErrorKind::FailedToOpenApp,
            ErrorKind::Unknown,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.code()));
        }
    }
}

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::commands::AppInfo;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("transport disconnected")]
    Disconnected,
    #[error("timeout waiting for device response")]
    Timeout,
    #[error("device returned status 0x{0:04x}")]
    Status(u16),
    #[error("malformed device response: {0}")]
    Malformed(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

impl BackendError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status(code) => Some(*code),
            _ => None,
        }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Resolves (or errors because the sender is gone) once the link drops.
pub type DisconnectSignal = oneshot::Receiver<()>;

/// Opens Bluetooth transports to a device by id.
#[async_trait]
pub trait TransportProvider: Send + Sync + 'static {
    type Transport: LedgerTransport;

    async fn open(&self, device_id: &str) -> BackendResult<Self::Transport>;
}

/// An open command/response channel to the device.
///
/// Implementations that fail `exchange` with [`BackendError::Disconnected`]
/// must also fire every signal handed out by `on_disconnect`.
#[async_trait]
pub trait LedgerTransport: Send + Sync + 'static {
    async fn exchange(&self, apdu: &[u8]) -> BackendResult<Vec<u8>>;

    async fn close(&self) -> BackendResult<()>;

    fn on_disconnect(&self) -> DisconnectSignal;
}

/// Device-level operations needed to bring the Ethereum app to the foreground.
#[async_trait]
pub trait DeviceCommands<T: LedgerTransport>: Send + Sync + 'static {
    async fn running_app(&self, transport: &T) -> BackendResult<AppInfo>;

    async fn open_ethereum_app(&self, transport: &T) -> BackendResult<()>;

    async fn close_running_app(&self, transport: &T) -> BackendResult<()>;
}

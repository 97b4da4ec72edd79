use async_trait::async_trait;
use tracing::debug;

use crate::apdu::{ApduAnswer, ApduCommand};
use crate::backend::{BackendError, BackendResult, DeviceCommands, LedgerTransport};

pub const DASHBOARD_APP_NAME: &str = "BOLOS";
pub const ETHEREUM_APP_NAME: &str = "Ethereum";

const APP_AND_VERSION_FORMAT: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
}

impl AppInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    pub fn running_app(&self) -> RunningApp {
        RunningApp::from_name(&self.name)
    }

    /// Parses the get-app-and-version payload (status word already stripped).
    pub fn decode(payload: &[u8]) -> BackendResult<Self> {
        let mut reader = FieldReader::new(payload);
        let format = reader.byte("format")?;
        if format != APP_AND_VERSION_FORMAT {
            return Err(BackendError::Malformed(format!(
                "unsupported app info format {format}"
            )));
        }
        let name = reader.string("name")?;
        let version = reader.string("version")?;
        Ok(Self { name, version })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.name.len() + self.version.len());
        out.push(APP_AND_VERSION_FORMAT);
        out.push(self.name.len() as u8);
        out.extend_from_slice(self.name.as_bytes());
        out.push(self.version.len() as u8);
        out.extend_from_slice(self.version.as_bytes());
        // flags
        out.push(1);
        out.push(0);
        out
    }
}

/// Which application is in the foreground on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunningApp {
    Dashboard,
    Ethereum,
    Other(String),
}

impl RunningApp {
    pub fn from_name(name: &str) -> Self {
        match name {
            DASHBOARD_APP_NAME => Self::Dashboard,
            ETHEREUM_APP_NAME => Self::Ethereum,
            other => Self::Other(other.to_owned()),
        }
    }
}

struct FieldReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> FieldReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn byte(&mut self, field: &str) -> BackendResult<u8> {
        let value = *self
            .bytes
            .get(self.offset)
            .ok_or_else(|| BackendError::Malformed(format!("app info truncated at {field}")))?;
        self.offset += 1;
        Ok(value)
    }

    fn string(&mut self, field: &str) -> BackendResult<String> {
        let len = self.byte(field)? as usize;
        let end = self.offset + len;
        let raw = self
            .bytes
            .get(self.offset..end)
            .ok_or_else(|| BackendError::Malformed(format!("app info truncated at {field}")))?;
        self.offset = end;
        String::from_utf8(raw.to_vec())
            .map_err(|_| BackendError::Malformed(format!("app info {field} is not utf-8")))
    }
}

/// Sends a command and returns the payload of a 0x9000 answer.
pub async fn send_apdu<T>(transport: &T, command: &ApduCommand) -> BackendResult<Vec<u8>>
where
    T: LedgerTransport + ?Sized,
{
    let request = command.encode()?;
    debug!(
        cla = command.cla,
        ins = command.ins,
        apdu = %hex::encode(&request),
        "APDU TX"
    );
    let response = transport.exchange(&request).await?;
    let answer = ApduAnswer::decode(&response)?;
    debug!(status = %answer.status, data = %hex::encode(&answer.data), "APDU RX");
    answer.into_result()
}

/// [`DeviceCommands`] over the Ledger dashboard APDUs.
#[derive(Debug, Clone, Default)]
pub struct DashboardCommands;

impl DashboardCommands {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl<T: LedgerTransport> DeviceCommands<T> for DashboardCommands {
    async fn running_app(&self, transport: &T) -> BackendResult<AppInfo> {
        let payload = send_apdu(transport, &ApduCommand::get_app_and_version()).await?;
        let info = AppInfo::decode(&payload)?;
        debug!(app = %info.name, version = %info.version, "device reported running app");
        Ok(info)
    }

    async fn open_ethereum_app(&self, transport: &T) -> BackendResult<()> {
        send_apdu(transport, &ApduCommand::open_app(ETHEREUM_APP_NAME)).await?;
        Ok(())
    }

    async fn close_running_app(&self, transport: &T) -> BackendResult<()> {
        send_apdu(transport, &ApduCommand::quit_app()).await?;
        Ok(())
    }
}

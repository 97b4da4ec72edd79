//! In-process Ledger model for exercising the workflow without hardware.
//!
//! A [`SimulatedLedger`] answers the dashboard APDUs, drops its Bluetooth link
//! after every app switch the way the physical device does, and records what it
//! was asked to do.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use crate::apdu::{
    ApduAnswer, ApduCommand, StatusWord, CLA_APP, CLA_DASHBOARD, INS_GET_APP_AND_VERSION,
    INS_OPEN_APP, INS_QUIT_APP,
};
use crate::backend::{
    BackendError, BackendResult, DisconnectSignal, LedgerTransport, TransportProvider,
};
use crate::commands::{AppInfo, DASHBOARD_APP_NAME, ETHEREUM_APP_NAME};

const SIGNATURE_LEN: usize = 65;

/// Behaviour of a simulated device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationScript {
    pub start_app: String,
    pub installed_apps: Vec<String>,
    pub locked: bool,
    /// What the user answers when asked to open an app.
    pub approve_app_launch: bool,
    pub fail_close: bool,
    /// Connection attempts rejected before one succeeds.
    pub refuse_connections: u32,
    /// Links dropped right after they are established.
    pub unstable_links: u32,
    /// Opened apps exit straight back to the dashboard.
    pub app_exits_on_launch: bool,
    /// Delay between an app switch and the link drop it causes.
    pub reconnect_delay_ms: u64,
}

impl Default for SimulationScript {
    fn default() -> Self {
        Self {
            start_app: DASHBOARD_APP_NAME.to_string(),
            installed_apps: vec![ETHEREUM_APP_NAME.to_string()],
            locked: false,
            approve_app_launch: true,
            fail_close: false,
            refuse_connections: 0,
            unstable_links: 0,
            app_exits_on_launch: false,
            reconnect_delay_ms: 5,
        }
    }
}

impl SimulationScript {
    pub fn running(app: impl Into<String>) -> Self {
        Self {
            start_app: app.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SimEvent {
    Connected,
    ConnectionRefused,
    LinkDropped,
    GetAppAndVersion,
    OpenApp(String),
    QuitApp,
    AppCommand(u8),
}

/// Handle to one simulated device; clones share the device.
#[derive(Clone)]
pub struct SimulatedLedger {
    id: String,
    inner: Arc<Mutex<DeviceModel>>,
}

struct DeviceModel {
    script: SimulationScript,
    running_app: String,
    next_link: u64,
    active_link: Option<Arc<Link>>,
    history: Vec<SimEvent>,
}

struct Link {
    id: u64,
    state: Mutex<LinkState>,
}

struct LinkState {
    open: bool,
    subscribers: Vec<oneshot::Sender<()>>,
}

impl Link {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: Mutex::new(LinkState {
                open: true,
                subscribers: Vec::new(),
            }),
        }
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn sever(&self) -> bool {
        let mut state = self.state.lock();
        if !state.open {
            return false;
        }
        state.open = false;
        for subscriber in state.subscribers.drain(..) {
            let _ = subscriber.send(());
        }
        true
    }

    fn subscribe(&self) -> DisconnectSignal {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        if state.open {
            state.subscribers.push(tx);
        } else {
            let _ = tx.send(());
        }
        rx
    }
}

impl SimulatedLedger {
    pub fn new(id: impl Into<String>, script: SimulationScript) -> Self {
        let running_app = script.start_app.clone();
        Self {
            id: id.into(),
            inner: Arc::new(Mutex::new(DeviceModel {
                script,
                running_app,
                next_link: 0,
                active_link: None,
                history: Vec::new(),
            })),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn provider(&self) -> SimulatedProvider {
        SimulatedProvider {
            device: self.clone(),
        }
    }

    pub fn running_app(&self) -> String {
        self.inner.lock().running_app.clone()
    }

    pub fn history(&self) -> Vec<SimEvent> {
        self.inner.lock().history.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .lock()
            .active_link
            .as_ref()
            .is_some_and(|link| link.is_open())
    }

    /// Updates the script, e.g. to unlock the device mid-test.
    pub fn update_script(&self, update: impl FnOnce(&mut SimulationScript)) {
        update(&mut self.inner.lock().script);
    }

    /// Drops the active link as if the device went out of range.
    pub fn drop_link(&self) {
        let link = self.inner.lock().active_link.take();
        if let Some(link) = link {
            self.sever(&link);
        }
    }

    fn sever(&self, link: &Link) {
        if link.sever() {
            debug!(link = link.id, "simulated link dropped");
            self.inner.lock().history.push(SimEvent::LinkDropped);
        }
    }

    fn take_active_link(&self, link: u64) -> Option<Arc<Link>> {
        let mut model = self.inner.lock();
        let is_active = model
            .active_link
            .as_ref()
            .is_some_and(|active| active.id == link);
        if is_active {
            model.active_link.take()
        } else {
            None
        }
    }

    fn drop_link_later(&self, link: u64, delay: Duration) {
        let device = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let active = device.take_active_link(link);
            if let Some(active) = active {
                device.sever(&active);
            }
        });
    }

    fn connect(&self) -> BackendResult<Arc<Link>> {
        let (link, previous, unstable) = {
            let mut model = self.inner.lock();
            if model.script.refuse_connections > 0 {
                model.script.refuse_connections -= 1;
                model.history.push(SimEvent::ConnectionRefused);
                return Err(BackendError::Transport("connection refused".into()));
            }
            model.next_link += 1;
            let link = Arc::new(Link::new(model.next_link));
            let previous = model.active_link.replace(Arc::clone(&link));
            let unstable = model.script.unstable_links > 0;
            if unstable {
                model.script.unstable_links -= 1;
            }
            model.history.push(SimEvent::Connected);
            (link, previous, unstable)
        };
        if let Some(previous) = previous {
            self.sever(&previous);
        }
        if unstable {
            self.drop_link_later(link.id, Duration::ZERO);
        }
        Ok(link)
    }

    fn handle(&self, link: u64, request: &[u8]) -> ApduAnswer {
        let command = match ApduCommand::decode(request) {
            Ok(command) => command,
            Err(_) => return ApduAnswer::status(StatusWord::UNKNOWN),
        };

        let mut model = self.inner.lock();
        let delay = Duration::from_millis(model.script.reconnect_delay_ms);
        let (answer, switched) = match (command.cla, command.ins) {
            (CLA_DASHBOARD, INS_GET_APP_AND_VERSION) => {
                model.history.push(SimEvent::GetAppAndVersion);
                if model.script.locked {
                    (ApduAnswer::status(StatusWord::LOCKED_DEVICE), false)
                } else {
                    let info = AppInfo::new(model.running_app.clone(), "1.0.0");
                    (ApduAnswer::ok(info.encode()), false)
                }
            }
            (CLA_APP, INS_OPEN_APP) => {
                let name = String::from_utf8_lossy(&command.data).into_owned();
                model.history.push(SimEvent::OpenApp(name.clone()));
                model.open_app(name)
            }
            (CLA_DASHBOARD, INS_QUIT_APP) => {
                model.history.push(SimEvent::QuitApp);
                model.quit_app()
            }
            (CLA_APP, ins) => {
                model.history.push(SimEvent::AppCommand(ins));
                (model.app_command(&command.data), false)
            }
            _ => (ApduAnswer::status(StatusWord::CLA_NOT_SUPPORTED), false),
        };
        drop(model);

        if switched {
            self.drop_link_later(link, delay);
        }
        answer
    }
}

impl DeviceModel {
    fn open_app(&mut self, name: String) -> (ApduAnswer, bool) {
        if self.script.locked {
            return (ApduAnswer::status(StatusWord::LOCKED_DEVICE), false);
        }
        if self.running_app != DASHBOARD_APP_NAME {
            return (ApduAnswer::status(StatusWord::CLA_NOT_SUPPORTED), false);
        }
        if !self.script.installed_apps.contains(&name) {
            return (ApduAnswer::status(StatusWord::APP_NOT_FOUND), false);
        }
        if !self.script.approve_app_launch {
            return (ApduAnswer::status(StatusWord::USER_REFUSED), false);
        }
        if !self.script.app_exits_on_launch {
            self.running_app = name;
        }
        (ApduAnswer::ok(Vec::new()), true)
    }

    fn quit_app(&mut self) -> (ApduAnswer, bool) {
        if self.script.fail_close {
            return (ApduAnswer::status(StatusWord::UNKNOWN), false);
        }
        if self.running_app == DASHBOARD_APP_NAME {
            return (ApduAnswer::ok(Vec::new()), false);
        }
        self.running_app = DASHBOARD_APP_NAME.to_string();
        (ApduAnswer::ok(Vec::new()), true)
    }

    fn app_command(&self, data: &[u8]) -> ApduAnswer {
        if self.running_app != ETHEREUM_APP_NAME {
            return ApduAnswer::status(StatusWord::CLA_NOT_SUPPORTED);
        }
        if self.script.locked {
            return ApduAnswer::status(StatusWord::LOCKED_DEVICE);
        }
        ApduAnswer::ok(fake_signature(data))
    }
}

/// Deterministic stand-in for an ECDSA signature over `data`.
pub fn fake_signature(data: &[u8]) -> Vec<u8> {
    (0..SIGNATURE_LEN)
        .map(|i| {
            let seed = if data.is_empty() { 0 } else { data[i % data.len()] };
            seed ^ (i as u8)
        })
        .collect()
}

#[derive(Clone)]
pub struct SimulatedProvider {
    device: SimulatedLedger,
}

#[async_trait]
impl TransportProvider for SimulatedProvider {
    type Transport = SimulatedTransport;

    async fn open(&self, device_id: &str) -> BackendResult<SimulatedTransport> {
        if device_id != self.device.id {
            return Err(BackendError::Transport(format!(
                "no device with id {device_id}"
            )));
        }
        let link = self.device.connect()?;
        Ok(SimulatedTransport {
            device: self.device.clone(),
            link,
        })
    }
}

pub struct SimulatedTransport {
    device: SimulatedLedger,
    link: Arc<Link>,
}

impl SimulatedTransport {
    pub fn link_id(&self) -> u64 {
        self.link.id
    }
}

#[async_trait]
impl LedgerTransport for SimulatedTransport {
    async fn exchange(&self, apdu: &[u8]) -> BackendResult<Vec<u8>> {
        // Give pending link events a chance to land first, like a radio round trip.
        tokio::task::yield_now().await;
        if !self.link.is_open() {
            return Err(BackendError::Disconnected);
        }
        Ok(self.device.handle(self.link.id, apdu).encode())
    }

    async fn close(&self) -> BackendResult<()> {
        let active = self.device.take_active_link(self.link.id);
        if active.is_some() || self.link.is_open() {
            self.device.sever(&self.link);
        }
        Ok(())
    }

    fn on_disconnect(&self) -> DisconnectSignal {
        self.link.subscribe()
    }
}

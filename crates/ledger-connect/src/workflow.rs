use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, BackendResult, DeviceCommands, LedgerTransport, TransportProvider};
use crate::commands::RunningApp;
use crate::config::WorkflowConfig;
use crate::error::{classify, CommandStage, ErrorKind};
use crate::state::{ConnectionState, Guard, WorkflowPhase, WorkflowStatus};
use crate::steps::{RestartState, SigningWork, WorkflowStep};

/// Drives a Ledger over Bluetooth until the Ethereum app runs, then executes
/// the caller's signing work.
///
/// One workflow owns one logical connection to one device. Handles are cheap
/// to clone and share the same state. Invocations of [`LedgerWorkflow::run`]
/// must be serialized by the caller: wait for the workflow to go idle before
/// submitting more work.
pub struct LedgerWorkflow<P, D>
where
    P: TransportProvider,
{
    inner: Arc<Inner<P, D>>,
}

impl<P, D> Clone for LedgerWorkflow<P, D>
where
    P: TransportProvider,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<P, D>
where
    P: TransportProvider,
{
    device_id: String,
    provider: P,
    commands: D,
    config: WorkflowConfig,
    state: Mutex<ConnectionState<P::Transport>>,
    status_tx: watch::Sender<WorkflowStatus>,
}

enum TransportSlot<T> {
    Stale,
    Reuse(u64, Arc<T>),
    Open,
}

enum DisconnectOutcome {
    Stale,
    Restart { attempt: u32, epoch: u64 },
    Reset { error: Option<ErrorKind> },
}

impl<P, D> LedgerWorkflow<P, D>
where
    P: TransportProvider,
    D: DeviceCommands<P::Transport>,
{
    pub fn new(device_id: impl Into<String>, provider: P, commands: D) -> Self {
        Self::with_config(device_id, provider, commands, WorkflowConfig::default())
    }

    pub fn with_config(
        device_id: impl Into<String>,
        provider: P,
        commands: D,
        config: WorkflowConfig,
    ) -> Self {
        let (status_tx, _) = watch::channel(WorkflowStatus::default());
        Self {
            inner: Arc::new(Inner {
                device_id: device_id.into(),
                provider,
                commands,
                config,
                state: Mutex::new(ConnectionState::new()),
                status_tx,
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.inner.config
    }

    pub fn status(&self) -> WorkflowStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkflowStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Resolves once the workflow is back to idle, with the final status.
    pub async fn wait_idle(&self) -> WorkflowStatus {
        let mut rx = self.subscribe();
        let status = match rx.wait_for(WorkflowStatus::is_idle).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        status
    }

    pub fn restart_state(&self) -> RestartState {
        self.inner.state.lock().restart
    }

    pub fn pending_steps(&self) -> Vec<&'static str> {
        self.inner.state.lock().steps.kinds()
    }

    /// Queues `work` and starts the workflow. Returns immediately; progress
    /// and the outcome are reported through [`LedgerWorkflow::status`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn run<F, Fut>(&self, work: F)
    where
        F: FnOnce(Arc<P::Transport>) -> Fut + Send + 'static,
        Fut: Future<Output = BackendResult<()>> + Send + 'static,
    {
        let work: SigningWork<P::Transport> = Box::new(move |transport| work(transport).boxed());
        let epoch = self.inner.with_state(|state| {
            if state.steps.has_signing_work() {
                warn!("run called while another workflow is in flight; step order is undefined");
            }
            state.status.error = None;
            state.steps.push(WorkflowStep::SigningWork(work));
            state.status.phase = WorkflowPhase::Connecting;
            state.epoch()
        });
        debug!(device_id = %redact_device_id(&self.inner.device_id), "ledger workflow started");
        self.inner.spawn_process(epoch);
    }

    /// Tears the connection down. Safe to call at any time, any number of times.
    pub fn cleanup(&self) {
        let transport = self.inner.with_state(|state| state.reset());
        debug!("ledger workflow cleaned up");
        let Some(transport) = transport else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(close_transport(transport));
            }
            Err(_) => debug!("no runtime available; dropping transport without close"),
        }
    }
}

impl<P, D> Inner<P, D>
where
    P: TransportProvider,
    D: DeviceCommands<P::Transport>,
{
    fn with_state<R>(&self, f: impl FnOnce(&mut ConnectionState<P::Transport>) -> R) -> R {
        let mut state = self.state.lock();
        let out = f(&mut state);
        let status = state.status;
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        out
    }

    fn with_current<R>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut ConnectionState<P::Transport>) -> R,
    ) -> Option<R> {
        self.with_state(|state| state.holds(generation).then(|| f(state)))
    }

    fn holds(&self, generation: u64) -> bool {
        self.state.lock().holds(generation)
    }

    fn spawn_process(self: &Arc<Self>, epoch: u64) {
        tokio::spawn(Arc::clone(self).process(epoch));
    }

    fn process(self: Arc<Self>, epoch: u64) -> BoxFuture<'static, ()> {
        async move { self.advance(epoch).await }.boxed()
    }

    async fn advance(self: &Arc<Self>, epoch: u64) {
        let Some((generation, transport)) = self.ensure_transport(epoch).await else {
            return;
        };

        if self
            .with_current(generation, |state| {
                state.status.phase = WorkflowPhase::DetectingApp;
            })
            .is_none()
        {
            return;
        }
        let Some(info) = self
            .device_call(
                generation,
                CommandStage::DetectApp,
                self.commands.running_app(transport.as_ref()),
            )
            .await
        else {
            return;
        };
        debug!(app = %info.name, generation, "running app detected");

        match info.running_app() {
            RunningApp::Dashboard => {
                let awaiting = self.with_current(generation, |state| {
                    state.status.is_app_launch_confirmation_needed = true;
                    state.status.phase = WorkflowPhase::AwaitingAppLaunchConfirmation;
                });
                if awaiting.is_none() {
                    return;
                }
                let launched = self
                    .device_call(
                        generation,
                        CommandStage::LaunchApp,
                        self.commands.open_ethereum_app(transport.as_ref()),
                    )
                    .await;
                if launched.is_some() {
                    self.schedule_resume(generation, "Ethereum app launched");
                }
            }
            RunningApp::Ethereum => self.run_signing_work(generation, transport).await,
            RunningApp::Other(name) => {
                if self
                    .with_current(generation, |state| {
                        state.status.phase = WorkflowPhase::ClosingOtherApp;
                    })
                    .is_none()
                {
                    return;
                }
                debug!(app = %name, "closing running app");
                let closed = self
                    .device_call(
                        generation,
                        CommandStage::CloseApp,
                        self.commands.close_running_app(transport.as_ref()),
                    )
                    .await;
                if closed.is_some() {
                    self.schedule_resume(generation, "running app closed");
                }
            }
        }
    }

    async fn ensure_transport(self: &Arc<Self>, epoch: u64) -> Option<(u64, Arc<P::Transport>)> {
        let slot = self.with_state(|state| {
            if state.epoch() != epoch {
                return TransportSlot::Stale;
            }
            match state.transport() {
                Some((generation, transport)) => TransportSlot::Reuse(generation, transport),
                None => {
                    state.status.phase = WorkflowPhase::Connecting;
                    TransportSlot::Open
                }
            }
        });
        match slot {
            TransportSlot::Stale => return None,
            TransportSlot::Reuse(generation, transport) => return Some((generation, transport)),
            TransportSlot::Open => {}
        }

        debug!(device_id = %redact_device_id(&self.device_id), "opening transport");
        let transport = match self
            .with_deadline(self.provider.open(&self.device_id))
            .await
        {
            Ok(transport) => Arc::new(transport),
            Err(err) => {
                warn!(%err, "failed to open transport");
                self.fail(
                    Guard::Epoch(epoch),
                    classify(&err, CommandStage::OpenTransport),
                )
                .await;
                return None;
            }
        };

        // Subscribe before any command can race an immediate disconnect.
        let signal = transport.on_disconnect();
        let attached = self.with_state(|state| {
            (state.epoch() == epoch).then(|| state.attach(Arc::clone(&transport)))
        });
        let Some(generation) = attached else {
            debug!("workflow reset while connecting; closing new transport");
            close_transport(transport).await;
            return None;
        };

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let _ = signal.await;
            if let Some(inner) = weak.upgrade() {
                inner.on_disconnect(generation);
            }
        });

        debug!(generation, "transport attached");
        Some((generation, transport))
    }

    async fn with_deadline<R>(
        &self,
        call: impl Future<Output = BackendResult<R>> + Send,
    ) -> BackendResult<R> {
        match self.config.command_timeout() {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or(Err(BackendError::Timeout)),
            None => call.await,
        }
    }

    /// Runs a device command and settles failures. `None` means the step is over.
    async fn device_call<R: Send>(
        self: &Arc<Self>,
        generation: u64,
        stage: CommandStage,
        call: impl Future<Output = BackendResult<R>> + Send,
    ) -> Option<R> {
        let result = self.with_deadline(call).await;
        if !self.holds(generation) {
            debug!(?stage, generation, "ignoring completion from stale transport");
            return None;
        }
        match result {
            Ok(value) => Some(value),
            Err(BackendError::Disconnected) => {
                debug!(?stage, generation, "command saw the link drop");
                self.on_disconnect(generation);
                None
            }
            Err(err) => {
                let kind = classify(&err, stage);
                warn!(?stage, %err, error = kind.code(), "device command failed");
                self.fail(Guard::Generation(generation), kind).await;
                None
            }
        }
    }

    fn schedule_resume(&self, generation: u64, reason: &str) {
        let scheduled = self.with_current(generation, |state| {
            state.status.is_app_launch_confirmation_needed = false;
            state.steps.push(WorkflowStep::ResumeDetectApp);
            state.restart.arm();
            state.status.phase = WorkflowPhase::AwaitingReconnect;
        });
        if scheduled.is_some() {
            debug!(generation, reason, "waiting for the device to reconnect");
        }
    }

    async fn run_signing_work(self: &Arc<Self>, generation: u64, transport: Arc<P::Transport>) {
        let taken = self.with_current(generation, |state| {
            let work = state.steps.take_signing_work();
            if work.is_some() {
                state.status.phase = WorkflowPhase::RunningSigningWork;
            } else {
                warn!(steps = ?state.steps.kinds(), "unexpected pending steps with Ethereum app ready");
            }
            work
        });
        let work = match taken {
            None => return,
            Some(None) => {
                self.fail(Guard::Generation(generation), ErrorKind::Unknown)
                    .await;
                return;
            }
            Some(Some(work)) => work,
        };

        let result = work(Arc::clone(&transport)).await;
        if !self.holds(generation) {
            debug!(generation, "signing work finished after the transport went away");
            return;
        }
        match result {
            Ok(()) => {
                info!("ledger signing work completed");
                self.finish(Guard::Generation(generation)).await;
            }
            Err(BackendError::Disconnected) => self.on_disconnect(generation),
            Err(err) => {
                let kind = classify(&err, CommandStage::SigningWork);
                warn!(%err, error = kind.code(), "signing work failed");
                self.fail(Guard::Generation(generation), kind).await;
            }
        }
    }

    async fn finish(&self, guard: Guard) {
        let transport = self.with_state(|state| {
            if state.is_valid(guard) {
                state.reset()
            } else {
                None
            }
        });
        if let Some(transport) = transport {
            close_transport(transport).await;
        }
    }

    async fn fail(&self, guard: Guard, kind: ErrorKind) {
        let transport = self.with_state(|state| {
            if !state.is_valid(guard) {
                return None;
            }
            state.status.error = Some(kind);
            state.reset()
        });
        if let Some(transport) = transport {
            close_transport(transport).await;
        }
    }

    fn on_disconnect(self: &Arc<Self>, generation: u64) {
        let limit = self.config.restart_limit;
        let outcome = self.with_state(|state| {
            if !state.detach(generation) {
                return DisconnectOutcome::Stale;
            }
            state.status.is_app_launch_confirmation_needed = false;

            if !state.steps.is_empty() && state.restart.can_restart(limit) {
                let attempt = state.restart.record_attempt();
                match state.steps.pop() {
                    Some(step) => {
                        // Signing work only runs behind a fresh app check.
                        if step.is_signing_work() {
                            state.steps.push(step);
                        }
                        state.status.phase = WorkflowPhase::Connecting;
                        return DisconnectOutcome::Restart {
                            attempt,
                            epoch: state.epoch(),
                        };
                    }
                    None => state.status.error = Some(ErrorKind::Unknown),
                }
            } else if state.restart.is_exhausted(limit) {
                state.status.error = Some(ErrorKind::LedgerDisconnected);
            } else if state.status.is_sending_commands && state.status.error.is_none() {
                state.status.error = Some(ErrorKind::LedgerDisconnected);
            }

            let error = state.status.error;
            // The handle was detached above, so there is nothing to close.
            let _ = state.reset();
            DisconnectOutcome::Reset { error }
        });

        match outcome {
            DisconnectOutcome::Stale => {
                debug!(generation, "ignoring disconnect from stale transport");
            }
            DisconnectOutcome::Restart { attempt, epoch } => {
                debug!(generation, attempt, limit, "transport dropped; resuming workflow");
                self.spawn_process(epoch);
            }
            DisconnectOutcome::Reset { error: Some(kind) } => {
                warn!(generation, error = kind.code(), "transport dropped; workflow aborted");
            }
            DisconnectOutcome::Reset { error: None } => {
                debug!(generation, "transport dropped");
            }
        }
    }
}

async fn close_transport<T: LedgerTransport>(transport: Arc<T>) {
    if let Err(err) = transport.close().await {
        debug!(%err, "closing transport failed");
    }
}

fn redact_device_id(device_id: &str) -> String {
    let chars: Vec<char> = device_id.chars().collect();
    if chars.is_empty() {
        return "<redacted>".to_string();
    }
    let start = chars.len().saturating_sub(6);
    format!("...{}", chars[start..].iter().collect::<String>())
}

use std::sync::Arc;

use serde::Serialize;

use crate::error::ErrorKind;
use crate::steps::{RestartState, StepStack};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum WorkflowPhase {
    #[default]
    Idle,
    Connecting,
    DetectingApp,
    AwaitingAppLaunchConfirmation,
    ClosingOtherApp,
    /// An app switch succeeded and the device is expected to drop the link.
    AwaitingReconnect,
    RunningSigningWork,
}

/// Snapshot of what the caller can observe about a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct WorkflowStatus {
    pub is_sending_commands: bool,
    pub is_app_launch_confirmation_needed: bool,
    pub error: Option<ErrorKind>,
    pub phase: WorkflowPhase,
}

impl WorkflowStatus {
    pub fn is_idle(&self) -> bool {
        self.phase == WorkflowPhase::Idle
    }
}

struct TransportSlot<T> {
    generation: u64,
    handle: Arc<T>,
}

/// Condition a deferred mutation must still satisfy when it lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Guard {
    /// No reset happened since the epoch was read.
    Epoch(u64),
    /// The transport of this generation is still attached.
    Generation(u64),
}

pub(crate) struct ConnectionState<T> {
    transport: Option<TransportSlot<T>>,
    next_generation: u64,
    epoch: u64,
    pub(crate) steps: StepStack<T>,
    pub(crate) restart: RestartState,
    pub(crate) status: WorkflowStatus,
}

impl<T> ConnectionState<T> {
    pub(crate) fn new() -> Self {
        Self {
            transport: None,
            next_generation: 0,
            epoch: 0,
            steps: StepStack::new(),
            restart: RestartState::default(),
            status: WorkflowStatus::default(),
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn transport(&self) -> Option<(u64, Arc<T>)> {
        self.transport
            .as_ref()
            .map(|slot| (slot.generation, Arc::clone(&slot.handle)))
    }

    /// Stores a freshly opened transport and returns its generation.
    pub(crate) fn attach(&mut self, handle: Arc<T>) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.transport = Some(TransportSlot { generation, handle });
        self.status.is_sending_commands = true;
        generation
    }

    pub(crate) fn holds(&self, generation: u64) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|slot| slot.generation == generation)
    }

    /// Drops the handle if it is still the given generation.
    pub(crate) fn detach(&mut self, generation: u64) -> bool {
        if !self.holds(generation) {
            return false;
        }
        self.transport = None;
        true
    }

    pub(crate) fn is_valid(&self, guard: Guard) -> bool {
        match guard {
            Guard::Epoch(epoch) => self.epoch == epoch,
            Guard::Generation(generation) => self.holds(generation),
        }
    }

    /// Full reset. Leaves `status.error` alone and hands back the transport to close.
    pub(crate) fn reset(&mut self) -> Option<Arc<T>> {
        self.restart = RestartState::default();
        self.steps.clear();
        self.status.is_sending_commands = false;
        self.status.is_app_launch_confirmation_needed = false;
        self.status.phase = WorkflowPhase::Idle;
        self.epoch += 1;
        self.transport.take().map(|slot| slot.handle)
    }
}

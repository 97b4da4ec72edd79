use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::backend::BackendResult;

/// Caller-supplied logic run against the transport once the Ethereum app is up.
pub type SigningWork<T> = Box<dyn FnOnce(Arc<T>) -> BoxFuture<'static, BackendResult<()>> + Send>;

/// Work to resume after the transport reconnects.
pub enum WorkflowStep<T> {
    /// Re-run app detection; pushed before an app switch drops the link.
    ResumeDetectApp,
    /// The caller's signing work. At most one per stack.
    SigningWork(SigningWork<T>),
}

impl<T> WorkflowStep<T> {
    pub fn is_signing_work(&self) -> bool {
        matches!(self, Self::SigningWork(_))
    }
}

impl<T> fmt::Debug for WorkflowStep<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResumeDetectApp => f.write_str("ResumeDetectApp"),
            Self::SigningWork(_) => f.write_str("SigningWork"),
        }
    }
}

/// LIFO stack of pending workflow steps.
#[derive(Debug)]
pub struct StepStack<T> {
    steps: Vec<WorkflowStep<T>>,
}

impl<T> Default for StepStack<T> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<T> StepStack<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn push(&mut self, step: WorkflowStep<T>) {
        self.steps.push(step);
    }

    pub fn pop(&mut self) -> Option<WorkflowStep<T>> {
        self.steps.pop()
    }

    pub fn clear(&mut self) {
        self.steps.clear();
    }

    pub fn has_signing_work(&self) -> bool {
        self.steps.iter().any(WorkflowStep::is_signing_work)
    }

    /// Pops the signing work when it is the only entry left.
    pub fn take_signing_work(&mut self) -> Option<SigningWork<T>> {
        if self.steps.len() != 1 || !self.steps[0].is_signing_work() {
            return None;
        }
        match self.steps.pop() {
            Some(WorkflowStep::SigningWork(work)) => Some(work),
            _ => None,
        }
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.steps
            .iter()
            .map(|step| match step {
                WorkflowStep::ResumeDetectApp => "ResumeDetectApp",
                WorkflowStep::SigningWork(_) => "SigningWork",
            })
            .collect()
    }
}

/// Bounded automatic-reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RestartState {
    pub should_restart: bool,
    pub attempt_count: u32,
}

impl RestartState {
    /// Marks that the next disconnect is expected and should resume work.
    pub fn arm(&mut self) {
        self.should_restart = true;
    }

    pub fn can_restart(&self, limit: u32) -> bool {
        self.should_restart && self.attempt_count < limit
    }

    pub fn is_exhausted(&self, limit: u32) -> bool {
        self.attempt_count >= limit
    }

    pub fn record_attempt(&mut self) -> u32 {
        self.attempt_count += 1;
        self.attempt_count
    }
}

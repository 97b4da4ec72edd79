use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Automatic reconnects allowed per workflow before giving up.
pub const RESTART_LIMIT: u32 = 5;
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub restart_limit: u32,
    /// Deadline for transport open and dashboard commands; `None` waits forever.
    pub command_timeout_ms: Option<u64>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            restart_limit: RESTART_LIMIT,
            command_timeout_ms: Some(DEFAULT_COMMAND_TIMEOUT.as_millis() as u64),
        }
    }
}

impl WorkflowConfig {
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms
            .map(|ms| Duration::from_millis(ms.max(1)))
    }

    pub fn with_restart_limit(mut self, limit: u32) -> Self {
        self.restart_limit = limit;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }
}

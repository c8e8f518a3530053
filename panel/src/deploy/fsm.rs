//! Finite State Machine for a deploy attempt

use serde::{Deserialize, Serialize};

use crate::errors::PanelError;

/// Deploy status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStatus {
    /// Recorded, extraction not finished
    Pending,

    /// Release activated
    Success,

    /// Rejected or failed; never retried
    Failed,
}

impl DeployStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeployStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStatus::Pending => "pending",
            DeployStatus::Success => "success",
            DeployStatus::Failed => "failed",
        }
    }
}

/// Deploy event
#[derive(Debug, Clone)]
pub enum DeployEvent {
    /// Staging and activation completed
    Succeed,

    /// Any validation, extraction or activation failure
    Fail(String),
}

/// Deploy FSM
#[derive(Debug, Clone)]
pub struct DeployFsm {
    status: DeployStatus,
    error: Option<String>,
}

impl DeployFsm {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self {
            status: DeployStatus::Pending,
            error: None,
        }
    }

    /// Resume from a stored status
    pub fn resume(status: DeployStatus, error: Option<String>) -> Self {
        Self { status, error }
    }

    /// Get current status
    pub fn status(&self) -> DeployStatus {
        self.status
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeployEvent) -> Result<(), PanelError> {
        let new_status = match (self.status, &event) {
            (DeployStatus::Pending, DeployEvent::Succeed) => {
                self.error = None;
                DeployStatus::Success
            }
            (DeployStatus::Pending, DeployEvent::Fail(err)) => {
                self.error = Some(err.clone());
                DeployStatus::Failed
            }

            // Terminal states never change
            (status, event) => {
                return Err(PanelError::TransitionError(format!(
                    "{:?} -> {:?}",
                    status, event
                )));
            }
        };

        self.status = new_status;
        Ok(())
    }
}

impl Default for DeployFsm {
    fn default() -> Self {
        Self::new()
    }
}

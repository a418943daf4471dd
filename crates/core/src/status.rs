//! Canonical job status and its state machine.
//!
//! Every backend's native vocabulary is translated into [`JobStatus`]
//! by its monitor. Allowed edges:
//!
//! ```text
//! Created -> Submitted -> Running -> {Succeeded, Failed, Stopped}
//! Submitted -> {Succeeded, Failed, Stopped}
//! any non-terminal -> Unknown
//! Unknown -> {Running, Succeeded, Failed, Stopped}
//! ```
//!
//! Terminal states are sticky.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Backend-agnostic job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Submitted,
    Running,
    Succeeded,
    Failed,
    Stopped,
    Unknown,
}

impl JobStatus {
    /// Every status, in declaration order.
    pub const ALL: [JobStatus; 7] = [
        Self::Created,
        Self::Submitted,
        Self::Running,
        Self::Succeeded,
        Self::Failed,
        Self::Stopped,
        Self::Unknown,
    ];

    /// Return the wire-format string for this variant.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        }
    }

    /// Parse from a wire-format string.
    pub fn from_str(s: &str) -> Result<Self, CoreError> {
        match s {
            "created" => Ok(Self::Created),
            "submitted" => Ok(Self::Submitted),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            "unknown" => Ok(Self::Unknown),
            _ => Err(CoreError::Validation(format!(
                "Invalid job status: '{s}'. Must be one of: created, submitted, running, \
                 succeeded, failed, stopped, unknown"
            ))),
        }
    }

    /// `true` for SUCCEEDED, FAILED and STOPPED.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Stopped)
    }

    /// Whether moving from `self` to `next` follows an allowed edge.
    ///
    /// Self-loops are not transitions and return `false`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        if self == next || self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Created, Submitted | Unknown) => true,
            (Created, _) => false,
            (_, Created | Submitted) => false,
            (Submitted, _) => true,
            (Running, Succeeded | Failed | Stopped | Unknown) => true,
            (Unknown, Running | Succeeded | Failed | Stopped) => true,
            _ => false,
        }
    }

    /// Validate a transition, returning [`CoreError::InvalidTransition`]
    /// when the edge is not allowed.
    pub fn transition(self, next: JobStatus) -> Result<JobStatus, CoreError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

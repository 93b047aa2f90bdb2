//! Phase outcomes and requeue decisions.

use std::fmt;

use serde::Serialize;

use crate::error::CoordinatorError;

/// Outcome class of a phase operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    Success,
    /// The phase (and, from PreFilter, every later phase) does not apply.
    Skip,
    /// Not schedulable now; another node or a later attempt may work.
    Unschedulable,
    /// Not schedulable on this node until something external changes.
    UnschedulableAndUnresolvable,
    /// Waiting for an external actor; the attempt must be parked.
    Pending,
    /// Internal failure; the attempt is aborted.
    Error,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Success => "Success",
            Code::Skip => "Skip",
            Code::Unschedulable => "Unschedulable",
            Code::UnschedulableAndUnresolvable => "UnschedulableAndUnresolvable",
            Code::Pending => "Pending",
            Code::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Result of one phase operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    code: Code,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub fn success() -> Self {
        Self {
            code: Code::Success,
            message: None,
        }
    }

    pub fn skip() -> Self {
        Self {
            code: Code::Skip,
            message: None,
        }
    }

    pub fn unschedulable(message: impl Into<String>) -> Self {
        Self::new(Code::Unschedulable, message)
    }

    pub fn unresolvable(message: impl Into<String>) -> Self {
        Self::new(Code::UnschedulableAndUnresolvable, message)
    }

    pub fn pending(message: impl Into<String>) -> Self {
        Self::new(Code::Pending, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Code::Error, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn is_success(&self) -> bool {
        self.code == Code::Success
    }

    /// Unschedulable with either code.
    pub fn is_rejected(&self) -> bool {
        matches!(
            self.code,
            Code::Unschedulable | Code::UnschedulableAndUnresolvable
        )
    }
}

impl From<CoordinatorError> for Status {
    fn from(err: CoordinatorError) -> Self {
        Status::error(err.to_string())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

/// Whether a parked workload should be retried after an object change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueingHint {
    Queue,
    QueueSkip,
}

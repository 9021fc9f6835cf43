// SPDX-License-Identifier: MIT

//! Execution records and their lifecycle
//!
//! ```text
//! PENDING -> PREPARING -> RUNNING -> COMPLETED | FAILED | CANCELLED
//!    |           |
//!    |           +-> FAILED | CANCELLED
//!    +-> FAILED | CANCELLED
//! ```
//!
//! Terminal states never change again. All mutation goes through
//! [`Execution::apply`], which enforces the table above.

use crate::adk::error::EnsembleError;
use crate::ensemble::workflow::WorkflowSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Preparing,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Preparing)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Preparing, Running)
                | (Preparing, Failed)
                | (Preparing, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Preparing => "PREPARING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure details stored on a FAILED execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub kind: String,
    pub message: String,
}

impl From<&EnsembleError> for ExecutionFailure {
    fn from(err: &EnsembleError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// A requested state change
#[derive(Debug, Clone)]
pub enum Transition {
    Prepare,
    Run,
    Complete(Value),
    Fail(ExecutionFailure),
    Cancel,
}

impl Transition {
    pub fn target(&self) -> ExecutionStatus {
        match self {
            Self::Prepare => ExecutionStatus::Preparing,
            Self::Run => ExecutionStatus::Running,
            Self::Complete(_) => ExecutionStatus::Completed,
            Self::Fail(_) => ExecutionStatus::Failed,
            Self::Cancel => ExecutionStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Illegal transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub job_id: String,
    pub run_name: String,
    pub status: ExecutionStatus,
    /// Canonical workflow snapshot taken at submission
    pub config: WorkflowSpec,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<ExecutionFailure>,
}

impl Execution {
    pub fn new(job_id: impl Into<String>, run_name: impl Into<String>, config: WorkflowSpec) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            run_name: run_name.into(),
            status: ExecutionStatus::Pending,
            config,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn apply(&mut self, transition: Transition) -> Result<(), IllegalTransition> {
        let next = transition.target();
        if !self.status.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        match transition {
            Transition::Run => self.started_at = Some(now),
            Transition::Complete(result) => self.result = Some(result),
            Transition::Fail(failure) => self.error = Some(failure),
            Transition::Prepare | Transition::Cancel => {}
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

/// Name used when a definition does not carry one
pub fn derive_run_name(spec: &WorkflowSpec) -> String {
    if let Some(name) = &spec.run_name {
        return name.clone();
    }
    let roles: Vec<&str> = spec.agents.iter().take(2).map(|a| a.role.as_str()).collect();
    if roles.is_empty() {
        format!("Execution-{}", Utc::now().format("%Y%m%d-%H%M%S"))
    } else {
        format!("{} crew", roles.join(" & "))
    }
}

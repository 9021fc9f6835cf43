// SPDX-License-Identifier: MIT

//! Typed error handling for ensemble-rs
//!
//! Every failure that can end an execution maps onto one of the
//! [`EnsembleError`] variants. The variant's [`EnsembleError::kind`] is what
//! gets stored on a failed execution record, so callers can branch on it
//! without parsing messages.

use thiserror::Error;

/// Error type used at the agent, tool and model boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Top-level error type for ensemble-rs
#[derive(Debug, Error)]
pub enum EnsembleError {
    /// The submitted workflow definition is malformed
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Unknown provider or missing credential
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Tool resolution or agent construction failed
    #[error("Preparation error: {0}")]
    Preparation(#[from] PreparationError),

    /// A task failed after exhausting its retries
    #[error("Task '{task}' failed: {message}")]
    RuntimeExecution { task: String, message: String },

    /// Execution or trace store failure
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Raised inside the runner when the cancel flag is observed
    #[error("Cancellation requested")]
    CancellationRequested,

    /// Unknown execution id
    #[error("Execution '{0}' not found")]
    NotFound(String),

    /// The operation needs a terminal execution
    #[error("Execution '{0}' is still active")]
    ExecutionActive(String),

    /// Model/LLM errors
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// Generic error wrapper for compatibility
    #[error("{0}")]
    Other(String),
}

/// Structural problems found while normalizing a workflow definition
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Workflow has no {0}")]
    Empty(&'static str),

    #[error("Task '{task}' has no assigned agent")]
    MissingAgent { task: String },

    #[error("Task '{task}' is assigned to unknown agent '{agent}'")]
    UnknownAgent { task: String, agent: String },

    #[error("Task '{task}' is assigned to more than one agent")]
    ConflictingAssignment { task: String },

    #[error("'{from}' references unknown node '{to}'")]
    UnknownReference { from: String, to: String },

    #[error("Duplicate identifier '{0}'")]
    DuplicateId(String),

    #[error("Dependency cycle detected between tasks: {0:?}")]
    DependencyCycle(Vec<String>),

    #[error("Edge {from} -> {to} must connect an agent to a task or a task to a task")]
    InvalidEdge { from: String, to: String },

    #[error("Unknown node type '{node_type}' on node '{node}'")]
    UnknownNodeType { node: String, node_type: String },

    #[error("Unsupported process '{0}', expected 'sequential' or 'parallel'")]
    UnsupportedProcess(String),

    #[error("Invalid condition on task '{task}': {message}")]
    InvalidCondition { task: String, message: String },

    #[error("Invalid guardrail on task '{task}': {message}")]
    InvalidGuardrail { task: String, message: String },

    #[error("Malformed workflow definition: {0}")]
    Malformed(String),
}

/// Provider table and credential problems
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("Credential '{key}' for provider '{provider}' is not set")]
    MissingCredential { provider: String, key: String },

    #[error("Provider '{provider}' has no endpoint configured (set {variable})")]
    MissingEndpoint { provider: String, variable: String },

    #[error("Invalid setting {name}: {message}")]
    InvalidSetting { name: String, message: String },

    #[error("Cannot resolve model for agent '{agent}': {source}")]
    Agent {
        agent: String,
        #[source]
        source: Box<ConfigurationError>,
    },
}

impl ConfigurationError {
    /// Attribute a provider failure to the agent that asked for it
    pub fn for_agent(self, agent: impl Into<String>) -> Self {
        Self::Agent {
            agent: agent.into(),
            source: Box::new(self),
        }
    }
}

/// Failures while binding a canonical workflow to runnable agents and tools
#[derive(Debug, Error)]
pub enum PreparationError {
    #[error("Unknown tool '{tool}' requested by agent '{agent}'")]
    UnknownTool { agent: String, tool: String },

    #[error("Tool source for '{tool}' failed: {message}")]
    ToolSource { tool: String, message: String },

    #[error("Cannot construct agent '{agent}': {message}")]
    AgentConstruction { agent: String, message: String },

    #[error("Cannot create output area {path}: {message}")]
    OutputArea { path: String, message: String },
}

/// Store failures, split by whether a retry may help
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store operation timed out: {0}")]
    Timeout(String),

    #[error("Store I/O failure: {0}")]
    Io(String),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Record could not be encoded: {0}")]
    Serialization(String),
}

/// Model/LLM-specific errors
#[derive(Debug, Error)]
pub enum ModelError {
    /// API key not configured
    #[error("API key not configured for provider: {0}")]
    ApiKeyMissing(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded, retry after {retry_after_secs:?} seconds")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Non-success HTTP status
    #[error("API error from {provider} ({status}): {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },

    /// Invalid response from model
    #[error("Invalid response from model: {0}")]
    InvalidResponse(String),
}

impl EnsembleError {
    /// Create a task failure
    pub fn runtime(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RuntimeExecution {
            task: task.into(),
            message: message.into(),
        }
    }

    /// Create from a generic error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Stable identifier of the error family, stored on failed executions.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::Configuration(_) => "ConfigurationError",
            Self::Preparation(_) => "PreparationError",
            Self::RuntimeExecution { .. } => "RuntimeExecutionError",
            Self::Persistence(_) => "PersistenceError",
            Self::CancellationRequested => "CancellationRequested",
            Self::NotFound(_) => "NotFound",
            Self::ExecutionActive(_) => "ExecutionActive",
            Self::Model(_) => "ModelError",
            Self::Io(_) | Self::Json(_) | Self::Yaml(_) | Self::Other(_) => "InternalError",
        }
    }
}

impl PersistenceError {
    /// Transient failures are worth another attempt; conflicts and encoding
    /// problems will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_) | Self::Io(_))
    }
}

impl ModelError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Api { status: 429, .. })
    }

    /// Worth another call: rate limits and server-side failures.
    pub fn is_transient(&self) -> bool {
        self.is_rate_limit() || matches!(self, Self::Api { status, .. } if *status >= 500)
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::Timeout(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<&str> for EnsembleError {
    fn from(s: &str) -> Self {
        Self::Other(s.to_string())
    }
}

impl From<String> for EnsembleError {
    fn from(s: String) -> Self {
        Self::Other(s)
    }
}

impl From<BoxError> for EnsembleError {
    fn from(err: BoxError) -> Self {
        Self::Other(err.to_string())
    }
}

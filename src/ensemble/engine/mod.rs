// SPDX-License-Identifier: MIT

//! Execution engine
//!
//! Leaves first:
//! - [`provider`] - model/provider resolution and credentials
//! - [`registry`] - tool lookup, including the aggregate id
//! - [`preparation`] - binds a canonical workflow to runnable agents
//! - [`trace`] and [`status`] - buffered trace writes and durable transitions
//! - [`runner`] - dependency-ordered task execution
//! - [`coordinator`] - lifecycle, supervision and the public contract

pub mod cache;
pub mod coordinator;
pub mod execution;
pub mod preparation;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod status;
pub mod store;
pub mod trace;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{CreatedExecution, ExecutionCoordinator, StatusReport};
pub use execution::{Execution, ExecutionFailure, ExecutionStatus};
pub use preparation::{AgentFactory, AgentSpec, LlmAgentFactory, PreparationStage, TaskSpec};
pub use provider::{
    EnvSecretStore, HttpModelFactory, ModelFactory, ProviderConfig, ProviderConfigResolver,
    ProviderEntry, ProviderTable, SecretStore, StaticSecretStore,
};
pub use registry::{
    AggregateToolResolver, EnabledToolSource, StaticToolResolver, ToolRegistry, ToolResolver,
    AGGREGATE_TOOL_ID,
};
pub use retry::RetryPolicy;
pub use runner::{AsyncExecutionRunner, CancelFlag, RunnerOptions};
pub use status::StatusTracker;
pub use store::{ExecutionStore, FileStore, MemoryStore, TraceStore};
pub use trace::{TraceEvent, TraceEventKind, TracePage, TraceSettings};

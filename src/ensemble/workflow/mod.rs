// SPDX-License-Identifier: MIT

//! Workflow definitions and their canonical form
//!
//! - [`types`] - definitions as submitted (graph or flat)
//! - [`normalizer`] - validation and conversion to [`WorkflowSpec`]
//! - [`guard`] - task conditions evaluated against [`RunState`]
//! - [`guardrail`] - checks applied to task outputs

pub mod guard;
pub mod guardrail;
pub mod loader;
pub mod normalizer;
pub mod spec;
pub mod state;
pub mod types;

pub use guardrail::OutputGuardrail;
pub use loader::WorkflowLoader;
pub use normalizer::{ConfigNormalizer, NormalizerDefaults};
pub use spec::{AgentDef, CachePolicy, Process, RetryOnFail, TaskDef, WorkflowSpec};
pub use state::RunState;
pub use types::WorkflowDefinition;

// SPDX-License-Identifier: MIT

//! Workflow definition types as submitted by callers
//!
//! Two shapes are accepted. A graph definition lists `nodes` (agents and
//! tasks) connected by `edges`; a flat definition lists `agents` and `tasks`
//! with explicit `agent` and `context` references. Both deserialize into
//! [`WorkflowDefinition`] and are reconciled by the normalizer.

use super::guardrail::OutputGuardrail;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Root workflow definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Human readable run name
    #[serde(default, alias = "run_name")]
    pub name: Option<String>,

    /// `sequential` (default) or `parallel`
    #[serde(default)]
    pub process: Option<String>,

    /// Default model for agents that do not name one
    #[serde(default)]
    pub model: Option<String>,

    /// Default provider for agents that do not name one
    #[serde(default, alias = "provider")]
    pub llm_provider: Option<String>,

    /// Values substituted into `{placeholder}` markers of task and agent text
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,

    /// Requests-per-minute cap applied to agents without their own
    #[serde(default)]
    pub max_rpm: Option<u32>,

    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,

    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,

    #[serde(default)]
    pub agents: Vec<AgentDefinition>,

    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
}

impl WorkflowDefinition {
    pub fn is_graph(&self) -> bool {
        !self.nodes.is_empty()
    }
}

/// A graph node; `type` decides whether `data` describes an agent or a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub data: NodeData,
}

/// Union of agent and task fields carried by graph nodes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeData {
    #[serde(default, alias = "label")]
    pub name: Option<String>,

    #[serde(flatten)]
    pub agent: AgentFields,

    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub expected_output: Option<String>,
    #[serde(default, alias = "condition")]
    pub when: Option<String>,
    #[serde(default)]
    pub markdown: bool,
    #[serde(default)]
    pub config: TaskConfigDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDefinition {
    #[serde(default)]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
}

/// Fields shared by flat agents and agent nodes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentFields {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub backstory: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, alias = "model")]
    pub llm: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub max_iter: Option<u32>,
    #[serde(default)]
    pub max_retry_limit: Option<u32>,
    #[serde(default)]
    pub max_rpm: Option<u32>,
    /// Seconds an agent may spend on a single task
    #[serde(default)]
    pub max_execution_time: Option<u64>,
    #[serde(default)]
    pub memory: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub fields: AgentFields,
}

impl AgentDefinition {
    /// Identifier tasks use to reference this agent
    pub fn key(&self, index: usize) -> String {
        self.id
            .clone()
            .or_else(|| self.name.clone())
            .or_else(|| self.fields.role.clone())
            .unwrap_or_else(|| format!("agent_{}", index))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub description: String,
    #[serde(default)]
    pub expected_output: String,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub context: ContextRefs,
    #[serde(default, alias = "condition")]
    pub when: Option<String>,
    #[serde(default)]
    pub markdown: bool,
    #[serde(default)]
    pub config: TaskConfigDefinition,
}

impl TaskDefinition {
    pub fn key(&self, index: usize) -> String {
        self.id
            .clone()
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| format!("task_{}", index))
    }
}

/// Upstream task references: a single id, a list, or `{task_ids: [...]}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextRefs {
    #[default]
    None,
    Single(String),
    Multiple(Vec<String>),
    Keyed { task_ids: Vec<String> },
}

impl ContextRefs {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            ContextRefs::None => vec![],
            ContextRefs::Single(s) => vec![s.clone()],
            ContextRefs::Multiple(v) | ContextRefs::Keyed { task_ids: v } => v.clone(),
        }
    }
}

/// Per-task execution knobs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskConfigDefinition {
    #[serde(default)]
    pub cache_response: Option<bool>,
    /// Seconds a cached response stays valid
    #[serde(default)]
    pub cache_ttl: Option<u64>,
    #[serde(default)]
    pub retry_on_fail: Option<bool>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Seconds before a single attempt is abandoned
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub guardrail: Option<OutputGuardrail>,
}

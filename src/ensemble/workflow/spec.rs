// SPDX-License-Identifier: MIT

//! Canonical workflow form
//!
//! Whatever shape a definition was submitted in, the normalizer produces a
//! [`WorkflowSpec`]: agents and tasks with resolved references and every
//! default filled in. This is the snapshot stored on the execution record.

use super::guardrail::OutputGuardrail;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const DEFAULT_MAX_ITER: u32 = 25;
pub const DEFAULT_MAX_RETRY_LIMIT: u32 = 2;
pub const DEFAULT_TASK_MAX_RETRIES: u32 = 3;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Process {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub run_name: Option<String>,
    pub process: Process,
    pub inputs: BTreeMap<String, Value>,
    pub max_rpm: Option<u32>,
    pub agents: Vec<AgentDef>,
    pub tasks: Vec<TaskDef>,
}

impl WorkflowSpec {
    pub fn agent(&self, id: &str) -> Option<&AgentDef> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn task(&self, id: &str) -> Option<&TaskDef> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDef {
    pub id: String,
    pub role: String,
    pub goal: String,
    pub backstory: String,
    pub tools: Vec<String>,
    pub model: String,
    pub provider: String,
    pub max_iter: u32,
    /// Retries of transient model failures within one agent step
    #[serde(default = "default_max_retry_limit")]
    pub max_retry_limit: u32,
    pub max_rpm: Option<u32>,
    pub max_execution_time_secs: Option<u64>,
    pub memory: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDef {
    pub id: String,
    pub name: String,
    pub description: String,
    pub expected_output: String,
    pub agent: String,
    /// Upstream task ids, in declaration order
    pub context: Vec<String>,
    pub guard: Option<String>,
    pub cache: CachePolicy,
    pub retry: RetryOnFail,
    pub timeout_secs: Option<u64>,
    pub markdown: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardrail: Option<OutputGuardrail>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    pub enabled: bool,
    pub ttl_secs: u64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: DEFAULT_CACHE_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOnFail {
    pub enabled: bool,
    pub max_retries: u32,
}

impl Default for RetryOnFail {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: DEFAULT_TASK_MAX_RETRIES,
        }
    }
}

impl RetryOnFail {
    /// Total attempts a task gets, counting the first one.
    pub fn attempts(&self) -> u32 {
        if self.enabled {
            self.max_retries + 1
        } else {
            1
        }
    }
}

fn default_max_retry_limit() -> u32 {
    DEFAULT_MAX_RETRY_LIMIT
}

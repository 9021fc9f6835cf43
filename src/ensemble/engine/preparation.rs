// SPDX-License-Identifier: MIT

//! Binding a canonical workflow to runnable agents
//!
//! Preparation resolves every tool id and every agent's model, builds the
//! agents, parses task guards and allocates the execution's output directory.
//! Nothing here runs a task; a failure leaves no agent behind.

use super::provider::{ModelFactory, ProviderConfig, ProviderConfigResolver};
use super::registry::{ToolLookupError, ToolRegistry};
use crate::adk::agent::{Agent, LLMAgent, Persona};
use crate::adk::error::{BoxError, EnsembleError, PreparationError, ValidationError};
use crate::adk::model::{Model, RateLimitedModel};
use crate::adk::tool::Tool;
use crate::ensemble::workflow::guard::{self, Expression};
use crate::ensemble::workflow::{
    CachePolicy, OutputGuardrail, Process, RetryOnFail, TaskDef, WorkflowSpec,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AgentSpec {
    pub id: String,
    pub persona: Persona,
    pub provider: ProviderConfig,
    pub tools: Vec<Arc<dyn Tool>>,
    pub max_iterations: u32,
    pub max_retry_limit: u32,
    pub max_rpm: Option<u32>,
    pub max_execution_time: Option<Duration>,
    pub memory: bool,
}

impl std::fmt::Debug for AgentSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSpec")
            .field("id", &self.id)
            .field("role", &self.persona.role)
            .field("model", &self.provider.model)
            .field(
                "tools",
                &self.tools.iter().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: String,
    pub name: String,
    pub description: String,
    pub expected_output: String,
    pub agent: String,
    pub context: Vec<String>,
    pub guard: Option<Expression>,
    pub cache: CachePolicy,
    pub retry: RetryOnFail,
    pub timeout: Option<Duration>,
    pub markdown: bool,
    pub guardrail: Option<OutputGuardrail>,
}

impl TaskSpec {
    fn from_def(def: &TaskDef) -> Result<Self, ValidationError> {
        let guard = def
            .guard
            .as_deref()
            .map(guard::parse)
            .transpose()
            .map_err(|message| ValidationError::InvalidCondition {
                task: def.id.clone(),
                message,
            })?;
        Ok(Self {
            id: def.id.clone(),
            name: def.name.clone(),
            description: def.description.clone(),
            expected_output: def.expected_output.clone(),
            agent: def.agent.clone(),
            context: def.context.clone(),
            guard,
            cache: def.cache,
            retry: def.retry,
            timeout: def.timeout_secs.map(Duration::from_secs),
            markdown: def.markdown,
            guardrail: def.guardrail.clone(),
        })
    }
}

/// An agent spec together with the agent built from it
#[derive(Clone)]
pub struct BoundAgent {
    pub spec: AgentSpec,
    pub agent: Arc<dyn Agent>,
}

/// Everything the runner needs. Immutable once built.
pub struct PreparedWorkflow {
    pub execution_id: String,
    pub process: Process,
    pub inputs: BTreeMap<String, Value>,
    pub agents: HashMap<String, BoundAgent>,
    /// Declaration order
    pub tasks: Vec<TaskSpec>,
    pub output_dir: PathBuf,
}

/// Turns an agent spec into something that can run tasks
pub trait AgentFactory: Send + Sync {
    fn build(&self, spec: &AgentSpec) -> Result<Arc<dyn Agent>, BoxError>;
}

/// Builds [`LLMAgent`]s on top of a [`ModelFactory`]
pub struct LlmAgentFactory {
    models: Arc<dyn ModelFactory>,
}

impl LlmAgentFactory {
    pub fn new(models: Arc<dyn ModelFactory>) -> Self {
        Self { models }
    }
}

impl AgentFactory for LlmAgentFactory {
    fn build(&self, spec: &AgentSpec) -> Result<Arc<dyn Agent>, BoxError> {
        let mut model: Arc<dyn Model> = self.models.create(&spec.provider)?;
        if let Some(rpm) = spec.max_rpm {
            model = Arc::new(RateLimitedModel::new(model, rpm));
        }
        let agent = LLMAgent::new(
            spec.persona.role.clone(),
            spec.persona.clone(),
            model,
            spec.tools.clone(),
            spec.max_iterations,
        )
        .with_max_retry_limit(spec.max_retry_limit);
        Ok(Arc::new(agent))
    }
}

pub struct PreparationStage {
    tools: ToolRegistry,
    providers: Arc<ProviderConfigResolver>,
    agents: Arc<dyn AgentFactory>,
    output_root: PathBuf,
}

impl PreparationStage {
    pub fn new(
        tools: ToolRegistry,
        providers: Arc<ProviderConfigResolver>,
        agents: Arc<dyn AgentFactory>,
        output_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            tools,
            providers,
            agents,
            output_root: output_root.into(),
        }
    }

    /// Artifact directory of an execution
    pub fn output_dir(&self, execution_id: &str) -> PathBuf {
        self.output_root.join(execution_id)
    }

    pub async fn prepare(
        &self,
        execution_id: &str,
        spec: &WorkflowSpec,
    ) -> Result<PreparedWorkflow, EnsembleError> {
        let mut agents = HashMap::with_capacity(spec.agents.len());
        for def in &spec.agents {
            let tools = self.resolve_tools(&def.id, &def.tools).await?;
            let provider = self
                .providers
                .resolve(&def.model, &def.provider)
                .map_err(|e| e.for_agent(&def.id))?;

            let agent_spec = AgentSpec {
                id: def.id.clone(),
                persona: Persona {
                    role: def.role.clone(),
                    goal: def.goal.clone(),
                    backstory: def.backstory.clone(),
                },
                provider,
                tools,
                max_iterations: def.max_iter,
                max_retry_limit: def.max_retry_limit,
                max_rpm: def.max_rpm.or(spec.max_rpm),
                max_execution_time: def.max_execution_time_secs.map(Duration::from_secs),
                memory: def.memory,
            };
            let agent = self.agents.build(&agent_spec).map_err(|e| {
                PreparationError::AgentConstruction {
                    agent: def.id.clone(),
                    message: e.to_string(),
                }
            })?;
            log::debug!(
                "Prepared agent {} ({}) with {} tools for {}",
                agent_spec.id,
                agent_spec.provider.model,
                agent_spec.tools.len(),
                execution_id
            );
            agents.insert(def.id.clone(), BoundAgent { spec: agent_spec, agent });
        }

        let tasks = spec
            .tasks
            .iter()
            .map(TaskSpec::from_def)
            .collect::<Result<Vec<_>, _>>()?;
        for task in &tasks {
            if !agents.contains_key(&task.agent) {
                return Err(ValidationError::UnknownAgent {
                    task: task.id.clone(),
                    agent: task.agent.clone(),
                }
                .into());
            }
        }

        let output_dir = self.output_dir(execution_id);
        tokio::fs::create_dir_all(&output_dir).await.map_err(|e| {
            PreparationError::OutputArea {
                path: output_dir.display().to_string(),
                message: e.to_string(),
            }
        })?;

        Ok(PreparedWorkflow {
            execution_id: execution_id.to_string(),
            process: spec.process,
            inputs: spec.inputs.clone(),
            agents,
            tasks,
            output_dir,
        })
    }

    /// Resolve ids in order, keeping the first tool of each name.
    async fn resolve_tools(
        &self,
        agent: &str,
        ids: &[String],
    ) -> Result<Vec<Arc<dyn Tool>>, PreparationError> {
        let mut seen = HashSet::new();
        let mut tools = Vec::new();
        for id in ids {
            let resolved = self.tools.resolve(id).await.map_err(|e| match e {
                ToolLookupError::Unknown(tool) => PreparationError::UnknownTool {
                    agent: agent.to_string(),
                    tool,
                },
                ToolLookupError::Source { id, message } => {
                    PreparationError::ToolSource { tool: id, message }
                }
            })?;
            for tool in resolved {
                if seen.insert(tool.name().to_string()) {
                    tools.push(tool);
                } else {
                    log::debug!("Agent {} already has tool {}", agent, tool.name());
                }
            }
        }
        Ok(tools)
    }
}

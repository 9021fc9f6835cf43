// SPDX-License-Identifier: MIT

//! Workflow normalization - converts graph and flat definitions to the
//! canonical [`WorkflowSpec`] and rejects structurally invalid input
//!
//! All checks happen here, before an execution exists, so a broken
//! definition never reaches the background runner.

use super::guard;
use super::spec::{
    AgentDef, CachePolicy, Process, RetryOnFail, TaskDef, WorkflowSpec, DEFAULT_CACHE_TTL_SECS,
    DEFAULT_MAX_ITER, DEFAULT_MAX_RETRY_LIMIT, DEFAULT_TASK_MAX_RETRIES,
};
use super::types::{
    AgentFields, EdgeDefinition, NodeData, TaskConfigDefinition, WorkflowDefinition,
};
use crate::adk::error::ValidationError;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Model and provider used when a definition names neither
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizerDefaults {
    pub model: String,
    pub provider: String,
}

impl Default for NormalizerDefaults {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            provider: "openai".to_string(),
        }
    }
}

/// Infer a provider from a model name, e.g. `claude-3-5-sonnet` -> anthropic.
pub fn infer_provider(model: &str) -> Option<&'static str> {
    let lower = model.to_lowercase();
    if let Some((prefix, _)) = lower.split_once('/') {
        return match prefix {
            "openai" => Some("openai"),
            "anthropic" => Some("anthropic"),
            "deepseek" => Some("deepseek"),
            "ollama" => Some("ollama"),
            "databricks" => Some("databricks"),
            "gemini" => Some("gemini"),
            _ => None,
        };
    }
    if lower.starts_with("gpt") || lower.starts_with("o1") || lower.starts_with("o3") {
        Some("openai")
    } else if lower.starts_with("claude") {
        Some("anthropic")
    } else if lower.starts_with("gemini") {
        Some("gemini")
    } else if lower.starts_with("deepseek") {
        Some("deepseek")
    } else if lower.starts_with("databricks-") {
        Some("databricks")
    } else {
        None
    }
}

pub struct ConfigNormalizer {
    defaults: NormalizerDefaults,
}

struct Context<'a> {
    def: &'a WorkflowDefinition,
    defaults: &'a NormalizerDefaults,
}

impl ConfigNormalizer {
    pub fn new(defaults: NormalizerDefaults) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &NormalizerDefaults {
        &self.defaults
    }

    /// Normalize and validate a definition
    pub fn normalize(&self, def: &WorkflowDefinition) -> Result<WorkflowSpec, ValidationError> {
        let ctx = Context {
            def,
            defaults: &self.defaults,
        };

        let process = match def.process.as_deref().map(str::to_lowercase).as_deref() {
            None | Some("sequential") => Process::Sequential,
            Some("parallel") => Process::Parallel,
            Some(other) => return Err(ValidationError::UnsupportedProcess(other.to_string())),
        };

        let (agents, tasks) = if def.is_graph() {
            normalize_graph(&ctx)?
        } else {
            normalize_flat(&ctx)?
        };

        if agents.is_empty() {
            return Err(ValidationError::Empty("agents"));
        }
        if tasks.is_empty() {
            return Err(ValidationError::Empty("tasks"));
        }

        validate_references(&agents, &tasks)?;
        check_acyclic(&tasks)?;

        Ok(WorkflowSpec {
            run_name: def.name.clone().filter(|n| !n.trim().is_empty()),
            process,
            inputs: def.inputs.clone(),
            max_rpm: def.max_rpm,
            agents,
            tasks,
        })
    }
}

impl Default for ConfigNormalizer {
    fn default() -> Self {
        Self::new(NormalizerDefaults::default())
    }
}

fn normalize_flat(ctx: &Context) -> Result<(Vec<AgentDef>, Vec<TaskDef>), ValidationError> {
    let agents = ctx
        .def
        .agents
        .iter()
        .enumerate()
        .map(|(i, a)| build_agent(ctx, a.key(i), a.name.as_deref(), &a.fields))
        .collect();

    let mut tasks = Vec::with_capacity(ctx.def.tasks.len());
    for (i, t) in ctx.def.tasks.iter().enumerate() {
        let id = t.key(i);
        let agent = t
            .agent
            .clone()
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| ValidationError::MissingAgent { task: id.clone() })?;
        let mut task = build_task(
            ctx,
            id,
            t.name.as_deref(),
            Some(&t.description),
            &t.expected_output,
            t.when.as_deref(),
            t.markdown,
            &t.config,
        )?;
        task.agent = agent;
        task.context = dedup(t.context.to_vec());
        tasks.push(task);
    }
    Ok((agents, tasks))
}

enum NodeKind {
    Agent,
    Task,
}

fn normalize_graph(ctx: &Context) -> Result<(Vec<AgentDef>, Vec<TaskDef>), ValidationError> {
    let mut kinds: HashMap<&str, NodeKind> = HashMap::new();
    let mut agents = Vec::new();
    let mut tasks = Vec::new();

    for node in &ctx.def.nodes {
        if kinds.contains_key(node.id.as_str()) {
            return Err(ValidationError::DuplicateId(node.id.clone()));
        }
        match node.node_type.as_str() {
            "agent" | "agentNode" => {
                kinds.insert(&node.id, NodeKind::Agent);
                agents.push(build_agent(
                    ctx,
                    node.id.clone(),
                    node.data.name.as_deref(),
                    &node.data.agent,
                ));
            }
            "task" | "taskNode" => {
                kinds.insert(&node.id, NodeKind::Task);
                tasks.push(build_graph_task(ctx, &node.id, &node.data)?);
            }
            other => {
                return Err(ValidationError::UnknownNodeType {
                    node: node.id.clone(),
                    node_type: other.to_string(),
                })
            }
        }
    }

    let task_index: HashMap<String, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.clone(), i))
        .collect();

    for edge in &ctx.def.edges {
        let (source, target) = (edge.source.as_str(), edge.target.as_str());
        match (
            endpoint(&kinds, edge, source)?,
            endpoint(&kinds, edge, target)?,
        ) {
            (NodeKind::Agent, NodeKind::Task) => {
                let task = &mut tasks[task_index[target]];
                if !task.agent.is_empty() && task.agent != source {
                    return Err(ValidationError::ConflictingAssignment {
                        task: target.to_string(),
                    });
                }
                task.agent = source.to_string();
            }
            (NodeKind::Task, NodeKind::Task) => {
                let task = &mut tasks[task_index[target]];
                if !task.context.iter().any(|c| c == source) {
                    task.context.push(source.to_string());
                }
            }
            _ => {
                return Err(ValidationError::InvalidEdge {
                    from: source.to_string(),
                    to: target.to_string(),
                })
            }
        }
    }

    if let Some(orphan) = tasks.iter().find(|t| t.agent.is_empty()) {
        return Err(ValidationError::MissingAgent {
            task: orphan.id.clone(),
        });
    }
    Ok((agents, tasks))
}

fn endpoint<'k>(
    kinds: &'k HashMap<&str, NodeKind>,
    edge: &EdgeDefinition,
    id: &str,
) -> Result<&'k NodeKind, ValidationError> {
    kinds.get(id).ok_or_else(|| ValidationError::UnknownReference {
        from: edge
            .id
            .clone()
            .unwrap_or_else(|| format!("{}->{}", edge.source, edge.target)),
        to: id.to_string(),
    })
}

fn build_graph_task(ctx: &Context, id: &str, data: &NodeData) -> Result<TaskDef, ValidationError> {
    build_task(
        ctx,
        id.to_string(),
        data.name.as_deref(),
        data.description.as_deref(),
        data.expected_output.as_deref().unwrap_or_default(),
        data.when.as_deref(),
        data.markdown,
        &data.config,
    )
}

fn build_agent(ctx: &Context, id: String, name: Option<&str>, fields: &AgentFields) -> AgentDef {
    let inputs = &ctx.def.inputs;
    let model = fields
        .llm
        .clone()
        .or_else(|| ctx.def.model.clone())
        .unwrap_or_else(|| ctx.defaults.model.clone());
    let provider = fields
        .provider
        .clone()
        .or_else(|| fields.llm.as_deref().and_then(infer_provider).map(String::from))
        .or_else(|| ctx.def.llm_provider.clone())
        .or_else(|| infer_provider(&model).map(String::from))
        .unwrap_or_else(|| ctx.defaults.provider.clone())
        .to_lowercase();

    let role = fields
        .role
        .clone()
        .or_else(|| name.map(String::from))
        .unwrap_or_else(|| id.clone());

    AgentDef {
        role: interpolate(&role, inputs),
        goal: interpolate(fields.goal.as_deref().unwrap_or_default(), inputs),
        backstory: interpolate(fields.backstory.as_deref().unwrap_or_default(), inputs),
        tools: dedup(fields.tools.clone()),
        model,
        provider,
        max_iter: fields.max_iter.unwrap_or(DEFAULT_MAX_ITER),
        max_retry_limit: fields.max_retry_limit.unwrap_or(DEFAULT_MAX_RETRY_LIMIT),
        max_rpm: fields.max_rpm,
        max_execution_time_secs: fields.max_execution_time,
        memory: fields.memory.unwrap_or(true),
        id,
    }
}

#[allow(clippy::too_many_arguments)]
fn build_task(
    ctx: &Context,
    id: String,
    name: Option<&str>,
    description: Option<&str>,
    expected_output: &str,
    when: Option<&str>,
    markdown: bool,
    config: &TaskConfigDefinition,
) -> Result<TaskDef, ValidationError> {
    let inputs = &ctx.def.inputs;
    let description = description
        .filter(|d| !d.trim().is_empty())
        .ok_or_else(|| ValidationError::Malformed(format!("task '{}' has no description", id)))?;

    let guard = when.map(str::trim).filter(|w| !w.is_empty()).map(String::from);
    if let Some(expr) = &guard {
        guard::parse(expr).map_err(|message| ValidationError::InvalidCondition {
            task: id.clone(),
            message,
        })?;
    }

    if let Some(guardrail) = &config.guardrail {
        guardrail
            .validate_settings()
            .map_err(|message| ValidationError::InvalidGuardrail {
                task: id.clone(),
                message,
            })?;
    }

    Ok(TaskDef {
        name: name.map(String::from).unwrap_or_else(|| id.clone()),
        description: interpolate(description, inputs),
        expected_output: interpolate(expected_output, inputs),
        agent: String::new(),
        context: Vec::new(),
        guard,
        cache: CachePolicy {
            enabled: config.cache_response.unwrap_or(false),
            ttl_secs: config.cache_ttl.unwrap_or(DEFAULT_CACHE_TTL_SECS),
        },
        retry: RetryOnFail {
            enabled: config.retry_on_fail.unwrap_or(false),
            max_retries: config.max_retries.unwrap_or(DEFAULT_TASK_MAX_RETRIES),
        },
        timeout_secs: config.timeout,
        markdown,
        guardrail: config.guardrail.clone(),
        id,
    })
}

fn validate_references(agents: &[AgentDef], tasks: &[TaskDef]) -> Result<(), ValidationError> {
    let mut agent_ids = HashSet::new();
    for agent in agents {
        if !agent_ids.insert(agent.id.as_str()) {
            return Err(ValidationError::DuplicateId(agent.id.clone()));
        }
    }
    let mut task_ids = HashSet::new();
    for task in tasks {
        if !task_ids.insert(task.id.as_str()) {
            return Err(ValidationError::DuplicateId(task.id.clone()));
        }
    }

    for task in tasks {
        if !agent_ids.contains(task.agent.as_str()) {
            return Err(ValidationError::UnknownAgent {
                task: task.id.clone(),
                agent: task.agent.clone(),
            });
        }
        if let Some(missing) = task.context.iter().find(|c| !task_ids.contains(c.as_str())) {
            return Err(ValidationError::UnknownReference {
                from: task.id.clone(),
                to: missing.clone(),
            });
        }
    }
    Ok(())
}

/// Kahn's algorithm over task context edges; whatever cannot be ordered is
/// part of (or downstream of) a cycle.
fn check_acyclic(tasks: &[TaskDef]) -> Result<(), ValidationError> {
    let mut in_degree: HashMap<&str, usize> = tasks
        .iter()
        .map(|t| (t.id.as_str(), t.context.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        for dep in &task.context {
            dependents.entry(dep.as_str()).or_default().push(task.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = tasks
        .iter()
        .filter(|t| t.context.is_empty())
        .map(|t| t.id.as_str())
        .collect();
    let mut ordered = 0;
    while let Some(id) = queue.pop_front() {
        ordered += 1;
        for next in dependents.get(id).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(next) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(*next);
                }
            }
        }
    }

    if ordered == tasks.len() {
        return Ok(());
    }
    let stuck = tasks
        .iter()
        .filter(|t| in_degree.get(t.id.as_str()).is_some_and(|d| *d > 0))
        .map(|t| t.id.clone())
        .collect();
    Err(ValidationError::DependencyCycle(stuck))
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

/// Replace `{key}` markers with workflow inputs; unknown markers are kept.
pub fn interpolate(text: &str, inputs: &BTreeMap<String, Value>) -> String {
    if inputs.is_empty() || !text.contains('{') {
        return text.to_string();
    }
    let mut out = text.to_string();
    for (key, value) in inputs {
        let marker = format!("{{{}}}", key);
        if out.contains(&marker) {
            let replacement = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out = out.replace(&marker, &replacement);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::workflow::loader::WorkflowLoader;
    use crate::ensemble::workflow::OutputGuardrail;

    fn normalize(yaml: &str) -> Result<WorkflowSpec, ValidationError> {
        ConfigNormalizer::default().normalize(&WorkflowLoader::parse_yaml(yaml).unwrap())
    }

    const FLAT: &str = r#"
inputs: { topic: tides }
agents:
  - { id: a, role: "Analyst of {topic}", goal: g, llm: claude-3-5-sonnet }
  - { id: b, role: Writer, goal: g, provider: ollama, llm: llama3-8b }
tasks:
  - { id: t1, description: "Study {topic}", expected_output: notes, agent: a }
  - { id: t2, description: Write, expected_output: text, agent: b, context: [t1],
      config: { cache_response: true, retry_on_fail: true } }
"#;

    #[test]
    fn test_flat_definition_fills_defaults() {
        let spec = normalize(FLAT).unwrap();
        assert_eq!(spec.process, Process::Sequential);

        let a = spec.agent("a").unwrap();
        assert_eq!(a.role, "Analyst of tides");
        assert_eq!(a.provider, "anthropic");
        assert_eq!(a.max_iter, DEFAULT_MAX_ITER);
        assert_eq!(a.max_retry_limit, DEFAULT_MAX_RETRY_LIMIT);
        assert!(a.memory);
        assert_eq!(spec.agent("b").unwrap().provider, "ollama");

        let t1 = spec.task("t1").unwrap();
        assert_eq!(t1.description, "Study tides");
        assert!(!t1.cache.enabled);

        let t2 = spec.task("t2").unwrap();
        assert_eq!(t2.context, vec!["t1"]);
        assert!(t2.cache.enabled);
        assert_eq!(t2.cache.ttl_secs, DEFAULT_CACHE_TTL_SECS);
        assert_eq!(t2.retry.attempts(), DEFAULT_TASK_MAX_RETRIES + 1);
    }

    #[test]
    fn test_default_model_and_provider() {
        let spec = normalize(
            r#"
agents: [{ id: a, role: R }]
tasks: [{ id: t, description: d, agent: a }]
"#,
        )
        .unwrap();
        let a = spec.agent("a").unwrap();
        assert_eq!(a.model, "gpt-4o");
        assert_eq!(a.provider, "openai");
    }

    #[test]
    fn test_graph_definition() {
        let spec = normalize(
            r#"
process: parallel
nodes:
  - { id: writer, type: agentNode, data: { role: Writer, goal: Write } }
  - { id: draft, type: taskNode, data: { description: Draft, expected_output: text } }
  - { id: polish, type: taskNode, data: { description: Polish, when: "output.draft" } }
edges:
  - { source: writer, target: draft }
  - { source: writer, target: polish }
  - { source: draft, target: polish }
"#,
        )
        .unwrap();
        assert_eq!(spec.process, Process::Parallel);
        let polish = spec.task("polish").unwrap();
        assert_eq!(polish.agent, "writer");
        assert_eq!(polish.context, vec!["draft"]);
        assert_eq!(polish.guard.as_deref(), Some("output.draft"));
    }

    #[test]
    fn test_task_guardrail_is_carried_and_checked() {
        let spec = normalize(
            r#"
agents: [{ id: a, role: R }]
tasks:
  - id: t
    description: Count companies
    agent: a
    config:
      retry_on_fail: true
      guardrail: { type: minimum_number, field_name: companies, min_value: 3 }
"#,
        )
        .unwrap();
        assert_eq!(
            spec.task("t").unwrap().guardrail,
            Some(OutputGuardrail::MinimumNumber {
                field_name: "companies".into(),
                min_value: 3.0,
                message: None,
            })
        );

        let err = normalize(
            r#"
agents: [{ id: a, role: R }]
tasks:
  - id: t
    description: Summarize
    agent: a
    config: { guardrail: { type: length, min: 50, max: 10 } }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidGuardrail { ref task, .. } if task == "t"));
    }

    #[test]
    fn test_task_without_agent_is_rejected() {
        let err = normalize(
            r#"
nodes:
  - { id: writer, type: agentNode, data: { role: Writer } }
  - { id: draft, type: taskNode, data: { description: Draft } }
"#,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingAgent {
                task: "draft".into()
            }
        );

        let err = normalize(
            r#"
agents: [{ id: a, role: R }]
tasks: [{ id: t, description: d }]
"#,
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::MissingAgent { task: "t".into() });
    }

    #[test]
    fn test_edge_to_unknown_node_is_rejected() {
        let err = normalize(
            r#"
nodes:
  - { id: writer, type: agentNode, data: { role: Writer } }
  - { id: draft, type: taskNode, data: { description: Draft } }
edges:
  - { source: writer, target: draft }
  - { source: ghost, target: draft }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::UnknownReference { ref to, .. } if to == "ghost"));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = normalize(
            r#"
agents: [{ id: a, role: R }]
tasks:
  - { id: x, description: d, agent: a, context: [z] }
  - { id: y, description: d, agent: a, context: [x] }
  - { id: z, description: d, agent: a, context: [y] }
  - { id: free, description: d, agent: a }
"#,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::DependencyCycle(vec!["x".into(), "y".into(), "z".into()])
        );
    }

    #[test]
    fn test_other_structural_errors() {
        assert_eq!(
            normalize("agents: []\ntasks: []").unwrap_err(),
            ValidationError::Empty("agents")
        );
        assert!(matches!(
            normalize(
                r#"
process: round-robin
agents: [{ id: a, role: R }]
tasks: [{ id: t, description: d, agent: a }]
"#
            )
            .unwrap_err(),
            ValidationError::UnsupportedProcess(_)
        ));
        assert!(matches!(
            normalize(
                r#"
agents: [{ id: a, role: R }]
tasks: [{ id: t, description: d, agent: b }]
"#
            )
            .unwrap_err(),
            ValidationError::UnknownAgent { .. }
        ));
        assert!(matches!(
            normalize(
                r#"
agents: [{ id: a, role: R }]
tasks: [{ id: t, description: d, agent: a, when: "score >" }]
"#
            )
            .unwrap_err(),
            ValidationError::InvalidCondition { .. }
        ));
        assert!(matches!(
            normalize(
                r#"
nodes:
  - { id: a, type: agentNode, data: { role: R } }
  - { id: b, type: agentNode, data: { role: S } }
edges: [{ source: a, target: b }]
"#
            )
            .unwrap_err(),
            ValidationError::InvalidEdge { .. }
        ));
    }

    #[test]
    fn test_infer_provider() {
        assert_eq!(infer_provider("gpt-4o-mini"), Some("openai"));
        assert_eq!(infer_provider("deepseek/deepseek-chat"), Some("deepseek"));
        assert_eq!(infer_provider("gemini-1.5-pro"), Some("gemini"));
        assert_eq!(infer_provider("mistral-large"), None);
    }
}

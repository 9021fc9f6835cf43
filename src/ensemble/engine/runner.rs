// SPDX-License-Identifier: MIT

//! Task scheduling for a prepared workflow
//!
//! A task becomes eligible once every task in its context has finished;
//! eligible tasks are taken in declaration order. Sequential runs take one
//! task per round, parallel runs take the whole eligible wave and join it.
//! The cancel flag is checked before each round and before each task retry,
//! never in the middle of an attempt. Observing it raises
//! [`EnsembleError::CancellationRequested`], which [`AsyncExecutionRunner::run`]
//! reports as [`RunOutcome::Cancelled`].

use super::cache::ResultCache;
use super::preparation::{BoundAgent, PreparedWorkflow, TaskSpec};
use super::trace::{TraceCollector, TraceEventKind};
use crate::adk::agent::AgentEvent;
use crate::adk::error::EnsembleError;
use crate::ensemble::workflow::guard;
use crate::ensemble::workflow::{Process, RunState};
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Cooperative cancellation signal shared between coordinator and runner
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn checkpoint(&self) -> Result<(), EnsembleError> {
        if self.is_cancelled() {
            return Err(EnsembleError::CancellationRequested);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(Value),
    Failed(EnsembleError),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Wait before the second attempt of a task; doubles on each retry
    pub task_retry_delay: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            task_retry_delay: Duration::from_secs(1),
        }
    }
}

enum TaskResult {
    Done(String),
    Skipped,
}

pub struct AsyncExecutionRunner {
    cache: Arc<ResultCache>,
    options: RunnerOptions,
}

impl AsyncExecutionRunner {
    pub fn new(cache: Arc<ResultCache>, options: RunnerOptions) -> Self {
        Self { cache, options }
    }

    pub async fn run(
        &self,
        workflow: &PreparedWorkflow,
        trace: &TraceCollector,
        cancel: &CancelFlag,
    ) -> RunOutcome {
        match self.run_tasks(workflow, trace, cancel).await {
            Ok(result) => RunOutcome::Completed(result),
            Err(EnsembleError::CancellationRequested) => {
                log::info!("Execution {} cancelled", workflow.execution_id);
                RunOutcome::Cancelled
            }
            Err(e) => RunOutcome::Failed(e),
        }
    }

    async fn run_tasks(
        &self,
        workflow: &PreparedWorkflow,
        trace: &TraceCollector,
        cancel: &CancelFlag,
    ) -> Result<Value, EnsembleError> {
        let mut state = RunState::new(&workflow.inputs);
        let mut outputs: HashMap<String, String> = HashMap::new();
        let mut skipped: HashSet<String> = HashSet::new();
        let mut memory: HashMap<String, Vec<String>> = HashMap::new();
        let mut pending: Vec<&TaskSpec> = workflow.tasks.iter().collect();

        while !pending.is_empty() {
            cancel.checkpoint()?;

            let ready: Vec<&TaskSpec> = pending
                .iter()
                .filter(|t| t.context.iter().all(|dep| outputs.contains_key(dep)))
                .copied()
                .collect();
            if ready.is_empty() {
                return Err(EnsembleError::other(format!(
                    "No runnable task among {:?}",
                    pending.iter().map(|t| t.id.as_str()).collect::<Vec<_>>()
                )));
            }
            let wave = match workflow.process {
                Process::Sequential => &ready[..1],
                Process::Parallel => &ready[..],
            };

            let results = join_all(
                wave.iter()
                    .map(|task| self.run_task(workflow, task, &state, &outputs, &memory, trace, cancel)),
            )
            .await;

            for (task, result) in wave.iter().zip(results) {
                match result? {
                    TaskResult::Skipped => {
                        skipped.insert(task.id.clone());
                        state.record_output(&task.id, "");
                        outputs.insert(task.id.clone(), String::new());
                    }
                    TaskResult::Done(output) => {
                        write_output(workflow, task, &output).await;
                        state.record_output(&task.id, &output);
                        let remembers = workflow
                            .agents
                            .get(&task.agent)
                            .is_some_and(|a| a.spec.memory);
                        if remembers {
                            memory
                                .entry(task.agent.clone())
                                .or_default()
                                .push(output.clone());
                        }
                        outputs.insert(task.id.clone(), output);
                    }
                }
            }
            pending.retain(|t| !outputs.contains_key(&t.id));
        }

        let final_output = workflow
            .tasks
            .iter()
            .rev()
            .find(|t| !skipped.contains(&t.id))
            .and_then(|t| outputs.get(&t.id))
            .cloned()
            .unwrap_or_default();
        let mut task_outputs = Map::new();
        for task in &workflow.tasks {
            if let Some(output) = outputs.get(&task.id) {
                task_outputs.insert(task.id.clone(), Value::String(output.clone()));
            }
        }

        Ok(json!({
            "final_output": final_output,
            "task_outputs": task_outputs,
            "skipped": workflow.tasks.iter().filter(|t| skipped.contains(&t.id)).map(|t| t.id.as_str()).collect::<Vec<_>>(),
            "output_dir": workflow.output_dir.display().to_string(),
        }))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_task(
        &self,
        workflow: &PreparedWorkflow,
        task: &TaskSpec,
        state: &RunState,
        outputs: &HashMap<String, String>,
        memory: &HashMap<String, Vec<String>>,
        trace: &TraceCollector,
        cancel: &CancelFlag,
    ) -> Result<TaskResult, EnsembleError> {
        let bound = workflow.agents.get(&task.agent).ok_or_else(|| {
            EnsembleError::runtime(&task.id, format!("agent '{}' was not prepared", task.agent))
        })?;
        let role = bound.spec.persona.role.as_str();

        if let Some(condition) = &task.guard {
            if !guard::evaluate(condition, state) {
                log::info!("Skipping task {}: condition is false", task.id);
                trace.emit(
                    TraceEventKind::TaskSkipped,
                    Some(&task.id),
                    Some(role),
                    json!({ "reason": "condition evaluated to false" }),
                );
                return Ok(TaskResult::Skipped);
            }
        }

        let recalled = if bound.spec.memory {
            memory.get(&task.agent).map(Vec::as_slice)
        } else {
            None
        };
        let input = render_input(workflow, task, outputs, recalled);
        let attempts = task.retry.attempts();
        trace.emit(
            TraceEventKind::TaskStarted,
            Some(&task.id),
            Some(role),
            json!({ "name": task.name, "max_attempts": attempts }),
        );

        let cache_key = task
            .cache
            .enabled
            .then(|| ResultCache::fingerprint(role, &bound.spec.provider.model, &input));
        let cache_ttl = Duration::from_secs(task.cache.ttl_secs);
        if let Some(key) = &cache_key {
            if let Some(output) = self.cache.get(key) {
                trace.emit(
                    TraceEventKind::CacheHit,
                    Some(&task.id),
                    Some(role),
                    json!({ "fingerprint": key }),
                );
                trace.emit(
                    TraceEventKind::TaskCompleted,
                    Some(&task.id),
                    Some(role),
                    json!({ "output": output, "cached": true }),
                );
                return Ok(TaskResult::Done(output));
            }
        }

        let mut attempt = 1;
        let mut attempt_input = input.clone();
        loop {
            let result = match attempt_task(bound, task, &attempt_input, trace).await {
                Ok(output) => match task.guardrail.as_ref().map(|g| g.check(&output)) {
                    Some(Err(feedback)) => {
                        log::info!("Task {} output rejected: {}", task.id, feedback);
                        attempt_input = with_feedback(&input, &feedback);
                        Err(format!("Output rejected by guardrail: {}", feedback))
                    }
                    _ => Ok(output),
                },
                Err(message) => Err(message),
            };
            match result {
                Ok(output) => {
                    if let Some(key) = cache_key {
                        self.cache.put(key, output.clone(), cache_ttl);
                    }
                    trace.emit(
                        TraceEventKind::TaskCompleted,
                        Some(&task.id),
                        Some(role),
                        json!({ "output": output, "attempt": attempt }),
                    );
                    return Ok(TaskResult::Done(output));
                }
                Err(message) if attempt < attempts => {
                    let factor = 2u32.saturating_pow(attempt - 1);
                    let delay = self.options.task_retry_delay.saturating_mul(factor);
                    log::warn!(
                        "Task {} attempt {}/{} failed: {}; retrying in {:?}",
                        task.id,
                        attempt,
                        attempts,
                        message,
                        delay
                    );
                    trace.emit(
                        TraceEventKind::TaskRetry,
                        Some(&task.id),
                        Some(role),
                        json!({
                            "attempt": attempt,
                            "max_attempts": attempts,
                            "error": message,
                            "delay_ms": delay.as_millis() as u64,
                        }),
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    cancel.checkpoint()?;
                    attempt += 1;
                }
                Err(message) => {
                    log::error!("Task {} failed after {} attempts: {}", task.id, attempt, message);
                    trace.emit(
                        TraceEventKind::TaskFailed,
                        Some(&task.id),
                        Some(role),
                        json!({ "error": message, "attempts": attempt }),
                    );
                    return Err(EnsembleError::runtime(&task.id, message));
                }
            }
        }
    }
}

/// Task input for the attempt after a guardrail rejection
fn with_feedback(input: &str, feedback: &str) -> String {
    format!(
        "{}\n\nYour previous answer was rejected: {}\nRevise it to address this.",
        input, feedback
    )
}

/// One call to the agent, bounded by the task timeout and the agent's
/// execution time limit, whichever is shorter. Agent events are forwarded to
/// the trace while the call runs.
async fn attempt_task(
    bound: &BoundAgent,
    task: &TaskSpec,
    input: &str,
    trace: &TraceCollector,
) -> Result<String, String> {
    let limit = match (task.timeout, bound.spec.max_execution_time) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    let role = bound.spec.persona.role.as_str();
    let (tx, mut rx) = mpsc::channel(32);
    let agent = bound.agent.clone();
    let input = input.to_string();

    let call = async move {
        let fut = agent.run_stream(input, tx);
        let result = match limit {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => return Err(format!("timed out after {:?}", limit)),
            },
            None => fut.await,
        };
        result.map_err(|e| e.to_string())
    };
    let forward = async {
        while let Some(event) = rx.recv().await {
            forward_event(trace, &task.id, role, event);
        }
    };

    let (result, ()) = tokio::join!(call, forward);
    result
}

fn forward_event(trace: &TraceCollector, task_id: &str, role: &str, event: AgentEvent) {
    let (kind, payload) = match event {
        AgentEvent::StepStarted { step } => (TraceEventKind::AgentStepStart, json!({ "step": step })),
        AgentEvent::StepFinished { step } => (TraceEventKind::AgentStepEnd, json!({ "step": step })),
        AgentEvent::ToolCall { name, args } => {
            (TraceEventKind::ToolInvoked, json!({ "tool": name, "args": args }))
        }
        AgentEvent::ToolResult { name, result } => (
            TraceEventKind::DetailedOutput,
            json!({ "tool": name, "result": result }),
        ),
        AgentEvent::Thought(text) => (TraceEventKind::DetailedOutput, json!({ "thought": text })),
        AgentEvent::Answer(text) => (TraceEventKind::DetailedOutput, json!({ "answer": text })),
        AgentEvent::Error(text) => (TraceEventKind::DetailedOutput, json!({ "error": text })),
    };
    trace.emit(kind, Some(task_id), Some(role), payload);
}

fn render_input(
    workflow: &PreparedWorkflow,
    task: &TaskSpec,
    outputs: &HashMap<String, String>,
    recalled: Option<&[String]>,
) -> String {
    let mut input = task.description.clone();
    if !task.expected_output.is_empty() {
        input.push_str("\n\nExpected output: ");
        input.push_str(&task.expected_output);
    }
    if task.markdown {
        input.push_str("\n\nYour final answer MUST be formatted in Markdown syntax.");
    }

    let context: Vec<(&str, &str)> = task
        .context
        .iter()
        .filter_map(|id| {
            let output = outputs.get(id).filter(|o| !o.is_empty())?;
            let name = workflow
                .tasks
                .iter()
                .find(|t| &t.id == id)
                .map_or(id.as_str(), |t| t.name.as_str());
            Some((name, output.as_str()))
        })
        .collect();
    if !context.is_empty() {
        input.push_str("\n\nContext from earlier tasks:");
        for (name, output) in context {
            input.push_str(&format!("\n\n## {}\n{}", name, output));
        }
    }

    if let Some(earlier) = recalled.filter(|e| !e.is_empty()) {
        input.push_str("\n\nYour earlier work in this run:");
        for output in earlier {
            input.push_str("\n- ");
            input.push_str(output);
        }
    }
    input
}

async fn write_output(workflow: &PreparedWorkflow, task: &TaskSpec, output: &str) {
    let extension = if task.markdown { "md" } else { "txt" };
    let path = workflow
        .output_dir
        .join(format!("{}.{}", sanitize(&task.id), extension));
    if let Err(e) = tokio::fs::write(&path, output).await {
        log::warn!("Could not write output of task {} to {:?}: {}", task.id, path, e);
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

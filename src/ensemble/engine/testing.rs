// SPDX-License-Identifier: MIT

//! Test doubles shared by the engine's unit tests

use super::execution::Execution;
use super::preparation::{AgentFactory, AgentSpec};
use super::store::{ExecutionStore, MemoryStore, StoreResult, TraceStore};
use super::trace::TraceEvent;
use crate::adk::agent::{Agent, AgentEvent};
use crate::adk::error::{BoxError, PersistenceError};
use crate::adk::tool::Tool;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

static MOCK_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {}
    })
});

pub(crate) struct MockTool {
    name: String,
    description: String,
}

impl MockTool {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: format!("Mock tool: {}", name),
        }
    }
}

#[async_trait]
impl Tool for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> &Value {
        &MOCK_SCHEMA
    }

    async fn execute(&self, _input: Value) -> Result<Value, BoxError> {
        Ok(json!({"result": "mock"}))
    }
}

// ---------------------------------------------------------------------------
// FlakyStore
// ---------------------------------------------------------------------------

/// MemoryStore whose execution and trace writes fail or stall on demand
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    failures_left: AtomicU32,
    fatal: bool,
    save_attempts: AtomicU32,
    trace_failures_left: AtomicU32,
    trace_delay: Duration,
    append_attempts: AtomicU32,
}

impl FlakyStore {
    /// First `n` saves fail with a retryable error.
    pub(crate) fn failing_first(n: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures_left: AtomicU32::new(n),
            fatal: false,
            save_attempts: AtomicU32::new(0),
            trace_failures_left: AtomicU32::new(0),
            trace_delay: Duration::ZERO,
            append_attempts: AtomicU32::new(0),
        }
    }

    /// First `n` trace appends fail with a retryable error.
    pub(crate) fn with_trace_failures(mut self, n: u32) -> Self {
        self.trace_failures_left = AtomicU32::new(n);
        self
    }

    /// Every trace append sleeps this long before writing.
    pub(crate) fn with_slow_traces(mut self, delay: Duration) -> Self {
        self.trace_delay = delay;
        self
    }

    pub(crate) fn append_attempts(&self) -> u32 {
        self.append_attempts.load(Ordering::SeqCst)
    }

    /// Every save fails with a non-retryable error.
    pub(crate) fn rejecting() -> Self {
        Self {
            fatal: true,
            ..Self::failing_first(0)
        }
    }

    pub(crate) fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub(crate) fn save_attempts(&self) -> u32 {
        self.save_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionStore for FlakyStore {
    async fn save_execution(&self, execution: &Execution) -> StoreResult<()> {
        self.save_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fatal {
            return Err(PersistenceError::Conflict("rejected".into()));
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PersistenceError::Unavailable("injected".into()));
        }
        self.inner.save_execution(execution).await
    }

    async fn load_execution(&self, id: &str) -> StoreResult<Option<Execution>> {
        self.inner.load_execution(id).await
    }

    async fn list_executions(&self) -> StoreResult<Vec<Execution>> {
        self.inner.list_executions().await
    }

    async fn delete_execution(&self, id: &str) -> StoreResult<bool> {
        self.inner.delete_execution(id).await
    }
}

#[async_trait]
impl TraceStore for FlakyStore {
    async fn append_events(&self, events: &[TraceEvent]) -> StoreResult<()> {
        self.append_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.trace_delay.is_zero() {
            tokio::time::sleep(self.trace_delay).await;
        }
        let failing = self
            .trace_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PersistenceError::Unavailable("injected".into()));
        }
        self.inner.append_events(events).await
    }

    async fn read_events(
        &self,
        execution_id: &str,
        after: u64,
        limit: usize,
    ) -> StoreResult<Vec<TraceEvent>> {
        self.inner.read_events(execution_id, after, limit).await
    }

    async fn delete_trace(&self, execution_id: &str) -> StoreResult<()> {
        self.inner.delete_trace(execution_id).await
    }
}

// ---------------------------------------------------------------------------
// ScriptedAgent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Answer(String),
    Fail(String),
    Panic,
    /// Sleep before answering
    Slow(Duration, String),
}

/// Agent that plays back a list of replies, then echoes its role
pub(crate) struct ScriptedAgent {
    name: String,
    replies: Mutex<VecDeque<Reply>>,
    inputs: Mutex<Vec<String>>,
}

impl ScriptedAgent {
    pub(crate) fn new(name: &str, replies: Vec<Reply>) -> Self {
        Self {
            name: name.to_string(),
            replies: Mutex::new(replies.into()),
            inputs: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn inputs(&self) -> Vec<String> {
        self.inputs.lock().unwrap().clone()
    }

    pub(crate) fn calls(&self) -> usize {
        self.inputs.lock().unwrap().len()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, input: String) -> Result<String, BoxError> {
        let (tx, _rx) = mpsc::channel(1);
        self.run_stream(input, tx).await
    }

    async fn run_stream(
        &self,
        input: String,
        tx: mpsc::Sender<AgentEvent>,
    ) -> Result<String, BoxError> {
        self.inputs.lock().unwrap().push(input);
        let reply = self.replies.lock().unwrap().pop_front();
        let _ = tx.send(AgentEvent::StepStarted { step: 1 }).await;
        let outcome = match reply {
            Some(Reply::Answer(text)) => Ok(text),
            Some(Reply::Fail(message)) => Err(message.into()),
            Some(Reply::Panic) => panic!("scripted panic in {}", self.name),
            Some(Reply::Slow(delay, text)) => {
                tokio::time::sleep(delay).await;
                Ok(text)
            }
            None => Ok(format!("{} done", self.name)),
        };
        let _ = tx.send(AgentEvent::StepFinished { step: 1 }).await;
        outcome
    }
}

/// Hands out pre-registered [`ScriptedAgent`]s by agent id; unknown ids get a
/// fresh agent with no script.
#[derive(Default)]
pub(crate) struct ScriptedAgentFactory {
    agents: Mutex<HashMap<String, Arc<ScriptedAgent>>>,
}

impl ScriptedAgentFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with(self, agent_id: &str, replies: Vec<Reply>) -> Self {
        self.agents.lock().unwrap().insert(
            agent_id.to_string(),
            Arc::new(ScriptedAgent::new(agent_id, replies)),
        );
        self
    }

    pub(crate) fn agent(&self, agent_id: &str) -> Option<Arc<ScriptedAgent>> {
        self.agents.lock().unwrap().get(agent_id).cloned()
    }
}

impl AgentFactory for ScriptedAgentFactory {
    fn build(&self, spec: &AgentSpec) -> Result<Arc<dyn Agent>, BoxError> {
        let mut agents = self.agents.lock().unwrap();
        let agent = agents
            .entry(spec.id.clone())
            .or_insert_with(|| Arc::new(ScriptedAgent::new(&spec.id, vec![])))
            .clone();
        Ok(agent)
    }
}

//! Integration tests for workflow submission and execution
//!
//! These drive the coordinator through its public API with real LLM agents
//! backed by scripted models and mock tools. Nothing touches the network.

use async_trait::async_trait;
use ensemble_rs::adk::error::{BoxError, EnsembleError, PersistenceError};
use ensemble_rs::adk::model::{Content, GenerationConfig, Model, Part};
use ensemble_rs::adk::tool::Tool;
use ensemble_rs::ensemble::engine::cache::ResultCache;
use ensemble_rs::ensemble::engine::{
    AggregateToolResolver, AsyncExecutionRunner, EnabledToolSource, Execution, ExecutionCoordinator,
    ExecutionStatus, ExecutionStore, FileStore, LlmAgentFactory, MemoryStore, ModelFactory,
    PreparationStage, ProviderConfig, ProviderConfigResolver, ProviderEntry, ProviderTable,
    RetryPolicy, RunnerOptions, StaticSecretStore, StaticToolResolver, StatusReport, StatusTracker,
    ToolRegistry, TraceEventKind, TraceSettings, TraceStore,
};
use ensemble_rs::ensemble::workflow::{ConfigNormalizer, WorkflowLoader};
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Mock Components
// ============================================================================

/// Model that plays back predefined responses, then keeps answering "done"
struct MockModel {
    responses: Vec<Result<Content, String>>,
    response_index: AtomicUsize,
}

impl MockModel {
    fn new(responses: Vec<Result<Content, String>>) -> Self {
        Self {
            responses,
            response_index: AtomicUsize::new(0),
        }
    }

    fn text(text: &str) -> Result<Content, String> {
        Ok(Content::text("assistant", text))
    }

    fn tool_call(tool_name: &str, args: Value) -> Result<Content, String> {
        Ok(Content {
            role: "assistant".to_string(),
            parts: vec![Part::FunctionCall {
                id: String::new(),
                name: tool_name.to_string(),
                args,
            }],
        })
    }

    fn calls(&self) -> usize {
        self.response_index.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Model for MockModel {
    async fn generate_content(
        &self,
        _history: &[Content],
        _config: Option<&GenerationConfig>,
        _tools: Option<&[Arc<dyn Tool>]>,
    ) -> Result<Content, BoxError> {
        let idx = self.response_index.fetch_add(1, Ordering::SeqCst);
        match self.responses.get(idx) {
            Some(Ok(content)) => Ok(content.clone()),
            Some(Err(message)) => Err(message.clone().into()),
            None => Ok(Content::text("assistant", "done")),
        }
    }
}

/// Hands out one scripted model per model name
#[derive(Default)]
struct MockModels {
    models: Mutex<HashMap<String, Arc<MockModel>>>,
}

impl MockModels {
    fn with(self, model: &str, responses: Vec<Result<Content, String>>) -> Self {
        self.models
            .lock()
            .unwrap()
            .insert(model.to_string(), Arc::new(MockModel::new(responses)));
        self
    }

    fn get(&self, model: &str) -> Arc<MockModel> {
        self.models.lock().unwrap()[model].clone()
    }
}

impl ModelFactory for MockModels {
    fn create(&self, config: &ProviderConfig) -> Result<Arc<dyn Model>, BoxError> {
        let mut models = self.models.lock().unwrap();
        let model = models
            .entry(config.api_model.clone())
            .or_insert_with(|| Arc::new(MockModel::new(vec![])))
            .clone();
        Ok(model)
    }
}

static MOCK_TOOL_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "query": {"type": "string"}
        }
    })
});

struct MockTool {
    name: String,
    description: String,
    response: Value,
}

impl MockTool {
    fn new(name: &str, response: Value) -> Self {
        Self {
            name: name.to_string(),
            description: format!("Mock tool: {}", name),
            response,
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
        &MOCK_TOOL_SCHEMA
    }

    async fn execute(&self, _input: Value) -> Result<Value, BoxError> {
        Ok(self.response.clone())
    }
}

/// Pretends to be an MCP catalog with two enabled tools
struct FakeCatalog;

#[async_trait]
impl EnabledToolSource for FakeCatalog {
    async fn enabled_tools(&self) -> Result<Vec<Arc<dyn Tool>>, BoxError> {
        Ok(vec![
            Arc::new(MockTool::new("read_file", json!({"content": "hello"}))),
            Arc::new(MockTool::new("list_dir", json!(["a.txt"]))),
        ])
    }
}

/// Memory store that remembers every status it was asked to persist
#[derive(Default)]
struct RecordingStore {
    inner: MemoryStore,
    statuses: Mutex<Vec<(String, ExecutionStatus)>>,
}

#[async_trait]
impl ExecutionStore for RecordingStore {
    async fn save_execution(&self, execution: &Execution) -> Result<(), PersistenceError> {
        self.statuses
            .lock()
            .unwrap()
            .push((execution.id.clone(), execution.status));
        self.inner.save_execution(execution).await
    }

    async fn load_execution(&self, id: &str) -> Result<Option<Execution>, PersistenceError> {
        self.inner.load_execution(id).await
    }

    async fn list_executions(&self) -> Result<Vec<Execution>, PersistenceError> {
        self.inner.list_executions().await
    }

    async fn delete_execution(&self, id: &str) -> Result<bool, PersistenceError> {
        self.inner.delete_execution(id).await
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn coordinator(
    models: Arc<MockModels>,
    executions: Arc<dyn ExecutionStore>,
    traces: Arc<dyn TraceStore>,
    output_root: &Path,
) -> ExecutionCoordinator {
    let statics = StaticToolResolver::new();
    let search: Arc<dyn Tool> = Arc::new(MockTool::new("search", json!({"hits": 3})));
    statics.register(search).await;

    let tools = ToolRegistry::new()
        .with_resolver(Arc::new(statics))
        .with_resolver(Arc::new(AggregateToolResolver::new(Arc::new(FakeCatalog))));
    let providers = ProviderConfigResolver::new(
        ProviderTable::new()
            .with("test", ProviderEntry::unprefixed("http://models.test"))
            .with("alpha", ProviderEntry::prefixed("alpha", "http://alpha.test")),
        Arc::new(StaticSecretStore::new()),
    );

    ExecutionCoordinator::new(
        ConfigNormalizer::default(),
        PreparationStage::new(
            tools,
            Arc::new(providers),
            Arc::new(LlmAgentFactory::new(models)),
            output_root,
        ),
        AsyncExecutionRunner::new(
            Arc::new(ResultCache::new()),
            RunnerOptions {
                task_retry_delay: Duration::ZERO,
            },
        ),
        StatusTracker::new(executions, RetryPolicy::immediate(3)),
        traces,
        TraceSettings {
            batch_size: 4,
            flush_interval: Duration::from_millis(20),
            write_retry: RetryPolicy::immediate(2),
        },
    )
}

async fn memory_coordinator(models: Arc<MockModels>, output_root: &Path) -> ExecutionCoordinator {
    let store = Arc::new(MemoryStore::new());
    coordinator(models, store.clone(), store, output_root).await
}

async fn finish(coordinator: &ExecutionCoordinator, id: &str) -> StatusReport {
    coordinator
        .wait_for_completion(id, Duration::from_millis(5), Duration::from_secs(10))
        .await
        .expect("execution should finish")
}

const RESEARCH_AND_WRITE: &str = r#"
name: Weekly digest
provider: test
inputs:
  topic: async rust
agents:
  - id: researcher
    role: Researcher
    goal: Find sources about {topic}
    llm: research-model
    tools: [search]
  - id: writer
    role: Writer
    llm: writer-model
tasks:
  - id: research
    description: Collect sources on {topic}
    expected_output: A list of links
    agent: researcher
    config:
      retry_on_fail: true
      max_retries: 1
  - id: write
    description: Write the digest
    agent: writer
    context: [research]
"#;

// ============================================================================
// End-to-end execution
// ============================================================================

#[tokio::test]
async fn test_flat_workflow_with_tool_call_completes() {
    let dir = tempfile::tempdir().unwrap();
    let models = Arc::new(
        MockModels::default()
            .with(
                "research-model",
                vec![
                    MockModel::tool_call("search", json!({"query": "async rust"})),
                    MockModel::text("three links"),
                ],
            )
            .with("writer-model", vec![MockModel::text("The digest")]),
    );
    let coordinator = memory_coordinator(models, dir.path()).await;
    let def = WorkflowLoader::parse_yaml(RESEARCH_AND_WRITE).unwrap();

    let created = coordinator.create(&def, None).unwrap();
    assert_eq!(created.status, ExecutionStatus::Pending);

    let report = finish(&coordinator, &created.execution_id).await;
    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.run_name, "Weekly digest");
    let result = report.result.unwrap();
    assert_eq!(result["final_output"], "The digest");
    assert_eq!(result["task_outputs"]["research"], "three links");

    let page = coordinator
        .get_trace(&created.execution_id, 0, 500)
        .await
        .unwrap();
    let tool_events: Vec<&Value> = page
        .events
        .iter()
        .filter(|e| e.kind == TraceEventKind::ToolInvoked)
        .map(|e| &e.payload)
        .collect();
    assert_eq!(tool_events, vec![&json!({"tool": "search", "args": {"query": "async rust"}})]);
    assert!(page
        .events
        .iter()
        .any(|e| e.kind == TraceEventKind::AgentStepStart && e.agent.as_deref() == Some("Researcher")));

    let output_dir = Path::new(result["output_dir"].as_str().unwrap());
    assert!(output_dir.ends_with(&created.execution_id));
    assert_eq!(
        std::fs::read_to_string(output_dir.join("write.txt")).unwrap(),
        "The digest"
    );
}

#[tokio::test]
async fn test_graph_workflow_with_aggregate_tools() {
    let dir = tempfile::tempdir().unwrap();
    let models = Arc::new(MockModels::default().with(
        "files-model",
        vec![
            MockModel::tool_call("read_file", json!({"path": "a.txt"})),
            MockModel::text("it says hello"),
        ],
    ));
    let coordinator = memory_coordinator(models, dir.path()).await;
    let def = WorkflowLoader::parse_json(
        &json!({
            "provider": "alpha",
            "nodes": [
                { "id": "reader", "type": "agentNode",
                  "data": { "role": "Reader", "model": "files-model", "tools": ["all_enabled_tools"] } },
                { "id": "summarize", "type": "taskNode",
                  "data": { "label": "Summarize", "description": "Summarize a.txt" } }
            ],
            "edges": [ { "source": "reader", "target": "summarize" } ]
        })
        .to_string(),
    )
    .unwrap();

    let created = coordinator.create(&def, None).unwrap();
    let report = finish(&coordinator, &created.execution_id).await;
    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.result.unwrap()["final_output"], "it says hello");

    let page = coordinator.get_trace(&created.execution_id, 0, 500).await.unwrap();
    let result = page
        .events
        .iter()
        .find(|e| e.kind == TraceEventKind::DetailedOutput && e.payload.get("tool").is_some())
        .unwrap();
    assert_eq!(result.payload["result"], json!({"content": "hello"}));
}

#[tokio::test]
async fn test_status_transitions_follow_the_state_machine() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RecordingStore::default());
    let coordinator = coordinator(
        Arc::new(MockModels::default()),
        store.clone(),
        Arc::new(MemoryStore::new()),
        dir.path(),
    )
    .await;
    let def = WorkflowLoader::parse_yaml(RESEARCH_AND_WRITE).unwrap();

    let created = coordinator.create(&def, None).unwrap();
    finish(&coordinator, &created.execution_id).await;

    let mut observed: Vec<ExecutionStatus> = store
        .statuses
        .lock()
        .unwrap()
        .iter()
        .filter(|(id, _)| *id == created.execution_id)
        .map(|(_, status)| *status)
        .collect();
    observed.dedup();
    assert_eq!(
        observed,
        vec![
            ExecutionStatus::Pending,
            ExecutionStatus::Preparing,
            ExecutionStatus::Running,
            ExecutionStatus::Completed
        ]
    );
    for pair in observed.windows(2) {
        assert!(pair[0].can_transition_to(pair[1]));
    }
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_upstream_failure_stops_downstream() {
    let dir = tempfile::tempdir().unwrap();
    let models = Arc::new(
        MockModels::default()
            .with(
                "research-model",
                vec![Err("provider exploded".into()), Err("provider exploded again".into())],
            )
            .with("writer-model", vec![]),
    );
    let coordinator = memory_coordinator(models.clone(), dir.path()).await;
    let def = WorkflowLoader::parse_yaml(RESEARCH_AND_WRITE).unwrap();

    let created = coordinator.create(&def, None).unwrap();
    let report = finish(&coordinator, &created.execution_id).await;

    assert_eq!(report.status, ExecutionStatus::Failed);
    let error = report.error.unwrap();
    assert_eq!(error.kind, "RuntimeExecutionError");
    assert!(error.message.contains("research"));
    assert!(error.message.contains("provider exploded again"));
    assert_eq!(models.get("research-model").calls(), 2);
    assert_eq!(models.get("writer-model").calls(), 0);

    let page = coordinator.get_trace(&created.execution_id, 0, 500).await.unwrap();
    assert!(page
        .events
        .iter()
        .all(|e| e.task_id.as_deref() != Some("write")));
    assert!(page.events.iter().any(|e| e.kind == TraceEventKind::TaskRetry));
}

#[tokio::test]
async fn test_unknown_provider_fails_with_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = memory_coordinator(Arc::new(MockModels::default()), dir.path()).await;
    let yaml = RESEARCH_AND_WRITE.replace("provider: test", "provider: gamma");
    let def = WorkflowLoader::parse_yaml(&yaml).unwrap();

    let created = coordinator.create(&def, None).unwrap();
    let report = finish(&coordinator, &created.execution_id).await;
    assert_eq!(report.status, ExecutionStatus::Failed);
    let error = report.error.unwrap();
    assert_eq!(error.kind, "ConfigurationError");
    assert!(error.message.contains("gamma"));
    assert!(error.message.contains("researcher"));
    assert!(report.started_at.is_none());
}

#[tokio::test]
async fn test_cyclic_workflow_is_rejected_synchronously() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = memory_coordinator(Arc::new(MockModels::default()), dir.path()).await;
    let def = WorkflowLoader::parse_yaml(
        r#"
agents:
  - id: a
    role: A
tasks:
  - id: one
    description: first
    agent: a
    context: [two]
  - id: two
    description: second
    agent: a
    context: [one]
"#,
    )
    .unwrap();

    let err = coordinator.create(&def, None).unwrap_err();
    assert_eq!(err.kind(), "ValidationError");
    assert!(err.to_string().contains("cycle"));
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_status_and_trace_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let execution_id = {
        let store = Arc::new(FileStore::open(&store_dir).await.unwrap());
        let first = coordinator(
            Arc::new(MockModels::default()),
            store.clone(),
            store,
            dir.path(),
        )
        .await;
        let def = WorkflowLoader::parse_yaml(RESEARCH_AND_WRITE).unwrap();
        let created = first.create(&def, Some("nightly".into())).unwrap();
        finish(&first, &created.execution_id).await;
        created.execution_id
    };

    let store = Arc::new(FileStore::open(&store_dir).await.unwrap());
    let second = coordinator(
        Arc::new(MockModels::default()),
        store.clone(),
        store.clone(),
        dir.path(),
    )
    .await;

    let report = second.get_status(&execution_id).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.job_id, "nightly");
    assert!(!second.cancel(&execution_id).await.unwrap());

    let mut cursor = 0;
    let mut last_seen = 0;
    loop {
        let page = second.get_trace(&execution_id, cursor, 3).await.unwrap();
        if page.events.is_empty() {
            break;
        }
        for event in &page.events {
            assert!(event.sequence > last_seen);
            last_seen = event.sequence;
        }
        cursor = page.next_cursor;
    }
    assert!(last_seen > 0);

    let listed = second.list_executions(0, 10).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].execution_id, execution_id);

    // Deleting after a restart removes the record and its trace for good
    second.delete(&execution_id).await.unwrap();
    assert!(matches!(
        second.get_status(&execution_id).await,
        Err(EnsembleError::NotFound(_))
    ));
    let third = coordinator(
        Arc::new(MockModels::default()),
        store.clone(),
        store.clone(),
        dir.path(),
    )
    .await;
    assert!(third.list_executions(0, 10).await.unwrap().is_empty());
    assert!(store.read_events(&execution_id, 0, 10).await.unwrap().is_empty());
}

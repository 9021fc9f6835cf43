// SPDX-License-Identifier: MIT

//! Execution lifecycle and supervision
//!
//! The coordinator owns the registry of live executions. `create` validates
//! the definition, registers a PENDING record and spawns a supervisor task;
//! it never waits for the run. The supervisor drives the record through
//! PREPARING and RUNNING to a terminal state. Every transition happens under
//! the execution's transition lock, which is held until the new snapshot has
//! been handed to the [`StatusTracker`].
//!
//! Once a terminal state has been persisted the handle leaves the registry
//! and reads are served from the store. A terminal state the store refused
//! stays in memory so it is not lost.

use super::cache::ResultCache;
use super::execution::{derive_run_name, Execution, ExecutionFailure, ExecutionStatus, Transition};
use super::preparation::{LlmAgentFactory, PreparationStage};
use super::provider::{EnvSecretStore, HttpModelFactory, ProviderConfigResolver, ProviderTable, SecretStore};
use super::registry::{AggregateToolResolver, StaticToolResolver, ToolRegistry};
use super::retry::RetryPolicy;
use super::runner::{AsyncExecutionRunner, CancelFlag, RunOutcome, RunnerOptions};
use super::status::StatusTracker;
use super::store::{ExecutionStore, FileStore, MemoryStore, TraceStore};
use super::trace::{TraceCollector, TracePage, TraceSettings};
use crate::adk::error::EnsembleError;
use crate::ensemble::config::Settings;
use crate::ensemble::mcp::{McpServiceManager, McpToolSource};
use crate::ensemble::workflow::{ConfigNormalizer, NormalizerDefaults, WorkflowDefinition};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Largest page `get_trace` hands out
pub const MAX_TRACE_PAGE: usize = 500;

/// Largest page `list_executions` hands out
pub const MAX_LIST_PAGE: usize = 500;

/// Returned by `create`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedExecution {
    pub execution_id: String,
    pub job_id: String,
    pub status: ExecutionStatus,
}

/// Externally visible view of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub execution_id: String,
    pub job_id: String,
    pub run_name: String,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionFailure>,
}

impl From<&Execution> for StatusReport {
    fn from(execution: &Execution) -> Self {
        Self {
            execution_id: execution.id.clone(),
            job_id: execution.job_id.clone(),
            run_name: execution.run_name.clone(),
            status: execution.status,
            created_at: execution.created_at,
            started_at: execution.started_at,
            completed_at: execution.completed_at,
            result: execution.result.clone(),
            error: execution.error.clone(),
        }
    }
}

struct ExecutionHandle {
    current: RwLock<Execution>,
    transitions: tokio::sync::Mutex<()>,
    cancel: CancelFlag,
}

impl ExecutionHandle {
    fn new(execution: Execution) -> Self {
        Self {
            current: RwLock::new(execution),
            transitions: tokio::sync::Mutex::new(()),
            cancel: CancelFlag::new(),
        }
    }

    fn snapshot(&self) -> Execution {
        self.current.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn status(&self) -> ExecutionStatus {
        self.current.read().unwrap_or_else(|p| p.into_inner()).status
    }
}

#[derive(Default)]
struct Registry {
    executions: HashMap<String, Arc<ExecutionHandle>>,
    /// job id -> execution id, for executions not yet terminal
    active_jobs: HashMap<String, String>,
}

struct Inner {
    normalizer: ConfigNormalizer,
    preparation: PreparationStage,
    runner: AsyncExecutionRunner,
    status: StatusTracker,
    traces: Arc<dyn TraceStore>,
    trace_settings: TraceSettings,
    registry: Mutex<Registry>,
}

#[derive(Clone)]
pub struct ExecutionCoordinator {
    inner: Arc<Inner>,
}

impl ExecutionCoordinator {
    pub fn new(
        normalizer: ConfigNormalizer,
        preparation: PreparationStage,
        runner: AsyncExecutionRunner,
        status: StatusTracker,
        traces: Arc<dyn TraceStore>,
        trace_settings: TraceSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                normalizer,
                preparation,
                runner,
                status,
                traces,
                trace_settings,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Wire up the production engine: environment credentials, HTTP models,
    /// the MCP catalog and a file or memory store.
    pub async fn from_settings(settings: &Settings) -> Result<Self, EnsembleError> {
        let (executions, traces): (Arc<dyn ExecutionStore>, Arc<dyn TraceStore>) =
            match &settings.store_dir {
                Some(dir) => {
                    let store = Arc::new(FileStore::open(dir).await?);
                    log::info!("Persisting executions under {:?}", store.root());
                    (store.clone(), store)
                }
                None => {
                    let store = Arc::new(MemoryStore::new());
                    (store.clone(), store)
                }
            };

        let secrets: Arc<dyn SecretStore> = Arc::new(EnvSecretStore);
        let providers = ProviderConfigResolver::new(ProviderTable::from_env(), secrets.clone());
        let mcp = Arc::new(McpToolSource::new(
            settings.mcp_servers.clone(),
            Arc::new(McpServiceManager::new()),
        ));
        let tools = ToolRegistry::new()
            .with_resolver(Arc::new(StaticToolResolver::new()))
            .with_resolver(Arc::new(AggregateToolResolver::new(mcp.clone())))
            .with_resolver(mcp);
        let agents = LlmAgentFactory::new(Arc::new(HttpModelFactory::new(secrets)));

        let retry = RetryPolicy::new(settings.status_max_attempts, settings.retry_base_delay);
        Ok(Self::new(
            ConfigNormalizer::new(NormalizerDefaults {
                model: settings.default_model.clone(),
                provider: settings.default_provider.clone(),
            }),
            PreparationStage::new(tools, Arc::new(providers), Arc::new(agents), &settings.output_root),
            AsyncExecutionRunner::new(
                Arc::new(ResultCache::new()),
                RunnerOptions {
                    task_retry_delay: settings.retry_base_delay,
                },
            ),
            StatusTracker::new(executions, retry.clone()),
            traces,
            TraceSettings {
                batch_size: settings.trace_batch_size,
                flush_interval: settings.trace_flush_interval,
                write_retry: retry,
            },
        ))
    }

    /// Validate `definition` and schedule it. While an execution for `job_id`
    /// is still active, the existing execution is returned instead.
    pub fn create(
        &self,
        definition: &WorkflowDefinition,
        job_id: Option<String>,
    ) -> Result<CreatedExecution, EnsembleError> {
        let spec = self.inner.normalizer.normalize(definition)?;
        let job_id = job_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let handle = {
            let mut registry = self.inner.registry.lock().unwrap_or_else(|p| p.into_inner());
            let existing = registry
                .active_jobs
                .get(&job_id)
                .and_then(|id| registry.executions.get(id));
            if let Some(existing) = existing {
                let snapshot = existing.snapshot();
                log::info!(
                    "Job {} already has active execution {}",
                    job_id,
                    snapshot.id
                );
                return Ok(CreatedExecution {
                    execution_id: snapshot.id,
                    job_id,
                    status: snapshot.status,
                });
            }

            let run_name = derive_run_name(&spec);
            let handle = Arc::new(ExecutionHandle::new(Execution::new(job_id.clone(), run_name, spec)));
            let id = handle.snapshot().id;
            registry.executions.insert(id.clone(), handle.clone());
            registry.active_jobs.insert(job_id.clone(), id);
            handle
        };

        let execution_id = handle.snapshot().id;
        log::info!("Created execution {} for job {}", execution_id, job_id);
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.supervise(handle).await });

        Ok(CreatedExecution {
            execution_id,
            job_id,
            status: ExecutionStatus::Pending,
        })
    }

    /// Request cancellation. Before RUNNING the execution is cancelled at
    /// once; while RUNNING it ends at the next task boundary. Returns `false`
    /// for executions that are already terminal.
    pub async fn cancel(&self, execution_id: &str) -> Result<bool, EnsembleError> {
        let Some(handle) = self.inner.handle(execution_id) else {
            return match self.inner.status.store().load_execution(execution_id).await? {
                Some(_) => Ok(false),
                None => Err(EnsembleError::NotFound(execution_id.to_string())),
            };
        };

        let _guard = handle.transitions.lock().await;
        match handle.status() {
            status if status.is_terminal() => Ok(false),
            ExecutionStatus::Running => {
                handle.cancel.cancel();
                log::info!("Cancellation of {} requested; ends at next task", execution_id);
                Ok(true)
            }
            _ => {
                handle.cancel.cancel();
                Ok(self.inner.apply_locked(&handle, Transition::Cancel).await)
            }
        }
    }

    pub async fn get_status(&self, execution_id: &str) -> Result<StatusReport, EnsembleError> {
        if let Some(handle) = self.inner.handle(execution_id) {
            return Ok(StatusReport::from(&handle.snapshot()));
        }
        match self.inner.status.store().load_execution(execution_id).await? {
            Some(execution) => Ok(StatusReport::from(&execution)),
            None => Err(EnsembleError::NotFound(execution_id.to_string())),
        }
    }

    /// Known executions, newest first, skipping `offset` and returning at
    /// most `limit`. Live records win over stored ones.
    pub async fn list_executions(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StatusReport>, EnsembleError> {
        let mut by_id: HashMap<String, Execution> = self
            .inner
            .status
            .store()
            .list_executions()
            .await?
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();
        let live: Vec<Execution> = {
            let registry = self.inner.registry.lock().unwrap_or_else(|p| p.into_inner());
            registry.executions.values().map(|h| h.snapshot()).collect()
        };
        for execution in live {
            by_id.insert(execution.id.clone(), execution);
        }

        let mut executions: Vec<Execution> = by_id.into_values().collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(executions
            .iter()
            .skip(offset)
            .take(limit.clamp(1, MAX_LIST_PAGE))
            .map(StatusReport::from)
            .collect())
    }

    /// Remove a terminal execution with its trace and artifacts. Active
    /// executions are refused; cancel them first.
    pub async fn delete(&self, execution_id: &str) -> Result<(), EnsembleError> {
        if let Some(handle) = self.inner.handle(execution_id) {
            let _guard = handle.transitions.lock().await;
            if !handle.status().is_terminal() {
                return Err(EnsembleError::ExecutionActive(execution_id.to_string()));
            }
            let mut registry = self.inner.registry.lock().unwrap_or_else(|p| p.into_inner());
            registry.executions.remove(execution_id);
        } else if self.inner.status.store().load_execution(execution_id).await?.is_none() {
            return Err(EnsembleError::NotFound(execution_id.to_string()));
        }

        self.inner.status.store().delete_execution(execution_id).await?;
        self.inner.traces.delete_trace(execution_id).await?;
        let output_dir = self.inner.preparation.output_dir(execution_id);
        match tokio::fs::remove_dir_all(&output_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Could not remove artifacts {:?}: {}", output_dir, e),
        }
        log::info!("Deleted execution {}", execution_id);
        Ok(())
    }

    /// Events with `sequence > since`, ascending, at most `limit` of them.
    pub async fn get_trace(
        &self,
        execution_id: &str,
        since: u64,
        limit: usize,
    ) -> Result<TracePage, EnsembleError> {
        if self.inner.handle(execution_id).is_none()
            && self.inner.status.store().load_execution(execution_id).await?.is_none()
        {
            return Err(EnsembleError::NotFound(execution_id.to_string()));
        }
        let events = self
            .inner
            .traces
            .read_events(execution_id, since, limit.clamp(1, MAX_TRACE_PAGE))
            .await?;
        let next_cursor = events.last().map_or(since, |e| e.sequence);
        Ok(TracePage { events, next_cursor })
    }

    /// Poll until the execution is terminal or `timeout` passes.
    pub async fn wait_for_completion(
        &self,
        execution_id: &str,
        poll: Duration,
        timeout: Duration,
    ) -> Result<StatusReport, EnsembleError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let report = self.get_status(execution_id).await?;
            if report.status.is_terminal() {
                return Ok(report);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EnsembleError::other(format!(
                    "Execution {} still {} after {:?}",
                    execution_id, report.status, timeout
                )));
            }
            tokio::time::sleep(poll).await;
        }
    }
}

impl Inner {
    fn handle(&self, execution_id: &str) -> Option<Arc<ExecutionHandle>> {
        let registry = self.registry.lock().unwrap_or_else(|p| p.into_inner());
        registry.executions.get(execution_id).cloned()
    }

    async fn supervise(self: Arc<Self>, handle: Arc<ExecutionHandle>) {
        let execution_id = handle.snapshot().id;
        {
            let _guard = handle.transitions.lock().await;
            self.status.record(&handle.snapshot()).await;
        }

        if !self.transition(&handle, Transition::Prepare).await {
            return;
        }
        let spec = handle.snapshot().config;
        let prepared = match self.preparation.prepare(&execution_id, &spec).await {
            Ok(prepared) => prepared,
            Err(e) => {
                log::error!("Preparation of {} failed: {}", execution_id, e);
                self.transition(&handle, Transition::Fail(ExecutionFailure::from(&e)))
                    .await;
                return;
            }
        };
        if !self.transition(&handle, Transition::Run).await {
            return;
        }

        let trace = TraceCollector::start(
            execution_id.clone(),
            self.traces.clone(),
            self.trace_settings.clone(),
        );
        let outcome = AssertUnwindSafe(self.runner.run(&prepared, &trace, &handle.cancel))
            .catch_unwind()
            .await;
        trace.close().await;

        let transition = match outcome {
            Ok(RunOutcome::Completed(result)) => {
                log::info!("Execution {} completed", execution_id);
                Transition::Complete(result)
            }
            Ok(RunOutcome::Failed(e)) => {
                log::error!("Execution {} failed: {}", execution_id, e);
                Transition::Fail(ExecutionFailure::from(&e))
            }
            Ok(RunOutcome::Cancelled) => {
                log::info!("Execution {} cancelled", execution_id);
                Transition::Cancel
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                log::error!("Runner for {} panicked: {}", execution_id, message);
                Transition::Fail(ExecutionFailure {
                    kind: "InternalError".to_string(),
                    message: format!("Runner panicked: {}", message),
                })
            }
        };
        self.transition(&handle, transition).await;
    }

    async fn transition(&self, handle: &ExecutionHandle, transition: Transition) -> bool {
        let _guard = handle.transitions.lock().await;
        self.apply_locked(handle, transition).await
    }

    /// Apply and persist one transition. Caller holds the transition lock.
    async fn apply_locked(&self, handle: &ExecutionHandle, transition: Transition) -> bool {
        let mut snapshot = handle.snapshot();
        if let Err(e) = snapshot.apply(transition) {
            log::warn!("Execution {}: {}; ignored", snapshot.id, e);
            return false;
        }
        log::info!("Execution {} is now {}", snapshot.id, snapshot.status);

        // Readers only see a state once the store has been offered it.
        let persisted = self.status.record(&snapshot).await;
        if !persisted {
            log::warn!(
                "Execution {} continues with unpersisted status {}",
                snapshot.id,
                snapshot.status
            );
        }
        *handle.current.write().unwrap_or_else(|p| p.into_inner()) = snapshot.clone();
        if snapshot.status.is_terminal() {
            let mut registry = self.registry.lock().unwrap_or_else(|p| p.into_inner());
            if registry.active_jobs.get(&snapshot.job_id) == Some(&snapshot.id) {
                registry.active_jobs.remove(&snapshot.job_id);
            }
            if persisted {
                registry.executions.remove(&snapshot.id);
            }
        }
        true
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// SPDX-License-Identifier: MIT

//! Storage traits for execution records and trace events
//!
//! - `ExecutionStore`: one record per execution, overwritten on each transition
//! - `TraceStore`: append-only trace events keyed by `(execution_id, sequence)`
//!
//! [`MemoryStore`] backs tests and single-process use; [`FileStore`] keeps
//! JSON records and JSON-lines traces under a directory.

use super::execution::Execution;
use super::trace::TraceEvent;
use crate::adk::error::PersistenceError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

/// Result type for storage operations
pub type StoreResult<T> = Result<T, PersistenceError>;

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert or replace the record with the same id.
    async fn save_execution(&self, execution: &Execution) -> StoreResult<()>;

    async fn load_execution(&self, id: &str) -> StoreResult<Option<Execution>>;

    /// All stored executions, newest first.
    async fn list_executions(&self) -> StoreResult<Vec<Execution>>;

    /// Remove a record. Returns whether one existed.
    async fn delete_execution(&self, id: &str) -> StoreResult<bool>;
}

#[async_trait]
pub trait TraceStore: Send + Sync {
    /// Append events. Re-appending a sequence number replaces the old event.
    async fn append_events(&self, events: &[TraceEvent]) -> StoreResult<()>;

    /// Events with `sequence > after`, ascending, at most `limit` of them.
    async fn read_events(
        &self,
        execution_id: &str,
        after: u64,
        limit: usize,
    ) -> StoreResult<Vec<TraceEvent>>;

    /// Drop every event of an execution. Unknown ids are not an error.
    async fn delete_trace(&self, execution_id: &str) -> StoreResult<()>;
}

fn newest_first(mut executions: Vec<Execution>) -> Vec<Execution> {
    executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    executions
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryStore {
    executions: Mutex<HashMap<String, Execution>>,
    traces: Mutex<HashMap<String, BTreeMap<u64, TraceEvent>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn save_execution(&self, execution: &Execution) -> StoreResult<()> {
        let mut executions = self.executions.lock().unwrap_or_else(|p| p.into_inner());
        executions.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn load_execution(&self, id: &str) -> StoreResult<Option<Execution>> {
        let executions = self.executions.lock().unwrap_or_else(|p| p.into_inner());
        Ok(executions.get(id).cloned())
    }

    async fn list_executions(&self) -> StoreResult<Vec<Execution>> {
        let executions = self.executions.lock().unwrap_or_else(|p| p.into_inner());
        Ok(newest_first(executions.values().cloned().collect()))
    }

    async fn delete_execution(&self, id: &str) -> StoreResult<bool> {
        let mut executions = self.executions.lock().unwrap_or_else(|p| p.into_inner());
        Ok(executions.remove(id).is_some())
    }
}

#[async_trait]
impl TraceStore for MemoryStore {
    async fn append_events(&self, events: &[TraceEvent]) -> StoreResult<()> {
        let mut traces = self.traces.lock().unwrap_or_else(|p| p.into_inner());
        for event in events {
            traces
                .entry(event.execution_id.clone())
                .or_default()
                .insert(event.sequence, event.clone());
        }
        Ok(())
    }

    async fn read_events(
        &self,
        execution_id: &str,
        after: u64,
        limit: usize,
    ) -> StoreResult<Vec<TraceEvent>> {
        let traces = self.traces.lock().unwrap_or_else(|p| p.into_inner());
        Ok(traces
            .get(execution_id)
            .map(|events| {
                events
                    .range(after.saturating_add(1)..)
                    .take(limit)
                    .map(|(_, e)| e.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_trace(&self, execution_id: &str) -> StoreResult<()> {
        let mut traces = self.traces.lock().unwrap_or_else(|p| p.into_inner());
        traces.remove(execution_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// Directory-backed store:
///
/// ```text
/// <root>/executions/<id>.json
/// <root>/traces/<id>.jsonl
/// ```
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("executions")).await?;
        tokio::fs::create_dir_all(root.join("traces")).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn execution_path(&self, id: &str) -> Option<PathBuf> {
        is_safe_id(id).then(|| self.root.join("executions").join(format!("{}.json", id)))
    }

    fn trace_path(&self, id: &str) -> Option<PathBuf> {
        is_safe_id(id).then(|| self.root.join("traces").join(format!("{}.jsonl", id)))
    }
}

/// `Ok(false)` when the file was already gone
async fn remove_if_present(path: &Path) -> StoreResult<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Ids become file names; anything that could escape the directory is refused.
fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[async_trait]
impl ExecutionStore for FileStore {
    async fn save_execution(&self, execution: &Execution) -> StoreResult<()> {
        let path = self.execution_path(&execution.id).ok_or_else(|| {
            PersistenceError::Conflict(format!("invalid execution id '{}'", execution.id))
        })?;
        let body = serde_json::to_vec_pretty(execution)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load_execution(&self, id: &str) -> StoreResult<Option<Execution>> {
        let Some(path) = self.execution_path(id) else {
            return Ok(None);
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_executions(&self) -> StoreResult<Vec<Execution>> {
        let mut entries = tokio::fs::read_dir(self.root.join("executions")).await?;
        let mut executions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let bytes = tokio::fs::read(&path).await?;
                match serde_json::from_slice::<Execution>(&bytes) {
                    Ok(execution) => executions.push(execution),
                    Err(e) => log::warn!("Skipping unreadable record {:?}: {}", path, e),
                }
            }
        }
        Ok(newest_first(executions))
    }

    async fn delete_execution(&self, id: &str) -> StoreResult<bool> {
        match self.execution_path(id) {
            Some(path) => remove_if_present(&path).await,
            None => Ok(false),
        }
    }
}

#[async_trait]
impl TraceStore for FileStore {
    async fn append_events(&self, events: &[TraceEvent]) -> StoreResult<()> {
        let mut by_execution: BTreeMap<&str, String> = BTreeMap::new();
        for event in events {
            let line = serde_json::to_string(event)?;
            let buf = by_execution.entry(event.execution_id.as_str()).or_default();
            buf.push_str(&line);
            buf.push('\n');
        }

        for (execution_id, lines) in by_execution {
            let path = self.trace_path(execution_id).ok_or_else(|| {
                PersistenceError::Conflict(format!("invalid execution id '{}'", execution_id))
            })?;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(lines.as_bytes()).await?;
            file.flush().await?;
        }
        Ok(())
    }

    async fn read_events(
        &self,
        execution_id: &str,
        after: u64,
        limit: usize,
    ) -> StoreResult<Vec<TraceEvent>> {
        let Some(path) = self.trace_path(execution_id) else {
            return Ok(vec![]);
        };
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut events: BTreeMap<u64, TraceEvent> = BTreeMap::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<TraceEvent>(line) {
                Ok(event) if event.sequence > after => {
                    events.insert(event.sequence, event);
                }
                Ok(_) => {}
                // A torn final line from a crash mid-append
                Err(e) => log::warn!("Skipping malformed trace line in {:?}: {}", path, e),
            }
        }
        Ok(events.into_values().take(limit).collect())
    }

    async fn delete_trace(&self, execution_id: &str) -> StoreResult<()> {
        if let Some(path) = self.trace_path(execution_id) {
            remove_if_present(&path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::engine::execution::{ExecutionStatus, Transition};
    use crate::ensemble::engine::trace::TraceEventKind;
    use crate::ensemble::workflow::{Process, WorkflowSpec};
    use chrono::Utc;
    use serde_json::json;

    fn execution() -> Execution {
        Execution::new(
            "job",
            "run",
            WorkflowSpec {
                run_name: None,
                process: Process::Sequential,
                inputs: Default::default(),
                max_rpm: None,
                agents: vec![],
                tasks: vec![],
            },
        )
    }

    fn event(execution_id: &str, sequence: u64) -> TraceEvent {
        TraceEvent {
            execution_id: execution_id.to_string(),
            sequence,
            kind: TraceEventKind::DetailedOutput,
            timestamp: Utc::now(),
            task_id: None,
            agent: None,
            payload: json!({ "n": sequence }),
        }
    }

    async fn exercise_trace_store(store: &dyn TraceStore) {
        store
            .append_events(&[event("e1", 1), event("e1", 2), event("e2", 1)])
            .await
            .unwrap();
        store.append_events(&[event("e1", 3), event("e1", 4)]).await.unwrap();

        let page = store.read_events("e1", 1, 2).await.unwrap();
        let seqs: Vec<u64> = page.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(store.read_events("e1", 4, 10).await.unwrap().len(), 0);
        assert_eq!(store.read_events("e2", 0, 10).await.unwrap().len(), 1);
        assert!(store.read_events("nope", 0, 10).await.unwrap().is_empty());

        store.delete_trace("e1").await.unwrap();
        store.delete_trace("nope").await.unwrap();
        assert!(store.read_events("e1", 0, 10).await.unwrap().is_empty());
        assert_eq!(store.read_events("e2", 0, 10).await.unwrap().len(), 1);
    }

    async fn exercise_execution_store(store: &dyn ExecutionStore) {
        let mut exec = execution();
        store.save_execution(&exec).await.unwrap();
        exec.apply(Transition::Cancel).unwrap();
        store.save_execution(&exec).await.unwrap();

        let loaded = store.load_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Cancelled);
        assert_eq!(store.list_executions().await.unwrap().len(), 1);
        assert!(store.load_execution("missing").await.unwrap().is_none());

        assert!(store.delete_execution(&exec.id).await.unwrap());
        assert!(!store.delete_execution(&exec.id).await.unwrap());
        assert!(store.load_execution(&exec.id).await.unwrap().is_none());
        assert!(store.list_executions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_contracts() {
        let store = MemoryStore::new();
        exercise_execution_store(&store).await;
        exercise_trace_store(&store).await;
    }

    #[tokio::test]
    async fn test_file_store_contracts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        exercise_execution_store(&store).await;
        exercise_trace_store(&store).await;
    }

    #[tokio::test]
    async fn test_file_store_tolerates_torn_line_and_bad_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.append_events(&[event("e1", 1)]).await.unwrap();

        let path = dir.path().join("traces").join("e1.jsonl");
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"execution_id\": \"e1\", \"seq");
        std::fs::write(&path, raw).unwrap();

        assert_eq!(store.read_events("e1", 0, 10).await.unwrap().len(), 1);
        assert!(store.load_execution("../etc/passwd").await.unwrap().is_none());
        assert!(!store.delete_execution("../etc/passwd").await.unwrap());
    }
}

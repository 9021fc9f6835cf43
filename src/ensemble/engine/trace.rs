// SPDX-License-Identifier: MIT

//! Trace events and the buffered collector that persists them
//!
//! `emit` is synchronous and never waits on storage. Each event gets the next
//! sequence number for its execution and lands in an in-memory buffer. A
//! single background writer per execution drains the buffer when it reaches
//! the batch size, on every flush tick, and one final time on
//! [`TraceCollector::close`]. Because one task does all writes, batches reach
//! the store in sequence order.
//!
//! Events still buffered when the process dies are lost.

use super::retry::RetryPolicy;
use super::store::TraceStore;
use crate::adk::error::PersistenceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventKind {
    AgentStepStart,
    AgentStepEnd,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskSkipped,
    TaskRetry,
    CacheHit,
    ToolInvoked,
    DetailedOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub execution_id: String,
    pub sequence: u64,
    pub kind: TraceEventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// One page of trace events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracePage {
    pub events: Vec<TraceEvent>,
    /// Pass back as `since` to continue after the last event of this page
    pub next_cursor: u64,
}

#[derive(Debug, Clone)]
pub struct TraceSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub write_retry: RetryPolicy,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_interval: Duration::from_millis(500),
            write_retry: RetryPolicy::new(3, Duration::from_millis(200)),
        }
    }
}

#[derive(Default)]
struct Buffer {
    next_sequence: u64,
    pending: Vec<TraceEvent>,
    closed: bool,
}

enum WriterCommand {
    Batch(Vec<TraceEvent>),
    Close,
}

struct Shared {
    execution_id: String,
    buffer: Mutex<Buffer>,
}

impl Shared {
    /// Collect queued batches followed by the partial buffer. Batches are
    /// queued under the buffer lock, so holding it here keeps the result in
    /// sequence order.
    fn drain(&self, rx: &mut mpsc::UnboundedReceiver<WriterCommand>) -> (Vec<TraceEvent>, bool) {
        let mut buffer = self.buffer.lock().unwrap_or_else(|p| p.into_inner());
        let mut events = Vec::new();
        let mut close_seen = false;
        while let Ok(command) = rx.try_recv() {
            match command {
                WriterCommand::Batch(batch) => events.extend(batch),
                WriterCommand::Close => close_seen = true,
            }
        }
        events.append(&mut buffer.pending);
        (events, close_seen)
    }
}

/// Per-execution trace collector
pub struct TraceCollector {
    shared: Arc<Shared>,
    batch_size: usize,
    tx: mpsc::UnboundedSender<WriterCommand>,
    writer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TraceCollector {
    /// Create a collector and spawn its writer. Must be called inside a
    /// Tokio runtime.
    pub fn start(
        execution_id: impl Into<String>,
        store: Arc<dyn TraceStore>,
        settings: TraceSettings,
    ) -> Self {
        let shared = Arc::new(Shared {
            execution_id: execution_id.into(),
            buffer: Mutex::new(Buffer {
                next_sequence: 1,
                ..Default::default()
            }),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let batch_size = settings.batch_size.max(1);
        let writer = tokio::spawn(write_loop(shared.clone(), store, settings, rx));

        Self {
            shared,
            batch_size,
            tx,
            writer: tokio::sync::Mutex::new(Some(writer)),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.shared.execution_id
    }

    /// Record an event and return its sequence number. After `close` the
    /// event is dropped and the last assigned sequence is returned.
    pub fn emit(
        &self,
        kind: TraceEventKind,
        task_id: Option<&str>,
        agent: Option<&str>,
        payload: Value,
    ) -> u64 {
        let mut buffer = self.shared.buffer.lock().unwrap_or_else(|p| p.into_inner());
        if buffer.closed {
            log::warn!(
                "Trace event {:?} for {} emitted after close; dropped",
                kind,
                self.shared.execution_id
            );
            return buffer.next_sequence - 1;
        }

        let sequence = buffer.next_sequence;
        buffer.next_sequence += 1;

        buffer.pending.push(TraceEvent {
            execution_id: self.shared.execution_id.clone(),
            sequence,
            kind,
            timestamp: Utc::now(),
            task_id: task_id.map(String::from),
            agent: agent.map(String::from),
            payload,
        });

        // Enqueue while holding the lock so batches stay in sequence order.
        if buffer.pending.len() >= self.batch_size {
            let batch = std::mem::take(&mut buffer.pending);
            if self.tx.send(WriterCommand::Batch(batch)).is_err() {
                log::error!(
                    "Trace writer for {} is gone; events dropped",
                    self.shared.execution_id
                );
            }
        }
        sequence
    }

    /// Flush everything buffered and stop the writer. Idempotent.
    pub async fn close(&self) {
        {
            let mut buffer = self.shared.buffer.lock().unwrap_or_else(|p| p.into_inner());
            buffer.closed = true;
        }
        let Some(handle) = self.writer.lock().await.take() else {
            return;
        };
        let _ = self.tx.send(WriterCommand::Close);
        if let Err(e) = handle.await {
            log::error!(
                "Trace writer for {} ended abnormally: {}",
                self.shared.execution_id,
                e
            );
        }
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    store: Arc<dyn TraceStore>,
    settings: TraceSettings,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
) {
    let mut ticker = tokio::time::interval(settings.flush_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        let step = tokio::select! {
            biased;
            command = rx.recv() => match command {
                Some(WriterCommand::Batch(batch)) => WriterStep::Write(batch),
                Some(WriterCommand::Close) | None => WriterStep::Drain { last: true },
            },
            _ = ticker.tick() => WriterStep::Drain { last: false },
        };

        match step {
            WriterStep::Write(batch) => {
                write_batch(&shared, store.as_ref(), &settings.write_retry, batch).await;
            }
            WriterStep::Drain { last } => {
                let (batch, close_seen) = shared.drain(&mut rx);
                write_batch(&shared, store.as_ref(), &settings.write_retry, batch).await;
                if last || close_seen {
                    break;
                }
            }
        }
    }
}

enum WriterStep {
    Write(Vec<TraceEvent>),
    Drain { last: bool },
}

async fn write_batch(
    shared: &Shared,
    store: &dyn TraceStore,
    retry: &RetryPolicy,
    batch: Vec<TraceEvent>,
) {
    if batch.is_empty() {
        return;
    }
    let label = format!("trace flush for {}", shared.execution_id);
    let result = retry
        .run(&label, PersistenceError::is_retryable, || {
            store.append_events(&batch)
        })
        .await;
    if let Err(e) = result {
        log::error!(
            "Dropping {} trace events ({}..={}) for {}: {}",
            batch.len(),
            batch[0].sequence,
            batch[batch.len() - 1].sequence,
            shared.execution_id,
            e
        );
    }
}

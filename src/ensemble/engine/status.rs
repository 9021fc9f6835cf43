// SPDX-License-Identifier: MIT

//! Durable status updates with bounded retry

use super::execution::Execution;
use super::retry::RetryPolicy;
use super::store::ExecutionStore;
use crate::adk::error::PersistenceError;
use std::sync::Arc;

pub struct StatusTracker {
    store: Arc<dyn ExecutionStore>,
    retry: RetryPolicy,
}

impl StatusTracker {
    pub fn new(store: Arc<dyn ExecutionStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Persist a snapshot of the record. Transient store failures are retried
    /// with backoff; if every attempt fails the error is logged and `false`
    /// returned so the caller can carry on with its in-memory state.
    pub async fn record(&self, execution: &Execution) -> bool {
        let label = format!("status update {} -> {}", execution.id, execution.status);
        let result = self
            .retry
            .run(&label, PersistenceError::is_retryable, || {
                self.store.save_execution(execution)
            })
            .await;

        match result {
            Ok(()) => {
                log::debug!("Persisted {}", label);
                true
            }
            Err(e) => {
                log::error!("Giving up on {}: {}", label, e);
                false
            }
        }
    }
}

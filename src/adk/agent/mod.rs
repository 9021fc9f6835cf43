// SPDX-License-Identifier: MIT

//! Agent module - defines the agent trait and the LLM-backed implementation
//!
//! Agents report progress over an [`AgentEvent`] channel while they run. The
//! engine turns those events into trace records for the task being executed.

mod llm;

pub use llm::{LLMAgent, Persona};

use crate::adk::error::BoxError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentEvent {
    StepStarted {
        step: u32,
    },
    StepFinished {
        step: u32,
    },
    Thought(String),
    ToolCall {
        name: String,
        args: serde_json::Value,
    },
    ToolResult {
        name: String,
        result: serde_json::Value,
    },
    Answer(String),
    Error(String),
}

/// Core agent trait for all agent types
#[async_trait]
pub trait Agent: Send + Sync {
    /// Returns the agent name
    fn name(&self) -> &str;

    /// Run the agent with the given input
    async fn run(&self, input: String) -> Result<String, BoxError>;

    /// Run the agent with streaming events
    async fn run_stream(
        &self,
        input: String,
        tx: mpsc::Sender<AgentEvent>,
    ) -> Result<String, BoxError> {
        // Default implementation falls back to run()
        match self.run(input).await {
            Ok(res) => {
                let _ = tx.send(AgentEvent::Answer(res.clone())).await;
                Ok(res)
            }
            Err(e) => {
                let _ = tx.send(AgentEvent::Error(e.to_string())).await;
                Err(e)
            }
        }
    }
}

// SPDX-License-Identifier: MIT

//! LLM Agent - role-playing agent with tool calling
//!
//! The agent sends its persona and the task prompt to a model and executes
//! requested tool calls in a loop until the model answers with text or the
//! iteration limit is hit.

use super::{Agent, AgentEvent};
use crate::adk::error::{BoxError, ModelError};
use crate::adk::model::{Content, Model, Part};
use crate::adk::tool::Tool;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Who the agent is pretending to be.
#[derive(Debug, Clone, Default)]
pub struct Persona {
    pub role: String,
    pub goal: String,
    pub backstory: String,
}

impl Persona {
    pub fn system_prompt(&self) -> String {
        let mut prompt = format!("You are {}.", self.role);
        if !self.backstory.is_empty() {
            prompt.push(' ');
            prompt.push_str(&self.backstory);
        }
        if !self.goal.is_empty() {
            prompt.push_str("\n\nYour personal goal is: ");
            prompt.push_str(&self.goal);
        }
        prompt
    }
}

/// LLM agent with tool calling support
pub struct LLMAgent {
    name: String,
    persona: Persona,
    model: Arc<dyn Model>,
    tools: Vec<Arc<dyn Tool>>,
    /// HashMap for O(1) tool lookups
    tool_map: HashMap<String, usize>,
    max_iterations: u32,
    max_retry_limit: u32,
    retry_delay: Duration,
}

impl LLMAgent {
    pub fn new(
        name: impl Into<String>,
        persona: Persona,
        model: Arc<dyn Model>,
        tools: Vec<Arc<dyn Tool>>,
        max_iterations: u32,
    ) -> Self {
        let tool_map = tools
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name().to_string(), i))
            .collect();

        Self {
            name: name.into(),
            persona,
            model,
            tools,
            tool_map,
            max_iterations: max_iterations.max(1),
            max_retry_limit: 0,
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Retry transient model failures (rate limits, 5xx, dropped
    /// connections) up to `limit` times per step.
    pub fn with_max_retry_limit(mut self, limit: u32) -> Self {
        self.max_retry_limit = limit;
        self
    }

    /// Base delay between model retries; doubles each attempt.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    async fn generate(&self, history: &[Content]) -> Result<Content, BoxError> {
        let mut retries = 0;
        loop {
            match self
                .model
                .generate_content(history, None, Some(&self.tools))
                .await
            {
                Ok(content) => return Ok(content),
                Err(e) if retries < self.max_retry_limit && is_transient(e.as_ref()) => {
                    retries += 1;
                    let delay = self.retry_delay.saturating_mul(2u32.saturating_pow(retries - 1));
                    log::warn!(
                        "Agent {} model call failed ({}); retry {}/{} in {:?}",
                        self.name,
                        e,
                        retries,
                        self.max_retry_limit,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn get_tool(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tool_map.get(name).map(|&i| &self.tools[i])
    }

    async fn call_tool(
        &self,
        name: &str,
        args: &serde_json::Value,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> serde_json::Value {
        let Some(tool) = self.get_tool(name) else {
            log::warn!("Agent {} requested unknown tool {}", self.name, name);
            let _ = tx
                .send(AgentEvent::Error(format!("Tool {} not found", name)))
                .await;
            return json!({ "error": format!("Tool {} not found", name) });
        };

        match tool.execute(args.clone()).await {
            Ok(res) => res,
            Err(e) => {
                log::error!("Tool {} failed: {}", name, e);
                let _ = tx
                    .send(AgentEvent::Error(format!("Tool {} failed: {}", name, e)))
                    .await;
                json!({ "error": e.to_string() })
            }
        }
    }
}

#[async_trait]
impl Agent for LLMAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, input: String) -> Result<String, BoxError> {
        // Nobody listens; events are dropped on send.
        let (tx, _) = mpsc::channel(1);
        self.run_stream(input, tx).await
    }

    async fn run_stream(
        &self,
        input: String,
        tx: mpsc::Sender<AgentEvent>,
    ) -> Result<String, BoxError> {
        let mut history = vec![
            Content::text("system", self.persona.system_prompt()),
            Content::text("user", input),
        ];

        for step in 1..=self.max_iterations {
            log::debug!("Agent {} step {}/{}", self.name, step, self.max_iterations);
            let _ = tx.send(AgentEvent::StepStarted { step }).await;

            let mut response = self.generate(&history).await?;
            assign_call_ids(&mut response, step);

            let mut text = String::new();
            let mut calls = Vec::new();
            for part in &response.parts {
                match part {
                    Part::Text(t) => text.push_str(t),
                    Part::FunctionCall { id, name, args } => {
                        calls.push((id.as_str(), name.as_str(), args))
                    }
                    Part::FunctionResponse { .. } => {}
                }
            }

            if calls.is_empty() {
                let _ = tx.send(AgentEvent::StepFinished { step }).await;
                if text.is_empty() {
                    log::warn!("Agent {} received an empty response", self.name);
                } else {
                    let _ = tx.send(AgentEvent::Answer(text.clone())).await;
                }
                return Ok(text);
            }

            if !text.is_empty() {
                let _ = tx.send(AgentEvent::Thought(text.clone())).await;
            }

            let mut responses = Vec::with_capacity(calls.len());
            for (id, name, args) in calls {
                let _ = tx
                    .send(AgentEvent::ToolCall {
                        name: name.to_string(),
                        args: args.clone(),
                    })
                    .await;

                let result = self.call_tool(name, args, &tx).await;

                let _ = tx
                    .send(AgentEvent::ToolResult {
                        name: name.to_string(),
                        result: result.clone(),
                    })
                    .await;
                responses.push(Part::FunctionResponse {
                    id: id.to_string(),
                    name: name.to_string(),
                    response: result,
                });
            }

            history.push(response);
            history.push(Content {
                role: "user".to_string(),
                parts: responses,
            });
            let _ = tx.send(AgentEvent::StepFinished { step }).await;
        }

        log::error!(
            "Agent {} reached {} iterations without an answer",
            self.name,
            self.max_iterations
        );
        Err(format!("Max iterations ({}) reached", self.max_iterations).into())
    }
}

/// Every call in a step needs a distinct id so its response can be matched.
fn assign_call_ids(response: &mut Content, step: u32) {
    for (i, part) in response.parts.iter_mut().enumerate() {
        if let Part::FunctionCall { id, .. } = part {
            if id.is_empty() {
                *id = format!("call_{}_{}", step, i);
            }
        }
    }
}

fn is_transient(err: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
    if let Some(model) = err.downcast_ref::<ModelError>() {
        return model.is_transient();
    }
    err.downcast_ref::<reqwest::Error>()
        .is_some_and(|e| e.is_timeout() || e.is_connect())
}

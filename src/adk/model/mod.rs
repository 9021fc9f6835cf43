// SPDX-License-Identifier: MIT

//! Model module - defines the LLM model trait and shared message types
//!
//! Implementations live in their own submodules:
//! - [openai] - any endpoint speaking the chat-completions wire format
//! - [rate_limit] - requests-per-minute throttle wrapped around another model

pub mod openai;
pub mod rate_limit;

pub use openai::ChatCompletionsModel;
pub use rate_limit::RateLimitedModel;

use crate::adk::error::BoxError;
use crate::adk::tool::Tool;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Configuration for model generation
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GenerationConfig {
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

/// A message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn text(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            parts: vec![Part::Text(text.into())],
        }
    }
}

/// Parts of a message - text, function calls and their responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Part {
    /// Regular text output from the model
    Text(String),
    /// Function/tool call requested by the model. `id` pairs it with its
    /// response; providers that omit one get an id assigned by the agent.
    FunctionCall {
        #[serde(default)]
        id: String,
        name: String,
        args: serde_json::Value,
    },
    /// Response from executing a function/tool
    FunctionResponse {
        #[serde(default)]
        id: String,
        name: String,
        response: serde_json::Value,
    },
}

/// Core trait for LLM model implementations
#[async_trait]
pub trait Model: Send + Sync {
    async fn generate_content(
        &self,
        history: &[Content],
        config: Option<&GenerationConfig>,
        tools: Option<&[Arc<dyn Tool>]>,
    ) -> Result<Content, BoxError>;
}

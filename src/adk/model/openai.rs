// SPDX-License-Identifier: MIT

//! Chat-completions model
//!
//! OpenAI, DeepSeek, Ollama and Databricks serving endpoints all accept the
//! same `/chat/completions` request shape, so one client covers them. The
//! endpoint, model name and credential come from a resolved provider
//! configuration rather than from the process environment.

use super::{Content, GenerationConfig, Model, Part};
use crate::adk::error::{BoxError, ModelError};
use crate::adk::tool::Tool;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for a single completion request, connect through body.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Model client for chat-completions compatible endpoints
pub struct ChatCompletionsModel {
    client: Client,
    provider: String,
    model_name: String,
    base_url: String,
    api_key: Option<String>,
}

impl ChatCompletionsModel {
    pub fn new(
        provider: impl Into<String>,
        model_name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: build_client(DEFAULT_REQUEST_TIMEOUT),
            provider: provider.into(),
            model_name: model_name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Replace the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = build_client(timeout);
        self
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Convert internal Content to chat-completions messages.
    ///
    /// A turn carrying tool results becomes one `tool` message per result.
    fn to_messages(content: &Content) -> Vec<Value> {
        let results: Vec<Value> = content
            .parts
            .iter()
            .filter_map(|part| match part {
                Part::FunctionResponse { id, name, response } => Some(json!({
                    "role": "tool",
                    "tool_call_id": if id.is_empty() { name } else { id },
                    "content": serde_json::to_string(response).unwrap_or_default()
                })),
                _ => None,
            })
            .collect();
        if !results.is_empty() {
            return results;
        }
        vec![Self::to_message(content)]
    }

    fn to_message(content: &Content) -> Value {
        let role = match content.role.as_str() {
            "model" => "assistant",
            other => other,
        };

        let mut tool_calls = Vec::new();
        let mut text = String::new();
        for part in &content.parts {
            match part {
                Part::Text(t) => text.push_str(t),
                Part::FunctionCall { id, name, args } => tool_calls.push(json!({
                    "id": if id.is_empty() { name } else { id },
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": serde_json::to_string(args).unwrap_or_default()
                    }
                })),
                Part::FunctionResponse { .. } => {}
            }
        }

        if tool_calls.is_empty() {
            json!({ "role": role, "content": text })
        } else {
            json!({
                "role": role,
                "content": if text.is_empty() { Value::Null } else { json!(text) },
                "tool_calls": tool_calls
            })
        }
    }

    fn tool_definitions(tools: &[Arc<dyn Tool>]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name(),
                        "description": t.description(),
                        "parameters": t.schema()
                    }
                })
            })
            .collect()
    }

    fn parse_response(response: &Value) -> Result<Content, ModelError> {
        let message = response["choices"]
            .as_array()
            .and_then(|c| c.first())
            .map(|choice| &choice["message"])
            .ok_or_else(|| ModelError::InvalidResponse("no choices in response".to_string()))?;

        let mut parts = Vec::new();
        if let Some(text) = message["content"].as_str() {
            if !text.is_empty() {
                parts.push(Part::Text(text.to_string()));
            }
        }

        if let Some(tool_calls) = message["tool_calls"].as_array() {
            for (index, tc) in tool_calls.iter().enumerate() {
                let id = tc["id"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("call_{}", index));
                let name = tc["function"]["name"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let raw = tc["function"]["arguments"].as_str().unwrap_or("{}");
                let args = serde_json::from_str(raw).unwrap_or_else(|_| json!({}));
                parts.push(Part::FunctionCall { id, name, args });
            }
        }

        Ok(Content {
            role: "model".to_string(),
            parts,
        })
    }

    fn request_body(
        &self,
        history: &[Content],
        config: Option<&GenerationConfig>,
        tools: Option<&[Arc<dyn Tool>]>,
    ) -> Value {
        let messages: Vec<Value> = history.iter().flat_map(Self::to_messages).collect();
        let mut body = json!({
            "model": self.model_name,
            "messages": messages
        });

        if let Some(cfg) = config {
            if let Some(temp) = cfg.temperature {
                body["temperature"] = json!(temp);
            }
            if let Some(max_tokens) = cfg.max_output_tokens {
                body["max_tokens"] = json!(max_tokens);
            }
            if let Some(top_p) = cfg.top_p {
                body["top_p"] = json!(top_p);
            }
        }

        if let Some(tools) = tools.filter(|t| !t.is_empty()) {
            body["tools"] = json!(Self::tool_definitions(tools));
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

fn build_client(timeout: Duration) -> Client {
    Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        log::warn!("Falling back to default HTTP client: {}", e);
        Client::new()
    })
}

#[async_trait]
impl Model for ChatCompletionsModel {
    async fn generate_content(
        &self,
        history: &[Content],
        config: Option<&GenerationConfig>,
        tools: Option<&[Arc<dyn Tool>]>,
    ) -> Result<Content, BoxError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(history, config, tools);
        log::debug!(
            "{} request to {} with {} messages",
            self.provider,
            url,
            history.len()
        );

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let resp = request.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            if status.as_u16() == 429 {
                return Err(Box::new(ModelError::RateLimited {
                    retry_after_secs: None,
                }));
            }
            return Err(Box::new(ModelError::Api {
                provider: self.provider.clone(),
                status: status.as_u16(),
                message: text,
            }));
        }

        let resp_json: Value = resp.json().await?;
        Ok(Self::parse_response(&resp_json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_and_model_roles() {
        let msg = ChatCompletionsModel::to_message(&Content::text("user", "Hello"));
        assert_eq!(msg["role"], "user");
        assert_eq!(msg["content"], "Hello");

        let msg = ChatCompletionsModel::to_message(&Content::text("model", "I can help"));
        assert_eq!(msg["role"], "assistant");
    }

    #[test]
    fn test_function_call_message() {
        let content = Content {
            role: "model".to_string(),
            parts: vec![Part::FunctionCall {
                id: "call_abc".to_string(),
                name: "search".to_string(),
                args: json!({"query": "rust"}),
            }],
        };

        let msg = ChatCompletionsModel::to_message(&content);
        assert_eq!(msg["role"], "assistant");
        assert!(msg["content"].is_null());
        assert_eq!(msg["tool_calls"][0]["id"], "call_abc");
        assert_eq!(msg["tool_calls"][0]["function"]["name"], "search");
    }

    #[test]
    fn test_function_response_message() {
        let content = Content {
            role: "user".to_string(),
            parts: vec![Part::FunctionResponse {
                id: "call_abc".to_string(),
                name: "search".to_string(),
                response: json!({"hits": 3}),
            }],
        };
        let msgs = ChatCompletionsModel::to_messages(&content);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["role"], "tool");
        assert_eq!(msgs[0]["tool_call_id"], "call_abc");
    }

    #[test]
    fn test_every_tool_result_becomes_its_own_message() {
        let model = ChatCompletionsModel::new("openai", "gpt-4o", "http://localhost", None);
        let call = |id: &str, name: &str| Part::FunctionCall {
            id: id.to_string(),
            name: name.to_string(),
            args: json!({}),
        };
        let result = |id: &str, name: &str| Part::FunctionResponse {
            id: id.to_string(),
            name: name.to_string(),
            response: json!({"ok": true}),
        };
        let history = vec![
            Content::text("user", "look both up"),
            Content {
                role: "model".to_string(),
                parts: vec![call("call_1", "search"), call("call_2", "search")],
            },
            Content {
                role: "user".to_string(),
                parts: vec![result("call_1", "search"), result("call_2", "search")],
            },
        ];

        let body = model.request_body(&history, None, None);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1]["tool_calls"][0]["id"], "call_1");
        assert_eq!(messages[1]["tool_calls"][1]["id"], "call_2");
        assert_eq!(messages[2]["role"], "tool");
        assert_eq!(messages[2]["tool_call_id"], "call_1");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_2");
    }

    #[test]
    fn test_parse_tool_call_response() {
        let response = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_123",
                        "type": "function",
                        "function": {
                            "name": "get_weather",
                            "arguments": "{\"city\": \"London\"}"
                        }
                    }]
                }
            }]
        });

        let content = ChatCompletionsModel::parse_response(&response).unwrap();
        match &content.parts[0] {
            Part::FunctionCall { id, name, args } => {
                assert_eq!(id, "call_123");
                assert_eq!(name, "get_weather");
                assert_eq!(args["city"], "London");
            }
            other => panic!("Expected FunctionCall part, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_empty_choices_is_invalid() {
        let err = ChatCompletionsModel::parse_response(&json!({"choices": []})).unwrap_err();
        assert!(matches!(err, ModelError::InvalidResponse(_)));
    }

    #[test]
    fn test_request_body_uses_bare_model_name() {
        let model = ChatCompletionsModel::new(
            "ollama",
            "llama3:8b",
            "http://localhost:11434/v1/",
            None,
        );
        let body = model.request_body(
            &[Content::text("user", "hi")],
            Some(&GenerationConfig {
                temperature: Some(0.2),
                ..Default::default()
            }),
            None,
        );
        assert_eq!(body["model"], "llama3:8b");
        assert!(body.get("tools").is_none());
        assert!((body["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
        assert_eq!(model.base_url, "http://localhost:11434/v1");
    }

    #[tokio::test]
    async fn test_request_times_out_against_silent_endpoint() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and hold connections without ever answering.
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let model = ChatCompletionsModel::new("openai", "gpt-4o", format!("http://{}", addr), None)
            .with_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = model
            .generate_content(&[Content::text("user", "hi")], None, None)
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        let timed_out = err
            .downcast_ref::<reqwest::Error>()
            .map(|e| e.is_timeout())
            .unwrap_or(false);
        assert!(timed_out, "expected timeout, got {}", err);
        server.abort();
    }
}

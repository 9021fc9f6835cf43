// SPDX-License-Identifier: MIT

use super::McpService;
use crate::adk::error::BoxError;
use crate::adk::tool::Tool;
use async_trait::async_trait;
use rmcp::model::CallToolRequestParam;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A tool served by an MCP server
pub struct McpTool {
    service: Arc<RwLock<McpService>>,
    name: String,
    description: String,
    schema: Value,
    origin: String,
}

impl McpTool {
    pub fn new(
        service: Arc<RwLock<McpService>>,
        server: &str,
        name: String,
        description: String,
        schema: Value,
    ) -> Self {
        Self {
            service,
            name,
            description,
            schema,
            origin: format!("mcp:{}", server),
        }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> &Value {
        &self.schema
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    async fn execute(&self, input: Value) -> Result<Value, BoxError> {
        let arguments = match input {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => return Err(format!("{} expects an object, got {}", self.name, other).into()),
        };

        let service = self.service.read().await;
        let result = service
            .call_tool(CallToolRequestParam {
                name: self.name.clone().into(),
                arguments,
            })
            .await?;
        log::debug!("{} tool {} returned", self.origin, self.name);
        unwrap_result(serde_json::to_value(result)?)
            .map_err(|message| format!("{} reported an error: {}", self.name, message).into())
    }
}

/// Reduce a `CallToolResult` to what an agent needs: structured content when
/// the server sends it, otherwise the text parts joined, otherwise the raw
/// content list. `isError` results become errors.
fn unwrap_result(result: Value) -> Result<Value, String> {
    let content = result.get("content").cloned().unwrap_or(Value::Array(vec![]));
    let texts: Vec<&str> = content
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        return Err(if texts.is_empty() {
            content.to_string()
        } else {
            texts.join("\n")
        });
    }
    if let Some(structured) = result.get("structuredContent").filter(|v| !v.is_null()) {
        return Ok(structured.clone());
    }
    let all_text = content.as_array().is_some_and(|items| items.len() == texts.len());
    if all_text {
        Ok(Value::String(texts.join("\n")))
    } else {
        Ok(content)
    }
}

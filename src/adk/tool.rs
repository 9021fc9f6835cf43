// SPDX-License-Identifier: MIT

use crate::adk::error::BoxError;
use async_trait::async_trait;
use serde_json::Value;

/// Origin reported by tools registered in-process.
pub const BUILTIN_ORIGIN: &str = "builtin";

/// Trait for tools that can be called by agents.
///
/// `name()`, `description()` and `schema()` hand out borrowed data;
/// implementations keep these values in struct fields.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns the tool name (must be unique within an agent's tool set)
    fn name(&self) -> &str;

    /// Returns a human-readable description of what the tool does
    fn description(&self) -> &str;

    /// Returns the JSON schema for the tool's input parameters
    fn schema(&self) -> &Value;

    /// Where the tool came from, e.g. `builtin` or `mcp:<server>`
    fn origin(&self) -> &str {
        BUILTIN_ORIGIN
    }

    /// Execute the tool with the given input and return the result
    async fn execute(&self, input: Value) -> Result<Value, BoxError>;
}

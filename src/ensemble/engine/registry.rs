// SPDX-License-Identifier: MIT

//! Tool lookup by logical identifier
//!
//! A [`ToolRegistry`] asks its resolvers in order until one of them handles
//! the id. Resolvers return `Ok(None)` for ids they do not own, so a missing
//! tool and a broken tool source are reported differently.

use crate::adk::error::BoxError;
use crate::adk::tool::Tool;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Expands to every tool of every currently enabled external source
pub const AGGREGATE_TOOL_ID: &str = "all_enabled_tools";
pub const AGGREGATE_TOOL_ALIAS: &str = "mcp:*";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolLookupError {
    #[error("unknown tool '{0}'")]
    Unknown(String),

    #[error("tool source failed for '{id}': {message}")]
    Source { id: String, message: String },
}

#[async_trait]
pub trait ToolResolver: Send + Sync {
    /// Tools for `id`, or `None` when this resolver does not handle it.
    async fn resolve(&self, id: &str) -> Result<Option<Vec<Arc<dyn Tool>>>, BoxError>;
}

/// Tools registered in-process by name
#[derive(Clone, Default)]
pub struct StaticToolResolver {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl StaticToolResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let mut tools = self.tools.write().await;
        tools.insert(tool.name().to_string(), tool);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let tools = self.tools.read().await;
        tools.get(name).cloned()
    }
}

#[async_trait]
impl ToolResolver for StaticToolResolver {
    async fn resolve(&self, id: &str) -> Result<Option<Vec<Arc<dyn Tool>>>, BoxError> {
        Ok(self.get(id).await.map(|tool| vec![tool]))
    }
}

/// Something that can list the tools enabled right now
#[async_trait]
pub trait EnabledToolSource: Send + Sync {
    async fn enabled_tools(&self) -> Result<Vec<Arc<dyn Tool>>, BoxError>;
}

/// Serves the aggregate id. The source is queried on every call; nothing is
/// kept between executions.
pub struct AggregateToolResolver {
    source: Arc<dyn EnabledToolSource>,
}

impl AggregateToolResolver {
    pub fn new(source: Arc<dyn EnabledToolSource>) -> Self {
        Self { source }
    }

    pub fn handles(id: &str) -> bool {
        id == AGGREGATE_TOOL_ID || id == AGGREGATE_TOOL_ALIAS
    }
}

#[async_trait]
impl ToolResolver for AggregateToolResolver {
    async fn resolve(&self, id: &str) -> Result<Option<Vec<Arc<dyn Tool>>>, BoxError> {
        if !Self::handles(id) {
            return Ok(None);
        }
        let tools = self.source.enabled_tools().await?;
        log::debug!("Aggregate tool id expanded to {} tools", tools.len());
        Ok(Some(tools))
    }
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    resolvers: Vec<Arc<dyn ToolResolver>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ToolResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    pub async fn resolve(&self, id: &str) -> Result<Vec<Arc<dyn Tool>>, ToolLookupError> {
        for resolver in &self.resolvers {
            match resolver.resolve(id).await {
                Ok(Some(tools)) => return Ok(tools),
                Ok(None) => continue,
                Err(e) => {
                    return Err(ToolLookupError::Source {
                        id: id.to_string(),
                        message: e.to_string(),
                    })
                }
            }
        }
        Err(ToolLookupError::Unknown(id.to_string()))
    }
}

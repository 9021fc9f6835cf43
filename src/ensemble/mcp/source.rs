// SPDX-License-Identifier: MIT

//! MCP server catalog
//!
//! The catalog is a YAML file listing servers:
//!
//! ```yaml
//! servers:
//!   - name: files
//!     command: npx
//!     args: ["-y", "@modelcontextprotocol/server-filesystem", "."]
//!     enabled: true
//! ```
//!
//! A bare list without the `servers` key is accepted too. The file is read on
//! every query so toggling `enabled` takes effect on the next preparation.

use super::manager::{McpServerConfig, McpServiceManager};
use super::tool::McpTool;
use crate::adk::error::BoxError;
use crate::adk::tool::Tool;
use crate::ensemble::engine::registry::{EnabledToolSource, ToolResolver};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Deserialize)]
#[serde(untagged)]
enum Catalog {
    Wrapped { servers: Vec<McpServerConfig> },
    List(Vec<McpServerConfig>),
}

pub struct McpToolSource {
    catalog: Option<PathBuf>,
    manager: Arc<McpServiceManager>,
}

impl McpToolSource {
    pub fn new(catalog: Option<PathBuf>, manager: Arc<McpServiceManager>) -> Self {
        Self { catalog, manager }
    }

    pub async fn servers(&self) -> Result<Vec<McpServerConfig>, BoxError> {
        let Some(path) = &self.catalog else {
            return Ok(vec![]);
        };
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("MCP catalog {:?} does not exist; no servers enabled", path);
                return Ok(vec![]);
            }
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(vec![]);
        }
        let servers = match serde_yaml::from_str::<Catalog>(&content)? {
            Catalog::Wrapped { servers } | Catalog::List(servers) => servers,
        };
        Ok(servers)
    }

    async fn server_tools(&self, config: &McpServerConfig) -> Result<Vec<Arc<dyn Tool>>, BoxError> {
        let service = self.manager.get_or_connect(config).await?;
        let listed = service.read().await.list_all_tools().await?;
        Ok(listed
            .into_iter()
            .map(|tool| {
                Arc::new(McpTool::new(
                    service.clone(),
                    &config.name,
                    tool.name.to_string(),
                    tool.description.unwrap_or_default().to_string(),
                    serde_json::to_value(&tool.input_schema).unwrap_or_default(),
                )) as Arc<dyn Tool>
            })
            .collect())
    }
}

#[async_trait]
impl EnabledToolSource for McpToolSource {
    async fn enabled_tools(&self) -> Result<Vec<Arc<dyn Tool>>, BoxError> {
        let mut tools = Vec::new();
        for server in self.servers().await? {
            if !server.enabled {
                if self.manager.disconnect(&server.name).await {
                    log::info!("MCP server '{}' disabled; connection closed", server.name);
                }
                continue;
            }
            let found = self
                .server_tools(&server)
                .await
                .map_err(|e| format!("MCP server '{}': {}", server.name, e))?;
            log::debug!("MCP server '{}' offers {} tools", server.name, found.len());
            tools.extend(found);
        }
        Ok(tools)
    }
}

/// `mcp:<server>` selects every tool of one enabled server.
#[async_trait]
impl ToolResolver for McpToolSource {
    async fn resolve(&self, id: &str) -> Result<Option<Vec<Arc<dyn Tool>>>, BoxError> {
        let Some(name) = id.strip_prefix("mcp:") else {
            return Ok(None);
        };
        let servers = self.servers().await?;
        match servers.iter().find(|s| s.name == name && s.enabled) {
            Some(server) => Ok(Some(self.server_tools(server).await?)),
            None => Ok(None),
        }
    }
}

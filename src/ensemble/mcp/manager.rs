// SPDX-License-Identifier: MIT

use super::{connect, McpService};
use crate::adk::error::BoxError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One entry of the server catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

type SharedService = Arc<RwLock<McpService>>;

/// Keeps server processes alive between workflow runs. Connections are
/// reused; which servers count as enabled is decided by the caller.
#[derive(Default)]
pub struct McpServiceManager {
    services: RwLock<HashMap<String, SharedService>>,
}

impl McpServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_connect(&self, config: &McpServerConfig) -> Result<SharedService, BoxError> {
        if let Some(service) = self.services.read().await.get(&config.name) {
            return Ok(service.clone());
        }

        let mut services = self.services.write().await;
        // Another caller may have connected while we waited for the lock
        if let Some(service) = services.get(&config.name) {
            return Ok(service.clone());
        }
        log::info!(
            "Starting MCP server '{}': {} {:?}",
            config.name,
            config.command,
            config.args
        );
        let service = Arc::new(RwLock::new(connect(&config.command, &config.args).await?));
        services.insert(config.name.clone(), service.clone());
        Ok(service)
    }

    /// Drop the connection to a server that has been disabled.
    pub async fn disconnect(&self, name: &str) -> bool {
        self.services.write().await.remove(name).is_some()
    }

    pub async fn connected(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

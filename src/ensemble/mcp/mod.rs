// SPDX-License-Identifier: MIT

//! MCP servers as a tool source
//!
//! - [`manager`] - one running client per configured server
//! - [`tool`] - adapts a server tool to [`crate::adk::tool::Tool`]
//! - [`source`] - the server catalog, queried whenever a workflow asks for
//!   enabled tools

pub mod manager;
pub mod source;
pub mod tool;

pub use manager::{McpServerConfig, McpServiceManager};
pub use source::McpToolSource;
pub use tool::McpTool;

use crate::adk::error::BoxError;
use rmcp::model::{ClientCapabilities, ClientInfo, Implementation};
use rmcp::service::{RoleClient, RunningService};
use rmcp::transport::child_process::TokioChildProcess;
use rmcp::{ClientHandler, ServiceExt};
use tokio::process::Command;

/// A connected MCP client
pub type McpService = RunningService<RoleClient, EnsembleClientHandler>;

#[derive(Debug, Clone)]
pub struct EnsembleClientHandler;

impl ClientHandler for EnsembleClientHandler {
    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            protocol_version: Default::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
        }
    }
}

/// Spawn `command args..` and speak MCP with it over stdio.
pub async fn connect(command: &str, args: &[String]) -> Result<McpService, BoxError> {
    let mut server_cmd = Command::new(command);
    server_cmd.args(args);

    let transport = TokioChildProcess::new(server_cmd)?;
    let service = EnsembleClientHandler.serve(transport).await?;
    Ok(service)
}

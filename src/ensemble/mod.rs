// SPDX-License-Identifier: MIT

pub mod config;
pub mod engine;
pub mod mcp;
pub mod server;
pub mod workflow;

pub use config::Settings;
pub use engine::ExecutionCoordinator;

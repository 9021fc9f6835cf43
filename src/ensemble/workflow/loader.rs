// SPDX-License-Identifier: MIT

//! Workflow loader - reads definitions from YAML or JSON files

use super::types::WorkflowDefinition;
use crate::adk::error::EnsembleError;
use std::fs;
use std::path::Path;

/// Loads workflow definitions from disk
pub struct WorkflowLoader;

impl WorkflowLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load a definition; `.json` files are parsed as JSON, everything else as YAML
    pub fn load_workflow<P: AsRef<Path>>(&self, path: P) -> Result<WorkflowDefinition, EnsembleError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::parse_json(&content)
        } else {
            Self::parse_yaml(&content)
        }
    }

    pub fn parse_yaml(content: &str) -> Result<WorkflowDefinition, EnsembleError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn parse_json(content: &str) -> Result<WorkflowDefinition, EnsembleError> {
        Ok(serde_json::from_str(content)?)
    }
}

impl Default for WorkflowLoader {
    fn default() -> Self {
        Self::new()
    }
}

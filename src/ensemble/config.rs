// SPDX-License-Identifier: MIT

//! Engine settings read from the environment
//!
//! Call `dotenv().ok()` first if a `.env` file should be honored. Every
//! setting has a default, so an empty environment yields a working in-memory
//! engine.

use crate::adk::error::ConfigurationError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// `None` keeps records in memory only
    pub store_dir: Option<PathBuf>,
    pub output_root: PathBuf,
    pub trace_batch_size: usize,
    pub trace_flush_interval: Duration,
    pub status_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub default_model: String,
    pub default_provider: String,
    /// YAML catalog of MCP servers
    pub mcp_servers: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_dir: None,
            output_root: PathBuf::from("tmp/crew_outputs"),
            trace_batch_size: 10,
            trace_flush_interval: Duration::from_millis(500),
            status_max_attempts: 3,
            retry_base_delay: Duration::from_millis(1000),
            default_model: "gpt-4o".to_string(),
            default_provider: "openai".to_string(),
            mcp_servers: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            store_dir: get("ENSEMBLE_STORE_DIR").map(PathBuf::from),
            output_root: get("ENSEMBLE_OUTPUT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_root),
            trace_batch_size: parse(&get, "ENSEMBLE_TRACE_BATCH_SIZE")?
                .unwrap_or(defaults.trace_batch_size),
            trace_flush_interval: parse(&get, "ENSEMBLE_TRACE_FLUSH_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.trace_flush_interval),
            status_max_attempts: parse(&get, "ENSEMBLE_STATUS_MAX_ATTEMPTS")?
                .unwrap_or(defaults.status_max_attempts),
            retry_base_delay: parse(&get, "ENSEMBLE_RETRY_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            default_model: get("ENSEMBLE_DEFAULT_MODEL").unwrap_or(defaults.default_model),
            default_provider: get("ENSEMBLE_DEFAULT_PROVIDER")
                .map(|p| p.to_lowercase())
                .unwrap_or(defaults.default_provider),
            mcp_servers: get("ENSEMBLE_MCP_SERVERS").map(PathBuf::from),
        })
    }
}

fn parse<T, G>(get: &G, key: &str) -> Result<Option<T>, ConfigurationError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| ConfigurationError::InvalidSetting {
                    name: key.to_string(),
                    message: format!("'{}': {}", raw, e),
                })
        })
        .transpose()
}

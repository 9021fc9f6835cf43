// SPDX-License-Identifier: MIT

//! Model provider resolution
//!
//! Maps `(model, provider)` pairs from agent definitions to a concrete
//! [`ProviderConfig`]: the prefixed model identifier, the endpoint to call and
//! the name of the credential to use. Credentials are looked up through a
//! [`SecretStore`] and only checked for presence here; their values are read
//! when a model client is built and never stored on records or traces.

use crate::adk::error::{BoxError, ConfigurationError};
use crate::adk::model::{ChatCompletionsModel, Model};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// How one provider is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEntry {
    /// Prepended as `<prefix>/<model>`; `None` leaves the model name bare
    pub prefix: Option<String>,
    pub endpoint: Option<String>,
    /// Environment variable that configures the endpoint, for error messages
    pub endpoint_variable: Option<String>,
    pub credential_key: Option<String>,
    /// Ollama tags use `name:tag`; definitions often write `name-tag`
    pub colon_tags: bool,
}

impl ProviderEntry {
    pub fn prefixed(prefix: &str, endpoint: &str) -> Self {
        Self {
            prefix: Some(prefix.to_string()),
            endpoint: Some(endpoint.to_string()),
            endpoint_variable: None,
            credential_key: None,
            colon_tags: false,
        }
    }

    pub fn unprefixed(endpoint: &str) -> Self {
        Self {
            prefix: None,
            ..Self::prefixed("", endpoint)
        }
    }

    pub fn with_credential(mut self, key: &str) -> Self {
        self.credential_key = Some(key.to_string());
        self
    }
}

struct BuiltinProvider {
    name: &'static str,
    prefix: Option<&'static str>,
    endpoint_variable: &'static str,
    default_endpoint: Option<&'static str>,
    credential_key: Option<&'static str>,
    colon_tags: bool,
}

static BUILTIN_PROVIDERS: Lazy<Vec<BuiltinProvider>> = Lazy::new(|| {
    vec![
        BuiltinProvider {
            name: "openai",
            prefix: None,
            endpoint_variable: "OPENAI_API_BASE",
            default_endpoint: Some("https://api.openai.com/v1"),
            credential_key: Some("OPENAI_API_KEY"),
            colon_tags: false,
        },
        BuiltinProvider {
            name: "anthropic",
            prefix: Some("anthropic"),
            endpoint_variable: "ANTHROPIC_API_BASE",
            default_endpoint: Some("https://api.anthropic.com/v1"),
            credential_key: Some("ANTHROPIC_API_KEY"),
            colon_tags: false,
        },
        BuiltinProvider {
            name: "deepseek",
            prefix: Some("deepseek"),
            endpoint_variable: "DEEPSEEK_ENDPOINT",
            default_endpoint: Some("https://api.deepseek.com"),
            credential_key: Some("DEEPSEEK_API_KEY"),
            colon_tags: false,
        },
        BuiltinProvider {
            name: "ollama",
            prefix: Some("ollama"),
            endpoint_variable: "OLLAMA_API_BASE",
            default_endpoint: Some("http://localhost:11434"),
            credential_key: None,
            colon_tags: true,
        },
        BuiltinProvider {
            name: "databricks",
            prefix: Some("databricks"),
            endpoint_variable: "DATABRICKS_ENDPOINT",
            default_endpoint: None,
            credential_key: Some("DATABRICKS_TOKEN"),
            colon_tags: false,
        },
        BuiltinProvider {
            name: "gemini",
            prefix: Some("gemini"),
            endpoint_variable: "GEMINI_API_BASE",
            default_endpoint: Some("https://generativelanguage.googleapis.com/v1beta/openai"),
            credential_key: Some("GEMINI_API_KEY"),
            colon_tags: false,
        },
    ]
});

#[derive(Debug, Clone, Default)]
pub struct ProviderTable {
    entries: HashMap<String, ProviderEntry>,
}

impl ProviderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in providers with endpoints overridable from the environment
    pub fn from_env() -> Self {
        let mut table = Self::new();
        for p in BUILTIN_PROVIDERS.iter() {
            let endpoint = std::env::var(p.endpoint_variable)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .or_else(|| p.default_endpoint.map(String::from));
            table = table.with(
                p.name,
                ProviderEntry {
                    prefix: p.prefix.map(String::from),
                    endpoint,
                    endpoint_variable: Some(p.endpoint_variable.to_string()),
                    credential_key: p.credential_key.map(String::from),
                    colon_tags: p.colon_tags,
                },
            );
        }
        table
    }

    pub fn with(mut self, name: &str, entry: ProviderEntry) -> Self {
        self.entries.insert(name.to_lowercase(), entry);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ProviderEntry> {
        self.entries.get(&name.to_lowercase())
    }
}

/// Fully resolved model binding for one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: String,
    /// Provider-qualified identifier, e.g. `ollama/llama3:8b`
    pub model: String,
    /// Name sent on the wire
    pub api_model: String,
    pub endpoint: String,
    /// Name of the credential, never its value
    pub credential_key: Option<String>,
}

/// Read-only access to credentials
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

/// Credentials from process environment variables
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecretStore;

impl SecretStore for EnvSecretStore {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

/// Fixed credential map
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    secrets: HashMap<String, String>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.secrets.insert(key.to_string(), value.to_string());
        self
    }
}

impl SecretStore for StaticSecretStore {
    fn get(&self, key: &str) -> Option<String> {
        self.secrets.get(key).cloned()
    }
}

pub struct ProviderConfigResolver {
    table: ProviderTable,
    secrets: Arc<dyn SecretStore>,
}

impl ProviderConfigResolver {
    pub fn new(table: ProviderTable, secrets: Arc<dyn SecretStore>) -> Self {
        Self { table, secrets }
    }

    pub fn secrets(&self) -> &Arc<dyn SecretStore> {
        &self.secrets
    }

    pub fn resolve(&self, model: &str, provider: &str) -> Result<ProviderConfig, ConfigurationError> {
        let provider = provider.trim().to_lowercase();
        let entry = self
            .table
            .get(&provider)
            .ok_or_else(|| ConfigurationError::UnknownProvider(provider.clone()))?;

        let mut bare = model.trim();
        for qualifier in [entry.prefix.as_deref(), Some(provider.as_str())]
            .into_iter()
            .flatten()
        {
            if let Some(rest) = bare.strip_prefix(qualifier).and_then(|r| r.strip_prefix('/')) {
                bare = rest;
            }
        }
        let api_model = if entry.colon_tags && !bare.contains(':') {
            match bare.rsplit_once('-') {
                Some((name, tag)) => format!("{}:{}", name, tag),
                None => bare.to_string(),
            }
        } else {
            bare.to_string()
        };
        let qualified = match &entry.prefix {
            Some(prefix) => format!("{}/{}", prefix, api_model),
            None => api_model.clone(),
        };

        let endpoint = entry
            .endpoint
            .clone()
            .ok_or_else(|| ConfigurationError::MissingEndpoint {
                provider: provider.clone(),
                variable: entry
                    .endpoint_variable
                    .clone()
                    .unwrap_or_else(|| "endpoint".to_string()),
            })?;

        if let Some(key) = &entry.credential_key {
            if !self.secrets.contains(key) {
                return Err(ConfigurationError::MissingCredential {
                    provider,
                    key: key.clone(),
                });
            }
        }

        Ok(ProviderConfig {
            provider,
            model: qualified,
            api_model,
            endpoint,
            credential_key: entry.credential_key.clone(),
        })
    }
}

/// Builds a callable model for a resolved configuration
pub trait ModelFactory: Send + Sync {
    fn create(&self, config: &ProviderConfig) -> Result<Arc<dyn Model>, BoxError>;
}

/// Chat-completions client per provider, credentials read at construction
pub struct HttpModelFactory {
    secrets: Arc<dyn SecretStore>,
}

impl HttpModelFactory {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self { secrets }
    }
}

impl ModelFactory for HttpModelFactory {
    fn create(&self, config: &ProviderConfig) -> Result<Arc<dyn Model>, BoxError> {
        let api_key = match &config.credential_key {
            Some(key) => Some(
                self.secrets
                    .get(key)
                    .ok_or_else(|| format!("credential {} disappeared", key))?,
            ),
            None => None,
        };
        let base_url = if config.provider == "ollama" {
            format!("{}/v1", config.endpoint.trim_end_matches('/'))
        } else {
            config.endpoint.clone()
        };
        Ok(Arc::new(ChatCompletionsModel::new(
            config.provider.clone(),
            config.api_model.clone(),
            base_url,
            api_key,
        )))
    }
}

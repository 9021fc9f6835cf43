// SPDX-License-Identifier: MIT

//! Output guardrails
//!
//! A guardrail checks a task's output after each attempt. A rejected output
//! costs the task one attempt, and the feedback is handed to the agent on
//! the next one. Declared per task under `config.guardrail`:
//!
//! ```yaml
//! config:
//!   retry_on_fail: true
//!   guardrail:
//!     type: minimum_number
//!     field_name: total_count
//!     min_value: 10
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputGuardrail {
    /// Output must contain something other than whitespace
    NotEmpty,
    /// Character count bounds, inclusive
    Length {
        #[serde(default)]
        min: Option<usize>,
        #[serde(default)]
        max: Option<usize>,
    },
    /// Every value must appear in the output, case-insensitively
    Contains { values: Vec<String> },
    /// Output must be a JSON object or array
    Json,
    /// Output must be JSON whose numeric `field_name` exceeds `min_value`
    MinimumNumber {
        #[serde(default = "default_field_name")]
        field_name: String,
        #[serde(default = "default_min_value")]
        min_value: f64,
        #[serde(default)]
        message: Option<String>,
    },
}

fn default_field_name() -> String {
    "total_count".to_string()
}

fn default_min_value() -> f64 {
    1.0
}

impl OutputGuardrail {
    /// Reject settings that no output could satisfy.
    pub fn validate_settings(&self) -> Result<(), String> {
        match self {
            Self::Length {
                min: Some(min),
                max: Some(max),
            } if min > max => Err(format!("min length {} exceeds max length {}", min, max)),
            Self::Contains { values } if values.is_empty() => {
                Err("contains guardrail needs at least one value".to_string())
            }
            Self::MinimumNumber { field_name, .. } if field_name.trim().is_empty() => {
                Err("minimum_number guardrail needs a field_name".to_string())
            }
            _ => Ok(()),
        }
    }

    /// Check an output. `Err` carries feedback for the next attempt.
    pub fn check(&self, output: &str) -> Result<(), String> {
        match self {
            Self::NotEmpty => {
                if output.trim().is_empty() {
                    return Err("The output is empty.".to_string());
                }
            }
            Self::Length { min, max } => {
                let len = output.trim().chars().count();
                if let Some(min) = min.filter(|m| len < *m) {
                    return Err(format!(
                        "The output has {} characters; at least {} are required.",
                        len, min
                    ));
                }
                if let Some(max) = max.filter(|m| len > *m) {
                    return Err(format!(
                        "The output has {} characters; at most {} are allowed.",
                        len, max
                    ));
                }
            }
            Self::Contains { values } => {
                let haystack = output.to_lowercase();
                let missing: Vec<&str> = values
                    .iter()
                    .filter(|v| !haystack.contains(&v.to_lowercase()))
                    .map(String::as_str)
                    .collect();
                if !missing.is_empty() {
                    return Err(format!("The output must mention: {}.", missing.join(", ")));
                }
            }
            Self::Json => {
                if parse_structured(output).is_none() {
                    return Err("The output must be a valid JSON object or array.".to_string());
                }
            }
            Self::MinimumNumber {
                field_name,
                min_value,
                message,
            } => {
                let value = parse_structured(output)
                    .as_ref()
                    .and_then(|v| v.get(field_name))
                    .and_then(number_of);
                let passed = value.is_some_and(|v| v > *min_value);
                if !passed {
                    return Err(message.clone().unwrap_or_else(|| {
                        format!(
                            "The output should contain a '{}' value greater than {}.",
                            field_name, min_value
                        )
                    }));
                }
            }
        }
        Ok(())
    }
}

/// Parse JSON, tolerating a surrounding markdown code fence.
fn parse_structured(output: &str) -> Option<Value> {
    let trimmed = output.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str::<Value>(body.trim())
        .ok()
        .filter(|v| v.is_object() || v.is_array())
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

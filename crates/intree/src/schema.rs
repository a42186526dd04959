use std::fmt;

use serde_json::Value;

/// Declared configuration version.
///
/// Version `0` selects legacy `{{ }}` substitution, anything newer selects
/// expression templating.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum SchemaVersion {
    V0,
    V1,
}

impl SchemaVersion {
    pub fn detect(config: &Value) -> Option<Self> {
        match config.get("version")?.as_u64()? {
            0 => Some(Self::V0),
            _ => Some(Self::V1),
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::V0 => "0",
            Self::V1 => "1",
        })
    }
}

/// Validates a parsed configuration document against the schema for its
/// declared version, returning every violation found.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, version: SchemaVersion, config: &Value) -> Vec<String>;
}

/// Structural checks for the pipeline configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinValidator;

impl SchemaValidator for BuiltinValidator {
    fn validate(&self, version: SchemaVersion, config: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        let Some(root) = config.as_object() else {
            errors.push("configuration must be a mapping".to_string());
            return errors;
        };
        if let Some(metadata) = root.get("metadata")
            && !metadata.is_object()
        {
            errors.push("`metadata` must be a mapping".to_string());
        }
        if let Some(policy) = root.get("allowPullRequests")
            && !policy.is_string()
        {
            errors.push("`allowPullRequests` must be a string".to_string());
        }
        match (version, root.get("tasks")) {
            (_, None) => errors.push("`tasks` is required".to_string()),
            (SchemaVersion::V0, Some(Value::Array(tasks))) => {
                for (index, task) in tasks.iter().enumerate() {
                    validate_legacy_task(index, task, &mut errors);
                }
            }
            (SchemaVersion::V0, Some(_)) => errors.push("`tasks` must be a list".to_string()),
            // Templated documents are only checked for shape after rendering.
            (SchemaVersion::V1, Some(Value::Array(_) | Value::Object(_))) => {}
            (SchemaVersion::V1, Some(_)) => {
                errors.push("`tasks` must be a list or a template operator".to_string())
            }
        }
        errors
    }
}

fn validate_legacy_task(index: usize, task: &Value, errors: &mut Vec<String>) {
    let Some(task) = task.as_object() else {
        errors.push(format!("`tasks[{index}]` must be a mapping"));
        return;
    };
    let Some(github) = task.get("extra").and_then(|extra| extra.get("github")) else {
        return;
    };
    if !github.is_object() {
        errors.push(format!("`tasks[{index}].extra.github` must be a mapping"));
        return;
    }
    for key in ["events", "branches", "excludeBranches"] {
        match github.get(key) {
            None | Some(Value::Null) => {}
            Some(Value::Array(items)) if items.iter().all(Value::is_string) => {}
            Some(_) => {
                errors.push(format!("`tasks[{index}].extra.github.{key}` must be a list of strings"))
            }
        }
    }
}

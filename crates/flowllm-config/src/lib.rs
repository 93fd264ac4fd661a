//! Configuration loading for FlowLLM services.
//!
//! Parses the TOML service configuration (`flowllm.toml` in the working
//! directory, or `~/.flowllm/config.toml`) into
//! [`flowllm_core::ServiceConfig`], and applies dotted-path overrides from
//! the CLI (`-o http.port=9000`). The loader is the only component that
//! touches config files; everything downstream consumes the frozen
//! `ServiceConfig` value.

use std::fs;
use std::path::{Path, PathBuf};

use flowllm_core::ServiceConfig;
use serde_json::Value;
use thiserror::Error;

pub(crate) type Result<T> = std::result::Result<T, ConfigError>;

/// Errors produced while locating, reading, or merging configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("home directory could not be determined")]
    HomeDirMissing,

    #[error("no config file found (looked for ./flowllm.toml and ~/.flowllm/config.toml)")]
    NotFound,

    #[error("invalid override `{entry}`: {reason}")]
    InvalidOverride { entry: String, reason: String },
}

/// Load configuration from an explicit path.
pub fn from_file(path: impl AsRef<Path>) -> Result<ServiceConfig> {
    let contents = fs::read_to_string(path.as_ref())?;
    Ok(toml::from_str(&contents)?)
}

/// Default per-user config path: `~/.flowllm/config.toml`.
pub fn default_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or(ConfigError::HomeDirMissing)?;
    Ok(home.join(".flowllm").join("config.toml"))
}

/// Load configuration for the current working directory.
///
/// `./flowllm.toml` wins over the per-user file; an explicit `path`
/// wins over both.
pub fn load(path: Option<&Path>) -> Result<ServiceConfig> {
    if let Some(path) = path {
        return from_file(path);
    }
    let project = Path::new("flowllm.toml");
    if project.exists() {
        return from_file(project);
    }
    let user = default_path()?;
    if user.exists() {
        return from_file(user);
    }
    Err(ConfigError::NotFound)
}

/// Apply `key.path=value` overrides in order.
///
/// Values parse as JSON when possible (`8080`, `true`, `["a"]`), else as a
/// bare string. Intermediate objects are created on demand.
pub fn apply_overrides(config: ServiceConfig, overrides: &[String]) -> Result<ServiceConfig> {
    if overrides.is_empty() {
        return Ok(config);
    }

    let mut tree = serde_json::to_value(&config).map_err(|e| ConfigError::InvalidOverride {
        entry: String::new(),
        reason: e.to_string(),
    })?;

    for entry in overrides {
        let (path, raw) = entry
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidOverride {
                entry: entry.clone(),
                reason: "expected key.path=value".to_string(),
            })?;
        let value = raw
            .parse::<Value>()
            .unwrap_or_else(|_| Value::String(raw.to_string()));
        set_path(&mut tree, path, value).map_err(|reason| ConfigError::InvalidOverride {
            entry: entry.clone(),
            reason,
        })?;
    }

    serde_json::from_value(tree).map_err(|e| ConfigError::InvalidOverride {
        entry: overrides.join(","),
        reason: e.to_string(),
    })
}

fn set_path(tree: &mut Value, path: &str, value: Value) -> std::result::Result<(), String> {
    let mut current = tree;
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err("empty path segment".to_string());
    }
    for segment in &segments[..segments.len() - 1] {
        let object = current
            .as_object_mut()
            .ok_or_else(|| format!("`{segment}` is not an object"))?;
        current = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    let last = segments[segments.len() - 1];
    current
        .as_object_mut()
        .ok_or_else(|| format!("`{last}` parent is not an object"))?
        .insert(last.to_string(), value);
    Ok(())
}

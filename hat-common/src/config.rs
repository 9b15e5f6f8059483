//! Configuration file resolution and TOML loading
//!
//! Config file location priority:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. OS-dependent user config directory (`<config_dir>/<app>/config.toml`)
//!
//! A missing config file is not an error: callers get `T::default()` and a
//! warning, so a fresh install starts with built-in defaults.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Locates the TOML config file for one application
#[derive(Debug, Clone)]
pub struct ConfigLocator {
    app_name: String,
    env_var: String,
}

impl ConfigLocator {
    pub fn new(app_name: impl Into<String>, env_var: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            env_var: env_var.into(),
        }
    }

    /// Resolve the config file path. The returned file may not exist yet.
    pub fn locate(&self, cli_arg: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = cli_arg {
            return Ok(path.to_path_buf());
        }

        if let Ok(path) = std::env::var(&self.env_var) {
            if !path.trim().is_empty() {
                return Ok(PathBuf::from(path));
            }
        }

        self.default_path()
    }

    /// OS-dependent default location
    pub fn default_path(&self) -> Result<PathBuf> {
        dirs::config_dir()
            .map(|d| d.join(&self.app_name).join("config.toml"))
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))
    }
}

/// Resolve an optional path setting: CLI value, then environment, then TOML
pub fn resolve_path(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    toml_value: Option<&Path>,
) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    toml_value.map(Path::to_path_buf)
}

/// Load a TOML file, falling back to defaults when the file is missing
pub fn load_toml<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        warn!(
            "Config file {} not found, using built-in defaults",
            path.display()
        );
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)?;
    let value = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
    debug!("Loaded config from {}", path.display());
    Ok(value)
}

/// Write a TOML file, creating the parent directory if needed
pub fn save_toml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let content = toml::to_string_pretty(value)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, content)?;
    debug!("Saved config to {}", path.display());
    Ok(())
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read host config '{}'", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid host config '{}'", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Configuration of a [`ModuleHost`](crate::ModuleHost).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// Path of the core module file. Its file stem is registered as a shared name.
    #[serde(default = "default_core_module")]
    pub core_module: PathBuf,

    /// Additional names that always resolve through the core module.
    #[serde(default)]
    pub shared_modules: Vec<String>,

    #[serde(default = "default_unload_timeout_ms")]
    pub unload_timeout_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Look for native libraries next to the module file before the OS search path.
    #[serde(default = "default_probe_module_dir")]
    pub probe_module_dir: bool,
}

fn default_core_module() -> PathBuf {
    PathBuf::from("CoreScripts.yaml")
}

fn default_unload_timeout_ms() -> u64 {
    4000
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_probe_module_dir() -> bool {
    true
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            core_module: default_core_module(),
            shared_modules: Vec::new(),
            unload_timeout_ms: default_unload_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            probe_module_dir: default_probe_module_dir(),
        }
    }
}

impl HostConfig {
    /// Reads a YAML host config; a relative core path is anchored at the file's directory.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    pub fn unload_timeout(&self) -> Duration {
        Duration::from_millis(self.unload_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Module name of the core, derived from its file name.
    pub fn core_module_name(&self) -> Option<String> {
        module_name_of(&self.core_module)
    }

    /// Makes a relative core path absolute against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.core_module.is_relative() {
            self.core_module = base.join(&self.core_module);
        }
    }
}

fn module_name_of(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .map(str::to_owned)
}

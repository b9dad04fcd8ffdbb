use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub use modhost::HostConfig;

use crate::paths::home_dir::resolve_home_dir;

/// Application configuration: where the host lives, how it loads modules and
/// how it logs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Normalized to an absolute path on load. Relative module and log paths
    /// are anchored here.
    #[serde(default)]
    pub home_dir: String,
    #[serde(default)]
    pub host: HostConfig,
    /// Logging configuration (optional, uses defaults if None).
    pub logging: Option<LoggingConfig>,
}

/// Maps target prefixes to their logging settings.
/// Key "default" is the catch-all for targets without their own section.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Section {
    pub console_level: String, // "info", "debug", "error", "off"
    #[serde(default)]
    pub file: String, // "logs/modhost.log"; empty disables the file sink
    #[serde(default)]
    pub file_level: String,
    #[serde(default)]
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub max_backups: Option<usize>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

pub fn default_logging_config() -> LoggingConfig {
    let mut logging = HashMap::new();
    logging.insert(
        "default".to_string(),
        Section {
            console_level: "info".to_string(),
            file: "logs/modhost.log".to_string(),
            file_level: "debug".to_string(),
            max_age_days: Some(7),
            max_backups: Some(3),
            max_size_mb: Some(100),
        },
    );
    logging
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            home_dir: String::new(),
            host: HostConfig::default(),
            logging: Some(default_logging_config()),
        }
    }
}

/// Environment prefix; `MODHOST__HOST__UNLOAD_TIMEOUT_MS=500` maps to `host.unload_timeout_ms`.
pub const ENV_PREFIX: &str = "MODHOST__";

impl AppConfig {
    /// Layered loading: defaults → YAML file → environment variables.
    /// Normalizes `home_dir` (creating it) and anchors relative module paths there.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        // Logging stays None unless YAML or env provides it.
        let base = AppConfig {
            logging: None,
            ..AppConfig::default()
        };

        let config_path = config_path.as_ref();
        if !config_path.is_file() {
            anyhow::bail!("config file '{}' does not exist", config_path.display());
        }

        let mut config: AppConfig = Figment::new()
            .merge(Serialized::defaults(base))
            .merge(Yaml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load config from '{}'", config_path.display()))?;

        config.normalize().context("Failed to resolve home_dir")?;
        Ok(config)
    }

    /// Load from file, or start from defaults when no file is given.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => {
                let mut config = Self::default();
                config
                    .normalize()
                    .context("Failed to resolve home_dir (defaults)")?;
                Ok(config)
            }
        }
    }

    pub fn home_dir(&self) -> PathBuf {
        PathBuf::from(&self.home_dir)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(core) = &args.core_module {
            self.host.core_module = crate::paths::home_dir::anchor(core, &self.home_dir());
        }

        let logging = self.logging.get_or_insert_with(default_logging_config);
        if let Some(default_section) = logging.get_mut("default") {
            match args.verbose {
                0 => {}
                1 => default_section.console_level = "debug".to_string(),
                _ => default_section.console_level = "trace".to_string(),
            }
        }
    }

    fn normalize(&mut self) -> Result<()> {
        let configured = Some(self.home_dir.clone()).filter(|h| !h.trim().is_empty());
        let home = resolve_home_dir(configured, DEFAULT_SUBDIR, true)
            .context("home_dir normalization failed")?;
        self.host.resolve_paths(&home);
        self.home_dir = home.to_string_lossy().into_owned();
        Ok(())
    }
}

/// Command line arguments that feed into the configuration.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub core_module: Option<PathBuf>,
    pub verbose: u8,
}

const DEFAULT_SUBDIR: &str = ".modhost";

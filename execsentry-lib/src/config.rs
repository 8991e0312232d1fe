//! Configuration management with hierarchical overrides using figment.
//!
//! Sources, lowest precedence first:
//! 1. Embedded defaults
//! 2. System configuration file (`/etc/execsentry/config.toml`)
//! 3. User configuration file (`~/.config/execsentry/config.toml`)
//! 4. Explicit configuration file (`--config`)
//! 5. Environment variables (`EXECSENTRY_AGENT_*`, nested keys joined by `__`)
//!
//! Command-line flags are applied by the binary on top of the result.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::alerting::{OutputFormat, SinkConfig};
use crate::models::RuleDefinition;

const SYSTEM_CONFIG_PATH: &str = "/etc/execsentry/config.toml";

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration format: {0}")]
    InvalidFormat(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {message}")]
    ValidationError { message: String },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::InvalidFormat(Box::new(err))
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Config {
    /// Bus and evaluator settings
    #[serde(default)]
    pub engine: EngineConfig,
    /// Alert sink settings
    #[serde(default)]
    pub alerting: AlertingConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Additional rule definitions, registered after the built-in catalog
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

/// Bus and evaluator settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Pending events each rule may queue before the oldest is dropped
    pub queue_capacity: usize,
    /// Upper bound on concurrently registered subscriptions
    pub max_subscribers: usize,
    /// How long shutdown waits for evaluators to stop
    pub shutdown_timeout_ms: u64,
    /// Register the compiled-in rule catalog
    pub builtin_rules: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            max_subscribers: 1024,
            shutdown_timeout_ms: 5000,
            builtin_rules: true,
        }
    }
}

/// Alert sink settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AlertingConfig {
    /// Sinks every alert is delivered to
    pub sinks: Vec<SinkConfig>,
}

impl Default for AlertingConfig {
    /// A single `stdout` sink writing JSON lines.
    ///
    /// ```
    /// use execsentry_lib::config::AlertingConfig;
    /// let cfg = AlertingConfig::default();
    /// assert_eq!(cfg.sinks.len(), 1);
    /// assert_eq!(cfg.sinks[0].sink_type, "stdout");
    /// ```
    fn default() -> Self {
        Self {
            sinks: vec![SinkConfig::new("stdout", "stdout", OutputFormat::Json)],
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (human, json)
    pub format: String,
    /// Include span and target information in each line
    pub structured: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "human".to_owned(),
            structured: false,
        }
    }
}

/// Configuration loader with hierarchical override support.
pub struct ConfigLoader {
    component: String,
    config_file: Option<PathBuf>,
    system_files: bool,
}

impl ConfigLoader {
    /// Create a new configuration loader for the specified component.
    ///
    /// The component name, upper-cased with `-` replaced by `_`, becomes the
    /// environment variable prefix.
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_owned(),
            config_file: None,
            system_files: true,
        }
    }

    /// Merge an explicit configuration file above the system and user files.
    #[must_use]
    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// Skip the system and user configuration files.
    #[must_use]
    pub fn without_system_files(mut self) -> Self {
        self.system_files = false;
        self
    }

    /// Environment variable prefix, e.g. `EXECSENTRY_AGENT_`.
    pub fn env_prefix(&self) -> String {
        format!("{}_", self.component.replace('-', "_").to_uppercase())
    }

    /// Load configuration with hierarchical overrides using figment.
    ///
    /// # Errors
    ///
    /// Fails if the explicit file is missing, if any source cannot be parsed
    /// into [`Config`], or if validation rejects the merged result.
    pub fn load(&self) -> Result<Config, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if self.system_files {
            if Path::new(SYSTEM_CONFIG_PATH).exists() {
                figment = figment.merge(Toml::file(SYSTEM_CONFIG_PATH));
            }

            let user_config_path = Self::user_config_path();
            if user_config_path.exists() {
                figment = figment.merge(Toml::file(&user_config_path));
            }
        }

        if let Some(path) = &self.config_file {
            if !path.exists() {
                return Err(ConfigError::FileNotFound { path: path.clone() });
            }
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed(&self.env_prefix()).split("__"));

        let config: Config = figment.extract()?;
        Self::validate_config(&config)?;
        Ok(config)
    }

    /// User configuration file path.
    ///
    /// Uses `dirs::config_dir()`, then `$HOME/.config`, then `/tmp/.config`.
    fn user_config_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            return config_dir.join("execsentry").join("config.toml");
        }

        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".config")
                .join("execsentry")
                .join("config.toml");
        }

        PathBuf::from("/tmp")
            .join(".config")
            .join("execsentry")
            .join("config.toml")
    }

    /// Validate the final configuration.
    ///
    /// Rule definitions are not checked here; the registry reports each bad
    /// rule individually so the rest can still start.
    pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
        if config.engine.queue_capacity == 0 {
            return Err(ConfigError::ValidationError {
                message: "queue_capacity must be greater than 0".to_owned(),
            });
        }

        if config.engine.max_subscribers == 0 {
            return Err(ConfigError::ValidationError {
                message: "max_subscribers must be greater than 0".to_owned(),
            });
        }

        if config.engine.shutdown_timeout_ms == 0 {
            return Err(ConfigError::ValidationError {
                message: "shutdown_timeout_ms must be greater than 0".to_owned(),
            });
        }

        if !matches!(
            config.logging.level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::ValidationError {
                message: format!("unknown log level '{}'", config.logging.level),
            });
        }

        if !matches!(config.logging.format.as_str(), "human" | "json") {
            return Err(ConfigError::ValidationError {
                message: format!("unknown log format '{}'", config.logging.format),
            });
        }

        Ok(())
    }
}

//! Stack configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/sugar/config.toml)
//! 3. Environment variables (SUGAR_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix
const ENV_PREFIX: &str = "SUGAR";

/// Store file name used when none is configured
pub const DEFAULT_DATABASE_NAME: &str = "sugar.sqlite";

/// Cloud-synced container a store can live in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudDescriptor {
    /// Identity of the container; also the sync content name
    pub identity_token: String,

    /// Directory inside the container holding the store
    #[serde(default = "default_data_directory_name")]
    pub data_directory_name: String,

    /// Directory inside the container holding sync logs
    #[serde(default = "default_logs_directory_name")]
    pub logs_directory_name: String,
}

impl CloudDescriptor {
    pub fn new(identity_token: impl Into<String>) -> Self {
        Self {
            identity_token: identity_token.into(),
            data_directory_name: default_data_directory_name(),
            logs_directory_name: default_logs_directory_name(),
        }
    }
}

/// Stack configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackConfig {
    /// Explicit store path; wins over `database_name`
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Store file name, resolved through the store locator
    #[serde(default = "default_database_name")]
    pub database_name: Option<String>,

    /// Migrate stores written by an earlier model version
    #[serde(default = "default_true")]
    pub automigrating: bool,

    /// Name of the app-specific data directory
    #[serde(default)]
    pub app_name: Option<String>,

    /// Keep the store in a cloud-synced container when one is available
    #[serde(default)]
    pub cloud: Option<CloudDescriptor>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            database_name: default_database_name(),
            automigrating: true,
            app_name: None,
            cloud: None,
        }
    }
}

impl StackConfig {
    /// Config for a store at an explicit path
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Config for a store located by file name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            database_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Config with neither a path nor a name
    pub fn unconfigured() -> Self {
        Self {
            database_name: None,
            ..Self::default()
        }
    }

    pub fn with_automigrating(mut self, automigrating: bool) -> Self {
        self.automigrating = automigrating;
        self
    }

    pub fn with_cloud(mut self, cloud: CloudDescriptor) -> Self {
        self.cloud = Some(cloud);
        self
    }

    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (SUGAR_DATABASE_PATH, SUGAR_DATABASE_NAME,
    ///    SUGAR_AUTOMIGRATE, SUGAR_APP_NAME)
    /// 2. Config file (~/.config/sugar/config.toml or SUGAR_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: StackConfig =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // SUGAR_DATABASE_PATH
        if let Ok(val) = std::env::var(format!("{}_DATABASE_PATH", ENV_PREFIX)) {
            self.database_path = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }

        // SUGAR_DATABASE_NAME
        if let Ok(val) = std::env::var(format!("{}_DATABASE_NAME", ENV_PREFIX)) {
            self.database_name = if val.is_empty() { None } else { Some(val) };
        }

        // SUGAR_AUTOMIGRATE
        if let Ok(val) = std::env::var(format!("{}_AUTOMIGRATE", ENV_PREFIX)) {
            self.automigrating = val.eq_ignore_ascii_case("true") || val == "1";
        }

        // SUGAR_APP_NAME
        if let Ok(val) = std::env::var(format!("{}_APP_NAME", ENV_PREFIX)) {
            self.app_name = if val.is_empty() { None } else { Some(val) };
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with SUGAR_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sugar")
            .join("config.toml")
    }
}

fn default_database_name() -> Option<String> {
    Some(DEFAULT_DATABASE_NAME.to_string())
}

fn default_true() -> bool {
    true
}

fn default_data_directory_name() -> String {
    "Data".to_string()
}

fn default_logs_directory_name() -> String {
    "Logs".to_string()
}

//! Configuration loading and environment variable handling

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::domains::ExtrunConfig;
use crate::error::{ConfigError, ConfigResult};

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "EXTRUN".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<ExtrunConfig> {
        debug!("Loading configuration from {:?}", path.as_ref());
        let content = std::fs::read_to_string(path)?;
        let mut config: ExtrunConfig = serde_yaml::from_str(&content)?;

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<ExtrunConfig> {
        let mut config = ExtrunConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<ExtrunConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    fn apply_env_overrides(&self, config: &mut ExtrunConfig) -> ConfigResult<()> {
        if let Some(millis) = self.parse_env::<u64>("STEP_TIMEOUT_MS")? {
            config.execution.step_timeout = Duration::from_millis(millis);
        }
        if let Some(millis) = self.parse_env::<u64>("RESTART_DEBOUNCE_MS")? {
            config.execution.restart_debounce = Duration::from_millis(millis);
        }
        if let Some(inspect) = self.parse_env::<bool>("INSPECT")? {
            config.execution.inspect = inspect;
        }
        if let Ok(folder) = self.get_env_var("APP_FOLDER") {
            config.workspace.application_folder = PathBuf::from(folder);
        }
        if let Ok(address) = self.get_env_var("DC_ADDRESS") {
            config.backend.address = address;
        }
        if let Ok(token) = self.get_env_var("ACCESS_TOKEN") {
            config.backend.access_token = Some(token);
        }
        if let Some(level) = self.parse_env("LOG_LEVEL")? {
            config.logging.level = level;
        }
        Ok(())
    }

    fn parse_env<T>(&self, name: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_env_var(name) {
            Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
                ConfigError::EnvError(format!("Invalid {}_{}: {}", self.prefix, name, e))
            }),
            Err(_) => Ok(None),
        }
    }

    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

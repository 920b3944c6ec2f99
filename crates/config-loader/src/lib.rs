use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};

pub mod deployment;
pub use deployment::DeploymentConfig;

/// Environment variable naming an optional JSON configuration file.
pub const CONFIG_FILE_ENV: &str = "SYNTH_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    ConfigFileNotFound { path: String },

    #[error("JSON parsing failed: {message}")]
    JsonParsingFailed { message: String },

    #[error("IO error: {message}")]
    IoError { message: String },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

/// Resolves the deployment configuration from built-in defaults, an optional
/// JSON file and `SYNTH_*` environment overrides, in that order.
#[derive(Debug, Clone, Default)]
pub struct ConfigManager {
    config_file: Option<PathBuf>,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            config_file: std::env::var_os(CONFIG_FILE_ENV)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            config_file: Some(path.into()),
        }
    }

    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    #[instrument(skip(self))]
    pub fn load(&self) -> Result<DeploymentConfig, ConfigError> {
        self.load_with_env(|key| std::env::var(key).ok())
    }

    /// Same as [`ConfigManager::load`] with an explicit environment lookup.
    #[instrument(skip(self, lookup))]
    pub fn load_with_env<F>(&self, lookup: F) -> Result<DeploymentConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = DeploymentConfig::default();

        if let Some(path) = &self.config_file {
            debug!("Loading deployment config file: {:?}", path);
            let content = read_config_file(path)?;
            config.apply_json(&content)?;
        }

        config.apply_env(lookup)?;
        config.validate()?;

        debug!(
            toolchain = %config.toolchain_dir.display(),
            results = %config.results_dir().display(),
            "deployment config resolved"
        );
        Ok(config)
    }
}

fn read_config_file(path: &Path) -> Result<String, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::ConfigFileNotFound {
            path: path.to_string_lossy().to_string(),
        });
    }

    fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        message: format!("Failed to read config file {}: {}", path.display(), e),
    })
}

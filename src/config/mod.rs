//! Configuration management for satchel

pub mod schema;

pub use schema::Config;

use crate::error::{SatchelError, SatchelResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Environment variable overriding the cache root
pub const CACHE_DIR_ENV: &str = "SATCHEL_CACHE_DIR";
/// Environment variable overriding the runtime interpreter
pub const PYTHON_ENV: &str = "SATCHEL_PYTHON";
/// Environment variable overriding the config file path
pub const CONFIG_ENV: &str = "SATCHEL_CONFIG";

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Config manager honouring `SATCHEL_CONFIG`
    pub fn from_env() -> Self {
        match std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
            Some(path) => Self::with_path(PathBuf::from(path)),
            None => Self::new(),
        }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("satchel")
            .join("config.toml")
    }

    /// Resolve the environment cache root
    ///
    /// `SATCHEL_CACHE_DIR` wins over `cache.dir`, which wins over the
    /// platform cache directory.
    pub fn cache_dir(config: &Config) -> PathBuf {
        if let Some(dir) = std::env::var_os(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
            return PathBuf::from(dir);
        }
        if let Some(ref dir) = config.cache.dir {
            return dir.clone();
        }
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("satchel")
    }

    /// Resolve the interpreter bundles run with
    pub fn runtime_python(config: &Config) -> String {
        std::env::var(PYTHON_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| config.runtime.python.clone())
    }

    /// Load configuration, falling back to defaults if the file is absent
    pub async fn load(&self) -> SatchelResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> SatchelResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| SatchelError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| SatchelError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> SatchelResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            SatchelError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> SatchelResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SatchelError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

//! Configuration schema for satchel
//!
//! Configuration is stored at `~/.config/satchel/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Bundle build settings
    pub build: BuildConfig,

    /// Environment cache settings
    pub cache: CacheConfig,

    /// Settings applied when a bundle runs
    pub runtime: RuntimeConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable verbose logging
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self { verbose: false }
    }
}

/// Bundle build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Interpreter probed for the platform tag
    pub python: String,

    /// Output directory relative to the project root
    pub output_dir: PathBuf,

    /// Extra file or directory names left out of the payload
    pub exclude: Vec<String>,

    /// Include packages that only belong to non-main groups
    pub include_dev: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            output_dir: PathBuf::from("dist"),
            exclude: vec![],
            include_dev: false,
        }
    }
}

/// Environment cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root (defaults to the platform cache directory)
    pub dir: Option<PathBuf>,

    /// Evict environments published more than N days ago (0 = disabled)
    pub gc_days: u32,

    /// Maximum number of environments kept (0 = unlimited)
    pub max_entries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            gc_days: 30,
            max_entries: 8,
        }
    }
}

/// Runtime configuration for bundles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Interpreter used to install and run bundled applications
    pub python: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
        }
    }
}

//! On-disk layout of the environment cache
//!
//! ```text
//! <root>/
//!   envs/<key>/          published environments
//!   index/<key>.json     CacheIndex records
//!   locks/<key>.lock     build locks + owner records
//!   locks/<key>.use      use leases held by running applications
//!   staging/<key>-<id>/  private build directories
//! ```

use crate::error::{SatchelError, SatchelResult};
use crate::lockfile::Fingerprint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const ENVS_DIR: &str = "envs";
const INDEX_DIR: &str = "index";
const LOCKS_DIR: &str = "locks";
const STAGING_DIR: &str = "staging";

/// Completion marker file name inside an environment
pub const MARKER_FILE: &str = ".satchel-complete";

/// Cache key for one environment (16 hex chars)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentKey(String);

impl EnvironmentKey {
    /// Derive the key from the dependency fingerprint and the payload digest
    pub fn derive(fingerprint: &Fingerprint, source_digest: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(fingerprint.as_str().as_bytes());
        hasher.update(b"\0");
        hasher.update(source_digest.as_bytes());
        Self(hex::encode(&hasher.finalize()[..8]))
    }

    /// Parse a key found on disk
    pub fn parse(s: &str) -> Option<Self> {
        (s.len() == 16 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()))
            .then(|| Self(s.to_string()))
    }

    /// Key as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvironmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Paths under a cache root
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    /// Layout rooted at `root` (nothing is created)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of published environments
    pub fn envs_dir(&self) -> PathBuf {
        self.root.join(ENVS_DIR)
    }

    /// Canonical path of one environment
    pub fn entry_dir(&self, key: &EnvironmentKey) -> PathBuf {
        self.envs_dir().join(key.as_str())
    }

    /// Completion marker of one environment
    pub fn marker_path(&self, key: &EnvironmentKey) -> PathBuf {
        self.entry_dir(key).join(MARKER_FILE)
    }

    /// Directory of index records
    pub fn index_dir(&self) -> PathBuf {
        self.root.join(INDEX_DIR)
    }

    /// Directory of lock files
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join(LOCKS_DIR)
    }

    /// Lock file for one key
    pub fn lock_path(&self, key: &EnvironmentKey) -> PathBuf {
        self.locks_dir().join(format!("{}.lock", key))
    }

    /// Use lease file for one key
    pub fn lease_path(&self, key: &EnvironmentKey) -> PathBuf {
        self.locks_dir().join(format!("{}.use", key))
    }

    /// Directory holding in-progress builds
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// A fresh, uniquely named staging path for `key`
    pub fn new_staging(&self, key: &EnvironmentKey) -> PathBuf {
        self.staging_dir()
            .join(format!("{}-{}", key, uuid::Uuid::new_v4().simple()))
    }

    /// Keys of all directories under `envs/`
    pub fn entry_keys(&self) -> SatchelResult<Vec<EnvironmentKey>> {
        list_keys(&self.envs_dir(), |name| EnvironmentKey::parse(name))
    }

    /// Create the top-level directories
    pub fn ensure_dirs(&self) -> SatchelResult<()> {
        for dir in [
            self.envs_dir(),
            self.index_dir(),
            self.locks_dir(),
            self.staging_dir(),
        ] {
            fs::create_dir_all(&dir)
                .map_err(|e| SatchelError::io(format!("creating {}", dir.display()), e))?;
        }
        Ok(())
    }
}

/// Sorted keys of the entries of `dir` accepted by `parse`; empty if `dir` is missing
pub(crate) fn list_keys<F>(dir: &Path, parse: F) -> SatchelResult<Vec<EnvironmentKey>>
where
    F: Fn(&str) -> Option<EnvironmentKey>,
{
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(SatchelError::io(format!("listing {}", dir.display()), e)),
    };

    let mut keys: Vec<EnvironmentKey> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().and_then(&parse))
        .collect();
    keys.sort();
    Ok(keys)
}

/// Total size of regular files under `path`
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

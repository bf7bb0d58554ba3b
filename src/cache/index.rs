//! CacheIndex: one JSON record per environment key
//!
//! Records are advisory. The completion marker inside an environment is
//! the source of truth for readiness; the index additionally carries
//! failures so processes waiting on a build can learn its outcome.

use crate::cache::layout::{list_keys, CacheLayout, EnvironmentKey};
use crate::error::{SatchelError, SatchelResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Outcome of the last build of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    /// Published and usable
    Ready,
    /// Last build attempt failed
    Failed,
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Index record for one environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub key: EnvironmentKey,
    pub fingerprint: String,
    pub path: PathBuf,
    pub state: IndexState,
    /// When the environment was last published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Failure reason for `Failed` records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Handle on `<cache>/index/`
#[derive(Debug, Clone)]
pub struct CacheIndex {
    dir: PathBuf,
}

impl CacheIndex {
    pub fn new(layout: &CacheLayout) -> Self {
        Self {
            dir: layout.index_dir(),
        }
    }

    fn record_path(&self, key: &EnvironmentKey) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// Read the record for `key`
    ///
    /// Unreadable records are logged and treated as absent.
    pub fn get(&self, key: &EnvironmentKey) -> SatchelResult<Option<IndexRecord>> {
        let path = self.record_path(key);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SatchelError::io(format!("reading {}", path.display()), e)),
        };
        match serde_json::from_str(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("Ignoring unreadable index record {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Record a successful publication
    pub fn mark_ready(
        &self,
        key: &EnvironmentKey,
        fingerprint: &str,
        path: &Path,
    ) -> SatchelResult<IndexRecord> {
        let now = Utc::now();
        let record = IndexRecord {
            key: key.clone(),
            fingerprint: fingerprint.to_string(),
            path: path.to_path_buf(),
            state: IndexState::Ready,
            published_at: Some(now),
            updated_at: now,
            error: None,
        };
        self.write(&record)?;
        Ok(record)
    }

    /// Record a failed build
    pub fn mark_failed(
        &self,
        key: &EnvironmentKey,
        fingerprint: &str,
        path: &Path,
        error: &str,
    ) -> SatchelResult<IndexRecord> {
        let record = IndexRecord {
            key: key.clone(),
            fingerprint: fingerprint.to_string(),
            path: path.to_path_buf(),
            state: IndexState::Failed,
            published_at: None,
            updated_at: Utc::now(),
            error: Some(error.to_string()),
        };
        self.write(&record)?;
        Ok(record)
    }

    /// Delete the record for `key`, if any
    pub fn remove(&self, key: &EnvironmentKey) -> SatchelResult<()> {
        let path = self.record_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SatchelError::io(format!("removing {}", path.display()), e)),
        }
    }

    /// All readable records, sorted by key
    pub fn list(&self) -> SatchelResult<Vec<IndexRecord>> {
        let keys = list_keys(&self.dir, |name| {
            name.strip_suffix(".json").and_then(EnvironmentKey::parse)
        })?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.get(&key)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Write through a temp file + rename so readers never see partial JSON
    fn write(&self, record: &IndexRecord) -> SatchelResult<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| SatchelError::io(format!("creating {}", self.dir.display()), e))?;

        let path = self.record_path(&record.key);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", record.key, uuid::Uuid::new_v4().simple()));
        let content = serde_json::to_string_pretty(record)?;

        fs::write(&tmp, content)
            .map_err(|e| SatchelError::io(format!("writing {}", tmp.display()), e))?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(SatchelError::io(format!("writing {}", path.display()), e));
        }

        debug!("Index {} -> {}", record.key, record.state);
        Ok(())
    }
}

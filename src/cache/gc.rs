//! Listing and eviction of cached environments
//!
//! The warm path never writes, so publication time (from the completion
//! marker) is the only recency signal. Entries are kept newest first up to
//! `max_entries`; anything older than `max_age_days` goes too. An entry is
//! only removed when its build lock and its use lease can both be taken
//! without waiting.

use crate::cache::index::IndexState;
use crate::cache::layout::{dir_size, EnvironmentKey};
use crate::cache::lock::{BuildLock, LockStatus, UseLease};
use crate::cache::manager::{CacheManager, EntryState};
use crate::config::schema::CacheConfig;
use crate::error::{SatchelError, SatchelResult};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};

/// When environments are evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Keep at most this many environments (0 = unlimited)
    pub max_entries: usize,
    /// Evict environments published more than this many days ago (0 = never)
    pub max_age_days: u32,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for EvictionPolicy {
    fn from(config: &CacheConfig) -> Self {
        Self {
            max_entries: config.max_entries as usize,
            max_age_days: config.gc_days,
        }
    }
}

/// Status shown for a cached environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Ready,
    Building,
    Failed,
    Corrupt,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Building => write!(f, "building"),
            Self::Failed => write!(f, "failed"),
            Self::Corrupt => write!(f, "corrupt"),
        }
    }
}

/// One row of `satchel cache list`
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryInfo {
    pub key: EnvironmentKey,
    pub path: PathBuf,
    pub status: EntryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub size_bytes: u64,
}

/// Why an entry was picked for eviction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionReason {
    /// Beyond `max_entries`
    Excess,
    /// Older than `max_age_days`
    Expired,
    /// Marker missing or unreadable
    Corrupt,
    /// Requested by `cache clear`
    Cleared,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Excess => write!(f, "over entry limit"),
            Self::Expired => write!(f, "expired"),
            Self::Corrupt => write!(f, "corrupt"),
            Self::Cleared => write!(f, "cleared"),
        }
    }
}

/// An entry chosen for eviction
#[derive(Debug, Clone, Serialize)]
pub struct EvictionCandidate {
    pub key: EnvironmentKey,
    pub reason: EvictionReason,
    pub published_at: Option<DateTime<Utc>>,
    pub size_bytes: u64,
}

/// What an eviction pass did (or would do, for dry runs)
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvictionReport {
    pub evicted: Vec<EvictionCandidate>,
    /// Candidates skipped because they are running or being built
    pub busy: Vec<EnvironmentKey>,
    /// Staging directories left behind by dead builders
    pub orphans: Vec<PathBuf>,
}

impl EvictionReport {
    /// Bytes freed by evicted entries
    pub fn bytes_freed(&self) -> u64 {
        self.evicted.iter().map(|c| c.size_bytes).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty() && self.orphans.is_empty()
    }
}

impl CacheManager {
    /// Every environment known on disk or in the index
    pub fn entries(&self) -> SatchelResult<Vec<CacheEntryInfo>> {
        let layout = self.layout();
        let mut keys: BTreeSet<EnvironmentKey> = layout.entry_keys()?.into_iter().collect();
        let records = self.index().list()?;
        keys.extend(records.iter().map(|r| r.key.clone()));

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let path = layout.entry_dir(&key);
            let record = records.iter().find(|r| r.key == key);
            let mut info = CacheEntryInfo {
                key: key.clone(),
                path: path.clone(),
                status: EntryStatus::Ready,
                fingerprint: record.map(|r| r.fingerprint.clone()),
                platform: None,
                records: None,
                published_at: record.and_then(|r| r.published_at),
                error: None,
                size_bytes: 0,
            };

            match self.read_marker(&key) {
                EntryState::Ready(marker) => {
                    info.fingerprint = Some(marker.fingerprint);
                    info.platform = Some(marker.platform.to_string());
                    info.records = Some(marker.records);
                    info.published_at = Some(marker.completed_at);
                    info.size_bytes = dir_size(&path);
                }
                EntryState::Corrupt(reason) => {
                    info.status = EntryStatus::Corrupt;
                    info.error = Some(reason);
                    info.size_bytes = dir_size(&path);
                }
                EntryState::Absent => match record {
                    Some(r) if r.state == IndexState::Failed => {
                        info.status = EntryStatus::Failed;
                        info.error = r.error.clone();
                    }
                    // Removed by hand; only worth showing while rebuilding
                    _ => {
                        if matches!(BuildLock::status(layout, &key)?, LockStatus::Held(_)) {
                            info.status = EntryStatus::Building;
                            entries.push(info);
                        }
                        continue;
                    }
                },
            }

            if info.status != EntryStatus::Ready
                && matches!(BuildLock::status(layout, &key)?, LockStatus::Held(_))
            {
                info.status = EntryStatus::Building;
            }
            entries.push(info);
        }
        Ok(entries)
    }

    /// Decide which environments the policy would evict
    pub fn plan_eviction(
        &self,
        policy: &EvictionPolicy,
        keep: Option<&EnvironmentKey>,
        now: DateTime<Utc>,
    ) -> SatchelResult<Vec<EvictionCandidate>> {
        let mut published: Vec<(EnvironmentKey, Option<DateTime<Utc>>)> = self
            .layout()
            .entry_keys()?
            .into_iter()
            .map(|key| {
                let at = match self.read_marker(&key) {
                    EntryState::Ready(marker) => Some(marker.completed_at),
                    _ => None,
                };
                (key, at)
            })
            .collect();

        // Newest first; corrupt entries (no timestamp) sort last
        published.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        // An age past the representable range never expires anything
        let cutoff = (policy.max_age_days > 0)
            .then(|| now.checked_sub_signed(Duration::days(i64::from(policy.max_age_days))))
            .flatten();
        let mut candidates = Vec::new();
        let mut kept = 0usize;

        for (key, published_at) in published {
            if keep == Some(&key) {
                kept += 1;
                continue;
            }
            let reason = match published_at {
                None => Some(EvictionReason::Corrupt),
                Some(at) if cutoff.is_some_and(|c| at < c) => Some(EvictionReason::Expired),
                Some(_) if policy.max_entries > 0 && kept >= policy.max_entries => {
                    Some(EvictionReason::Excess)
                }
                Some(_) => None,
            };
            match reason {
                Some(reason) => candidates.push(EvictionCandidate {
                    size_bytes: dir_size(&self.layout().entry_dir(&key)),
                    key,
                    reason,
                    published_at,
                }),
                None => kept += 1,
            }
        }
        Ok(candidates)
    }

    /// Apply the configured policy, never touching `keep`
    pub fn evict(&self, keep: Option<&EnvironmentKey>, dry_run: bool) -> SatchelResult<EvictionReport> {
        let policy = *self.policy();
        self.evict_with(&policy, keep, dry_run)
    }

    /// Apply `policy`, then sweep orphaned staging directories
    pub fn evict_with(
        &self,
        policy: &EvictionPolicy,
        keep: Option<&EnvironmentKey>,
        dry_run: bool,
    ) -> SatchelResult<EvictionReport> {
        let candidates = self.plan_eviction(policy, keep, Utc::now())?;
        let mut report = self.remove_candidates(candidates, dry_run)?;
        report.orphans = self.sweep_staging(dry_run)?;
        Ok(report)
    }

    /// Remove every environment not currently being built
    pub fn clear(&self, dry_run: bool) -> SatchelResult<EvictionReport> {
        let candidates = self
            .layout()
            .entry_keys()?
            .into_iter()
            .map(|key| {
                let published_at = match self.read_marker(&key) {
                    EntryState::Ready(marker) => Some(marker.completed_at),
                    _ => None,
                };
                EvictionCandidate {
                    size_bytes: dir_size(&self.layout().entry_dir(&key)),
                    key,
                    reason: EvictionReason::Cleared,
                    published_at,
                }
            })
            .collect();

        let mut report = self.remove_candidates(candidates, dry_run)?;
        report.orphans = self.sweep_staging(dry_run)?;
        if !dry_run {
            for record in self.index().list()? {
                if record.state == IndexState::Failed {
                    self.index().remove(&record.key)?;
                }
            }
        }
        Ok(report)
    }

    fn remove_candidates(
        &self,
        candidates: Vec<EvictionCandidate>,
        dry_run: bool,
    ) -> SatchelResult<EvictionReport> {
        let mut report = EvictionReport::default();
        for candidate in candidates {
            if dry_run {
                report.evicted.push(candidate);
                continue;
            }
            let Some(lock) = BuildLock::try_acquire(self.layout(), &candidate.key)? else {
                debug!("Skipping {}: build in progress", candidate.key);
                report.busy.push(candidate.key);
                continue;
            };
            let Some(lease) = UseLease::try_exclusive(self.layout(), &candidate.key)? else {
                lock.release()?;
                debug!("Skipping {}: in use", candidate.key);
                report.busy.push(candidate.key);
                continue;
            };
            let result = self.demote(&candidate.key);
            drop(lease);
            lock.release()?;
            result?;
            info!("Evicted environment {} ({})", candidate.key, candidate.reason);
            report.evicted.push(candidate);
        }
        Ok(report)
    }

    /// Staging directories whose build lock is free belong to dead builds
    fn sweep_staging(&self, dry_run: bool) -> SatchelResult<Vec<PathBuf>> {
        let dir = self.layout().staging_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(SatchelError::io(format!("listing {}", dir.display()), e)),
        };

        let mut orphans = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Some(key) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.get(..16))
                .and_then(EnvironmentKey::parse)
            else {
                continue;
            };

            let Some(lock) = BuildLock::try_acquire(self.layout(), &key)? else {
                continue;
            };
            if !dry_run {
                self.remove_staging(&path);
                lock.release()?;
            }
            orphans.push(path);
        }
        Ok(orphans)
    }
}

//! Environment cache manager
//!
//! Drives one environment key through `ABSENT -> BUILDING -> READY`
//! (or `FAILED`):
//!
//! 1. Warm path: the completion marker at `envs/<key>/` matches the
//!    expected fingerprint. Nothing is written; callers that go on to run
//!    the environment take its shared use lease (`lease`).
//! 2. Otherwise take the key's build lock (waiting if another process
//!    holds it) and check again; the holder may have finished meanwhile.
//! 3. Build in a private staging directory, write the marker last, rename
//!    into place, then record the result in the index.
//!
//! A crash before the rename leaves only a staging directory behind; a
//! crash after it leaves a complete entry even if the index write is lost.

use crate::cache::gc::EvictionPolicy;
use crate::cache::index::{CacheIndex, IndexState};
use crate::cache::layout::{CacheLayout, EnvironmentKey};
use crate::cache::lock::{BuildLock, OwnerRecord, UseLease};
use crate::error::{SatchelError, SatchelResult};
use crate::installer::Installer;
use crate::lockfile::{LockSet, PlatformTag};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Per-record install directories inside an environment
pub const PACKAGES_DIR: &str = "packages";

/// Writes everything except the installed packages into a staging dir
pub trait EnvironmentContent: Send + Sync {
    fn materialize(&self, staging: &Path) -> SatchelResult<()>;
}

/// What environment to make ready
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    pub key: EnvironmentKey,
    pub lockset: LockSet,
    pub source_digest: String,
    /// Interpreter the packages are installed for
    pub python: String,
}

impl EnvironmentSpec {
    pub fn new(lockset: LockSet, source_digest: impl Into<String>, python: impl Into<String>) -> Self {
        let source_digest = source_digest.into();
        Self {
            key: EnvironmentKey::derive(lockset.fingerprint(), &source_digest),
            lockset,
            source_digest,
            python: python.into(),
        }
    }
}

/// Contents of `.satchel-complete`, written last into a staged environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub key: EnvironmentKey,
    pub fingerprint: String,
    pub source_digest: String,
    pub platform: PlatformTag,
    pub python: String,
    pub records: usize,
    pub completed_at: DateTime<Utc>,
}

impl CompletionMarker {
    fn for_spec(spec: &EnvironmentSpec) -> Self {
        Self {
            key: spec.key.clone(),
            fingerprint: spec.lockset.fingerprint().as_str().to_string(),
            source_digest: spec.source_digest.clone(),
            platform: spec.lockset.platform().clone(),
            python: spec.python.clone(),
            records: spec.lockset.len(),
            completed_at: Utc::now(),
        }
    }

    /// Why this marker does not vouch for `spec`, if it doesn't
    fn mismatch(&self, spec: &EnvironmentSpec) -> Option<String> {
        if self.key != spec.key {
            return Some(format!("marker is for key {}", self.key));
        }
        if self.fingerprint != spec.lockset.fingerprint().as_str() {
            return Some(format!(
                "marker fingerprint {} does not match {}",
                self.fingerprint.get(..16).unwrap_or(&self.fingerprint),
                spec.lockset.fingerprint().short()
            ));
        }
        if self.source_digest != spec.source_digest {
            return Some("marker source digest does not match".to_string());
        }
        None
    }
}

/// State of one key on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    /// No environment directory
    Absent,
    /// Complete and matching
    Ready(CompletionMarker),
    /// Directory present but not trustworthy
    Corrupt(String),
}

/// A usable environment
#[derive(Debug, Clone)]
pub struct ReadyEnvironment {
    pub key: EnvironmentKey,
    pub path: PathBuf,
    pub marker: CompletionMarker,
    /// Whether this call built it
    pub built: bool,
}

impl ReadyEnvironment {
    /// Install directory of every record, in lockset order
    pub fn package_dirs(&self, lockset: &LockSet) -> Vec<PathBuf> {
        lockset
            .records()
            .iter()
            .map(|r| self.path.join(PACKAGES_DIR).join(r.dir_name()))
            .collect()
    }
}

/// Owns the cache directory and the state machine over it
#[derive(Debug, Clone)]
pub struct CacheManager {
    layout: CacheLayout,
    index: CacheIndex,
    policy: EvictionPolicy,
}

impl CacheManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let layout = CacheLayout::new(root);
        Self {
            index: CacheIndex::new(&layout),
            layout,
            policy: EvictionPolicy::default(),
        }
    }

    /// Eviction policy applied after each publish
    pub fn with_policy(mut self, policy: EvictionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn index(&self) -> &CacheIndex {
        &self.index
    }

    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    /// Read-only state check for `spec`
    pub fn probe(&self, spec: &EnvironmentSpec) -> EntryState {
        match self.read_marker(&spec.key) {
            EntryState::Ready(marker) => match marker.mismatch(spec) {
                Some(reason) => EntryState::Corrupt(reason),
                None => EntryState::Ready(marker),
            },
            other => other,
        }
    }

    /// Marker state of `key` without an expected fingerprint
    pub fn read_marker(&self, key: &EnvironmentKey) -> EntryState {
        let dir = self.layout.entry_dir(key);
        match fs::symlink_metadata(&dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return EntryState::Corrupt("entry is not a directory".to_string()),
            Err(e) if e.kind() == ErrorKind::NotFound => return EntryState::Absent,
            Err(e) => return EntryState::Corrupt(format!("cannot stat entry: {}", e)),
        }

        let marker_path = self.layout.marker_path(key);
        let content = match fs::read(&marker_path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return EntryState::Corrupt("completion marker missing".to_string())
            }
            Err(e) => return EntryState::Corrupt(format!("cannot read completion marker: {}", e)),
        };
        match serde_json::from_slice(&content) {
            Ok(marker) => EntryState::Ready(marker),
            Err(e) => EntryState::Corrupt(format!("completion marker unreadable: {}", e)),
        }
    }

    /// Return a ready environment for `spec`, building it if needed
    pub async fn ensure(
        &self,
        spec: &EnvironmentSpec,
        installer: &dyn Installer,
        content: &dyn EnvironmentContent,
    ) -> SatchelResult<ReadyEnvironment> {
        match self.probe(spec) {
            EntryState::Ready(marker) => {
                debug!("Environment {} is ready", spec.key);
                return Ok(self.ready(spec, marker, false));
            }
            EntryState::Corrupt(reason) => {
                warn!("Environment {} is unusable ({}); rebuilding", spec.key, reason)
            }
            EntryState::Absent => debug!("Environment {} is absent", spec.key),
        }

        let wait_started = Utc::now();
        let (lock, waited) = BuildLock::acquire(&self.layout, &spec.key).await?;

        let result = self
            .ensure_locked(spec, &lock, waited, wait_started, installer, content)
            .await;

        if let Err(e) = lock.release() {
            warn!("Failed to release build lock for {}: {}", spec.key, e);
        }

        if let Ok(ref env) = result {
            if env.built {
                if let Err(e) = self.evict(Some(&spec.key), false) {
                    debug!("Eviction after publishing {} failed: {}", spec.key, e);
                }
            }
        }
        result
    }

    async fn ensure_locked(
        &self,
        spec: &EnvironmentSpec,
        lock: &BuildLock,
        waited: bool,
        wait_started: DateTime<Utc>,
        installer: &dyn Installer,
        content: &dyn EnvironmentContent,
    ) -> SatchelResult<ReadyEnvironment> {
        if let Some(owner) = lock.previous_owner()? {
            let abandoned = SatchelError::LockAbandoned {
                key: spec.key.to_string(),
                pid: owner.pid,
            };
            warn!("{}; reclaiming", abandoned);
            self.remove_staging(&owner.staging);
            lock.clear_owner()?;
        }

        match self.probe(spec) {
            EntryState::Ready(marker) => {
                debug!("Environment {} was built while waiting", spec.key);
                return Ok(self.ready(spec, marker, false));
            }
            EntryState::Corrupt(reason) => {
                info!("Demoting environment {}: {}", spec.key, reason);
                self.demote(&spec.key)?;
            }
            EntryState::Absent => {}
        }

        if waited {
            if let Some(record) = self.index.get(&spec.key)? {
                if record.state == IndexState::Failed && record.updated_at >= wait_started {
                    return Err(SatchelError::BuildFailed {
                        key: spec.key.to_string(),
                        reason: record.error.unwrap_or_else(|| "unknown error".to_string()),
                    });
                }
            }
        }

        self.build(spec, lock, installer, content).await
    }

    async fn build(
        &self,
        spec: &EnvironmentSpec,
        lock: &BuildLock,
        installer: &dyn Installer,
        content: &dyn EnvironmentContent,
    ) -> SatchelResult<ReadyEnvironment> {
        self.layout.ensure_dirs()?;
        let staging = self.layout.new_staging(&spec.key);
        let canonical = self.layout.entry_dir(&spec.key);
        let fingerprint = spec.lockset.fingerprint().as_str();

        lock.write_owner(&OwnerRecord::current(&staging))?;
        info!(
            "Building environment {} ({} dependencies) with {}",
            spec.key,
            spec.lockset.len(),
            installer.installer_name()
        );

        let staged = match self.populate(spec, &staging, installer, content).await {
            Ok(marker) => fs::rename(&staging, &canonical)
                .map(|()| marker)
                .map_err(|e| {
                    SatchelError::io(
                        format!("publishing {} -> {}", staging.display(), canonical.display()),
                        e,
                    )
                }),
            Err(e) => Err(e),
        };

        let marker = match staged {
            Ok(marker) => marker,
            Err(e) => {
                self.remove_staging(&staging);
                if let Err(index_err) =
                    self.index
                        .mark_failed(&spec.key, fingerprint, &canonical, &e.to_string())
                {
                    warn!("Could not record failure of {}: {}", spec.key, index_err);
                }
                return Err(e);
            }
        };

        if let Err(e) = self.index.mark_ready(&spec.key, fingerprint, &canonical) {
            warn!("Published {} but could not update the index: {}", spec.key, e);
        }
        info!("Published environment {}", spec.key);
        Ok(self.ready(spec, marker, true))
    }

    async fn populate(
        &self,
        spec: &EnvironmentSpec,
        staging: &Path,
        installer: &dyn Installer,
        content: &dyn EnvironmentContent,
    ) -> SatchelResult<CompletionMarker> {
        let packages = staging.join(PACKAGES_DIR);
        fs::create_dir_all(&packages)
            .map_err(|e| SatchelError::io(format!("creating {}", packages.display()), e))?;

        for record in spec.lockset.records() {
            let target = packages.join(record.dir_name());
            fs::create_dir_all(&target)
                .map_err(|e| SatchelError::io(format!("creating {}", target.display()), e))?;
            info!("Installing {}", record);
            installer.install(record, &target).await?;
        }

        content.materialize(staging)?;

        let marker = CompletionMarker::for_spec(spec);
        write_marker(&staging.join(crate::cache::layout::MARKER_FILE), &marker)?;
        Ok(marker)
    }

    /// Hold `spec`'s published environment against eviction
    ///
    /// Fails with `CorruptEnvironment` if the entry was removed or damaged
    /// before the lease was taken; the caller rebuilds and leases again.
    pub async fn lease(&self, spec: &EnvironmentSpec) -> SatchelResult<UseLease> {
        let lease = UseLease::acquire_shared(&self.layout, &spec.key).await?;
        let reason = match self.probe(spec) {
            EntryState::Ready(_) => return Ok(lease),
            EntryState::Absent => "evicted before use".to_string(),
            EntryState::Corrupt(reason) => reason,
        };
        Err(SatchelError::CorruptEnvironment {
            path: self.layout.entry_dir(&spec.key),
            reason,
        })
    }

    /// Drop the environment for `key` so the next `ensure` rebuilds it
    pub async fn invalidate(&self, key: &EnvironmentKey) -> SatchelResult<()> {
        let (lock, _) = BuildLock::acquire(&self.layout, key).await?;
        let result = self.demote(key);
        lock.release()?;
        result
    }

    /// Move an entry out of `envs/` and delete it; caller holds the lock
    pub(crate) fn demote(&self, key: &EnvironmentKey) -> SatchelResult<()> {
        let canonical = self.layout.entry_dir(key);
        if fs::symlink_metadata(&canonical).is_ok() {
            fs::create_dir_all(self.layout.staging_dir()).map_err(|e| {
                SatchelError::io(format!("creating {}", self.layout.staging_dir().display()), e)
            })?;
            let graveyard = self.layout.new_staging(key);
            fs::rename(&canonical, &graveyard).map_err(|e| {
                SatchelError::io(format!("moving aside {}", canonical.display()), e)
            })?;
            self.remove_staging(&graveyard);
            debug!("Removed environment {}", key);
        }
        self.index.remove(key)
    }

    /// Best-effort removal of a directory under `staging/`
    pub(crate) fn remove_staging(&self, path: &Path) {
        if path.as_os_str().is_empty() || !path.starts_with(self.layout.staging_dir()) {
            return;
        }
        match fs::remove_dir_all(path) {
            Ok(()) => debug!("Removed {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", path.display(), e),
        }
    }

    fn ready(&self, spec: &EnvironmentSpec, marker: CompletionMarker, built: bool) -> ReadyEnvironment {
        ReadyEnvironment {
            key: spec.key.clone(),
            path: self.layout.entry_dir(&spec.key),
            marker,
            built,
        }
    }
}

fn write_marker(path: &Path, marker: &CompletionMarker) -> SatchelResult<()> {
    let io_err = |e| SatchelError::io(format!("writing {}", path.display()), e);
    let content = serde_json::to_vec_pretty(marker)?;
    let mut file = File::create(path).map_err(io_err)?;
    file.write_all(&content).map_err(io_err)?;
    file.sync_all().map_err(io_err)
}

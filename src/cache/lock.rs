//! Per-key locks
//!
//! Two OS advisory locks (`flock` on unix) guard each key:
//!
//! - `locks/<key>.lock`, the build lock. The holder writes an owner record
//!   into the file and truncates it on clean release. The OS drops the
//!   lock when a process dies, so a lock that can be taken while still
//!   carrying an owner record was abandoned mid-build.
//! - `locks/<key>.use`, the use lease. Every process running from a
//!   published environment holds it shared for its whole lifetime
//!   (including across `exec`); removal takes it exclusively.

use crate::cache::layout::{CacheLayout, EnvironmentKey};
use crate::error::{SatchelError, SatchelResult};
use chrono::{DateTime, Utc};
use fs4::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Who is building an environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub pid: u32,
    pub host: String,
    pub started_at: DateTime<Utc>,
    /// Staging directory of the build
    pub staging: PathBuf,
}

impl OwnerRecord {
    /// Record for the current process
    pub fn current(staging: &Path) -> Self {
        Self {
            pid: std::process::id(),
            host: hostname(),
            started_at: Utc::now(),
            staging: staging.to_path_buf(),
        }
    }
}

/// Lock state as seen without blocking
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    /// Nobody holds the lock
    Free,
    /// Another process holds the lock
    Held(Option<OwnerRecord>),
    /// Free, but the last holder died mid-build
    Abandoned(OwnerRecord),
}

/// An acquired build lock; released on drop
#[derive(Debug)]
pub struct BuildLock {
    file: File,
    path: PathBuf,
    key: EnvironmentKey,
}

impl BuildLock {
    fn open(layout: &CacheLayout, key: &EnvironmentKey) -> SatchelResult<(File, PathBuf)> {
        let path = layout.lock_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SatchelError::io(format!("creating {}", parent.display()), e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| SatchelError::io(format!("opening lock {}", path.display()), e))?;
        Ok((file, path))
    }

    /// Take the lock if it is free
    pub fn try_acquire(layout: &CacheLayout, key: &EnvironmentKey) -> SatchelResult<Option<Self>> {
        let (file, path) = Self::open(layout, key)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Acquired build lock {}", path.display());
                Ok(Some(Self {
                    file,
                    path,
                    key: key.clone(),
                }))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(SatchelError::io(format!("locking {}", path.display()), e)),
        }
    }

    /// Block until the lock is ours
    pub fn acquire_blocking(layout: &CacheLayout, key: &EnvironmentKey) -> SatchelResult<Self> {
        let (file, path) = Self::open(layout, key)?;
        file.lock_exclusive()
            .map_err(|e| SatchelError::io(format!("locking {}", path.display()), e))?;
        debug!("Acquired build lock {} after waiting", path.display());
        Ok(Self {
            file,
            path,
            key: key.clone(),
        })
    }

    /// Acquire without blocking the async runtime
    ///
    /// Returns the lock and whether another process had to be waited for.
    pub async fn acquire(layout: &CacheLayout, key: &EnvironmentKey) -> SatchelResult<(Self, bool)> {
        if let Some(lock) = Self::try_acquire(layout, key)? {
            return Ok((lock, false));
        }

        match Self::read_owner_at(&layout.lock_path(key)) {
            Some(owner) => warn!(
                "Waiting for pid {} on {} to finish building environment {}",
                owner.pid, owner.host, key
            ),
            None => warn!("Waiting for another process to finish building environment {}", key),
        }

        let layout = layout.clone();
        let key = key.clone();
        let lock = tokio::task::spawn_blocking(move || Self::acquire_blocking(&layout, &key))
            .await
            .map_err(|e| SatchelError::Internal(format!("lock wait task failed: {}", e)))??;
        Ok((lock, true))
    }

    /// Inspect a key's lock without waiting
    pub fn status(layout: &CacheLayout, key: &EnvironmentKey) -> SatchelResult<LockStatus> {
        if !layout.lock_path(key).exists() {
            return Ok(LockStatus::Free);
        }
        match Self::try_acquire(layout, key)? {
            Some(lock) => Ok(match lock.previous_owner()? {
                Some(owner) => LockStatus::Abandoned(owner),
                None => LockStatus::Free,
            }),
            None => Ok(LockStatus::Held(Self::read_owner_at(&layout.lock_path(key)))),
        }
    }

    /// Key this lock protects
    pub fn key(&self) -> &EnvironmentKey {
        &self.key
    }

    /// Owner record left in the file by an earlier holder
    ///
    /// A clean release truncates the file, so any record found here
    /// belongs to a build that never finished.
    pub fn previous_owner(&self) -> SatchelResult<Option<OwnerRecord>> {
        let mut content = String::new();
        (&self.file)
            .seek(SeekFrom::Start(0))
            .and_then(|_| (&self.file).read_to_string(&mut content))
            .map_err(|e| SatchelError::io(format!("reading {}", self.path.display()), e))?;

        if content.trim().is_empty() {
            return Ok(None);
        }
        match serde_json::from_str(&content) {
            Ok(owner) => Ok(Some(owner)),
            Err(e) => {
                warn!("Unreadable owner record in {}: {}", self.path.display(), e);
                Ok(Some(OwnerRecord {
                    pid: 0,
                    host: String::new(),
                    started_at: DateTime::<Utc>::UNIX_EPOCH,
                    staging: PathBuf::new(),
                }))
            }
        }
    }

    /// Record the current process as the builder
    pub fn write_owner(&self, owner: &OwnerRecord) -> SatchelResult<()> {
        let content = serde_json::to_vec(owner)?;
        let io_err = |e| SatchelError::io(format!("writing {}", self.path.display()), e);
        self.file.set_len(0).map_err(io_err)?;
        (&self.file).seek(SeekFrom::Start(0)).map_err(io_err)?;
        (&self.file).write_all(&content).map_err(io_err)?;
        self.file.sync_data().map_err(io_err)
    }

    /// Forget any owner record
    pub fn clear_owner(&self) -> SatchelResult<()> {
        self.file
            .set_len(0)
            .map_err(|e| SatchelError::io(format!("clearing {}", self.path.display()), e))
    }

    /// Clear the owner record and release the lock
    pub fn release(self) -> SatchelResult<()> {
        self.clear_owner()?;
        debug!("Released build lock {}", self.path.display());
        Ok(())
    }

    fn read_owner_at(path: &Path) -> Option<OwnerRecord> {
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!("Unlocking {} failed: {}", self.path.display(), e);
        }
    }
}

/// Shared or exclusive hold on a key's use lease
///
/// The lock belongs to the open descriptor, so it is released when the
/// last process holding the descriptor closes it, not on an explicit
/// unlock that would also drop it for an `exec`'d successor.
#[derive(Debug)]
pub struct UseLease {
    file: File,
    path: PathBuf,
}

impl UseLease {
    fn open(layout: &CacheLayout, key: &EnvironmentKey) -> SatchelResult<(File, PathBuf)> {
        let path = layout.lease_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SatchelError::io(format!("creating {}", parent.display()), e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| SatchelError::io(format!("opening lease {}", path.display()), e))?;
        Ok((file, path))
    }

    /// Hold the lease shared, waiting out a removal in progress
    pub async fn acquire_shared(layout: &CacheLayout, key: &EnvironmentKey) -> SatchelResult<Self> {
        let (file, path) = Self::open(layout, key)?;
        match FileExt::try_lock_shared(&file) {
            Ok(()) => return Ok(Self { file, path }),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(SatchelError::io(format!("locking {}", path.display()), e)),
        }

        debug!("Environment {} is being removed; waiting", key);
        tokio::task::spawn_blocking(move || match FileExt::lock_shared(&file) {
            Ok(()) => Ok(Self { file, path }),
            Err(e) => Err(SatchelError::io(format!("locking {}", path.display()), e)),
        })
        .await
        .map_err(|e| SatchelError::Internal(format!("lease wait task failed: {}", e)))?
    }

    /// Hold the lease exclusively if no process is using the environment
    pub fn try_exclusive(layout: &CacheLayout, key: &EnvironmentKey) -> SatchelResult<Option<Self>> {
        let (file, path) = Self::open(layout, key)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file, path })),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(SatchelError::io(format!("locking {}", path.display()), e)),
        }
    }

    /// Let the lease descriptor survive `exec`, so the replacement process
    /// keeps holding it until it exits
    #[cfg(unix)]
    pub fn keep_across_exec(&self) -> SatchelResult<()> {
        use std::os::unix::io::AsRawFd;
        let fd = self.file.as_raw_fd();
        // SAFETY: `fd` belongs to `self.file`, which is open for both calls
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        let rc = if flags < 0 {
            flags
        } else {
            unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) }
        };
        if rc < 0 {
            return Err(SatchelError::io(
                format!("sharing lease {} with the application", self.path.display()),
                io::Error::last_os_error(),
            ));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn keep_across_exec(&self) -> SatchelResult<()> {
        Ok(())
    }
}

#[cfg(unix)]
fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return String::from("localhost");
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| String::from("localhost"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key() -> EnvironmentKey {
        EnvironmentKey::parse("0123456789abcdef").unwrap()
    }

    #[test]
    fn second_try_acquire_fails_while_held() {
        let dir = TempDir::new().unwrap();
        let layout = CacheLayout::new(dir.path());

        let lock = BuildLock::try_acquire(&layout, &key()).unwrap().unwrap();
        assert!(BuildLock::try_acquire(&layout, &key()).unwrap().is_none());
        assert!(matches!(
            BuildLock::status(&layout, &key()).unwrap(),
            LockStatus::Held(_)
        ));

        lock.release().unwrap();
        assert!(BuildLock::try_acquire(&layout, &key()).unwrap().is_some());
    }

    #[test]
    fn clean_release_leaves_no_owner() {
        let dir = TempDir::new().unwrap();
        let layout = CacheLayout::new(dir.path());

        let lock = BuildLock::try_acquire(&layout, &key()).unwrap().unwrap();
        lock.write_owner(&OwnerRecord::current(Path::new("/staging/x")))
            .unwrap();
        lock.release().unwrap();

        let lock = BuildLock::try_acquire(&layout, &key()).unwrap().unwrap();
        assert_eq!(lock.previous_owner().unwrap(), None);
        assert_eq!(BuildLock::status(&layout, &key()).unwrap(), LockStatus::Free);
        drop(lock);
    }

    #[test]
    fn dropped_lock_keeps_owner_record() {
        let dir = TempDir::new().unwrap();
        let layout = CacheLayout::new(dir.path());
        let owner = OwnerRecord::current(Path::new("/staging/y"));

        let lock = BuildLock::try_acquire(&layout, &key()).unwrap().unwrap();
        lock.write_owner(&owner).unwrap();
        drop(lock);

        assert_eq!(
            BuildLock::status(&layout, &key()).unwrap(),
            LockStatus::Abandoned(owner.clone())
        );
        let lock = BuildLock::try_acquire(&layout, &key()).unwrap().unwrap();
        assert_eq!(lock.previous_owner().unwrap(), Some(owner));
    }

    #[test]
    fn missing_lock_file_is_free() {
        let dir = TempDir::new().unwrap();
        let layout = CacheLayout::new(dir.path());
        assert_eq!(BuildLock::status(&layout, &key()).unwrap(), LockStatus::Free);
        assert!(!layout.lock_path(&key()).exists());
    }

    #[tokio::test]
    async fn shared_lease_blocks_exclusive() {
        let dir = TempDir::new().unwrap();
        let layout = CacheLayout::new(dir.path());

        let first = UseLease::acquire_shared(&layout, &key()).await.unwrap();
        let second = UseLease::acquire_shared(&layout, &key()).await.unwrap();
        assert!(UseLease::try_exclusive(&layout, &key()).unwrap().is_none());

        drop(first);
        assert!(UseLease::try_exclusive(&layout, &key()).unwrap().is_none());
        drop(second);
        assert!(UseLease::try_exclusive(&layout, &key()).unwrap().is_some());
    }

    #[tokio::test]
    async fn shared_lease_waits_for_removal() {
        let dir = TempDir::new().unwrap();
        let layout = CacheLayout::new(dir.path());
        let removing = UseLease::try_exclusive(&layout, &key()).unwrap().unwrap();

        let user = {
            let layout = layout.clone();
            tokio::spawn(async move { UseLease::acquire_shared(&layout, &key()).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!user.is_finished());

        drop(removing);
        user.await.unwrap().unwrap();
    }

    #[cfg(unix)]
    #[test]
    #[serial_test::serial]
    fn lease_survives_exec() {
        use std::process::Command;
        let dir = TempDir::new().unwrap();
        let layout = CacheLayout::new(dir.path());

        let lease = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(UseLease::acquire_shared(&layout, &key()))
            .unwrap();
        lease.keep_across_exec().unwrap();

        // The child inherits the locked descriptor and outlives our handle
        let mut child = Command::new("sleep").arg("1").spawn().unwrap();
        drop(lease);
        assert!(UseLease::try_exclusive(&layout, &key()).unwrap().is_none());

        child.wait().unwrap();
        assert!(UseLease::try_exclusive(&layout, &key()).unwrap().is_some());
    }

    #[tokio::test]
    async fn async_acquire_waits_for_holder() {
        let dir = TempDir::new().unwrap();
        let layout = CacheLayout::new(dir.path());
        let held = BuildLock::try_acquire(&layout, &key()).unwrap().unwrap();

        let waiter = {
            let layout = layout.clone();
            tokio::spawn(async move { BuildLock::acquire(&layout, &key()).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        held.release().unwrap();
        let (_lock, waited) = waiter.await.unwrap().unwrap();
        assert!(waited);
    }
}

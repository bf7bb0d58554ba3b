//! Lockfile reading and dependency fingerprinting
//!
//! Reads a project's `poetry.lock` into an ordered set of
//! [`DependencyRecord`]s and derives the [`Fingerprint`] that keys the
//! runtime environment cache. Same records + same platform = same
//! fingerprint, whatever order the lockfile lists them in.

pub mod reader;
pub mod record;

pub use reader::{parse_lockfile, read_lockfile, read_lockset, ReadOptions, LOCKFILE_NAME};
pub use record::{
    normalize_name, DependencyRecord, Fingerprint, LockSet, LockedFile, PlatformTag, Source,
};

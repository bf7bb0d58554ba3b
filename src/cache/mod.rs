//! Machine-local cache of installed environments
//!
//! One environment per [`EnvironmentKey`], derived from the lockset
//! fingerprint and the bundled source digest. Environments are immutable
//! once published; a changed lockfile or source tree produces a new key.
//!
//! # Entry States
//!
//! | State | On disk | Description |
//! |-------|---------|-------------|
//! | Absent | nothing at `envs/<key>` | Next run builds it |
//! | Building | `staging/<key>-<id>` + held lock | One process installs, others wait |
//! | Ready | `envs/<key>` with matching marker | Used as-is under a shared use lease, no writes |
//! | Failed | index record only | Waiters get the error; later runs retry |
//!
//! A `Ready` entry whose marker is missing or does not match is demoted to
//! `Absent` and rebuilt. Eviction only removes a `Ready` entry while no
//! process holds its use lease.

pub mod gc;
pub mod index;
pub mod layout;
pub mod lock;
pub mod manager;

pub use gc::{CacheEntryInfo, EntryStatus, EvictionPolicy, EvictionReport};
pub use index::{CacheIndex, IndexRecord, IndexState};
pub use layout::{format_bytes, CacheLayout, EnvironmentKey, MARKER_FILE};
pub use lock::{BuildLock, LockStatus, OwnerRecord, UseLease};
pub use manager::{
    CacheManager, CompletionMarker, EntryState, EnvironmentContent, EnvironmentSpec,
    ReadyEnvironment, PACKAGES_DIR,
};
